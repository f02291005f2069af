//! Message composition for outbound notifications.
//!
//! Every message the bot sends starts with a random greeting. Scheduled
//! notifications may additionally carry a farewell and a signature line.

use std::fmt;

use rand::Rng;
use rand::seq::SliceRandom;

pub const GREETINGS: &[&str] = &[
    "Tschau!",
    "Ciao!",
    "Liebe Lieben,",
    "Servus!",
    "Habediehre!",
    "Sehr Geehrte Herren,",
];

pub const FAREWELLS: &[&str] = &[
    "Bis bald!",
    "Machs guet!",
    "Liebi Grüess",
    "En schöne Abig!",
    "Adieu!",
];

/// A finished message, one entry per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedMessage {
    lines: Vec<String>,
}

impl ComposedMessage {
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// The text as sent over the wire.
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

impl fmt::Display for ComposedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

/// Build a message: greeting, body, then the optional farewell and signature.
pub fn compose<R: Rng + ?Sized>(
    body: &str,
    signature: Option<&str>,
    include_farewell: bool,
    rng: &mut R,
) -> ComposedMessage {
    let mut lines = Vec::with_capacity(4);
    lines.push(pick(GREETINGS, rng).to_string());
    lines.push(body.to_string());
    if include_farewell {
        lines.push(pick(FAREWELLS, rng).to_string());
    }
    if let Some(signature) = signature {
        lines.push(signature.to_string());
    }
    ComposedMessage { lines }
}

fn pick<'a, R: Rng + ?Sized>(choices: &[&'a str], rng: &mut R) -> &'a str {
    // Both tables are non-empty constants
    choices.choose(rng).copied().unwrap_or_default()
}

/// Composer settings shared by everything that sends scheduled messages.
#[derive(Debug, Clone, Default)]
pub struct Composer {
    pub signature: Option<String>,
    pub include_farewell: bool,
}

impl Composer {
    pub fn new(signature: Option<String>, include_farewell: bool) -> Self {
        Self { signature, include_farewell }
    }

    /// Decorated notification using the configured farewell/signature.
    pub fn notification(&self, body: &str) -> ComposedMessage {
        compose(body, self.signature.as_deref(), self.include_farewell, &mut rand::thread_rng())
    }

    /// Greeting and body only, for replies and announcements.
    pub fn reply(&self, body: &str) -> ComposedMessage {
        compose(body, None, false, &mut rand::thread_rng())
    }
}
