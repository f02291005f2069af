//! Slash commands: /meme, /identify and a reply for anything unknown.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tracing::{info, warn};

use crate::household::composer::Composer;
use crate::household::transport::{TelegramTransport, deliver};

#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "Available commands:")]
pub enum Command {
    #[command(description = "Send a random meme")]
    Meme,
    #[command(description = "Show the ID of this chat")]
    Identify,
}

const COMING_SOON: &str = "Coming soon";

/// A meme as returned by the meme API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Meme {
    pub title: String,
    pub url: String,
}

#[derive(Debug)]
pub enum MemeError {
    Http(reqwest::Error),
    Status(u16),
}

impl fmt::Display for MemeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(e) => write!(f, "meme request failed: {}", e),
            Self::Status(code) => write!(f, "meme API returned status {}", code),
        }
    }
}

impl std::error::Error for MemeError {}

pub struct MemeClient {
    url: String,
    client: reqwest::Client,
}

impl MemeClient {
    pub fn new(url: String, timeout: Duration) -> Result<Self, MemeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(MemeError::Http)?;
        Ok(Self { url, client })
    }

    pub async fn fetch(&self) -> Result<Meme, MemeError> {
        let response = self.client.get(&self.url).send().await.map_err(MemeError::Http)?;
        if !response.status().is_success() {
            return Err(MemeError::Status(response.status().as_u16()));
        }
        response.json::<Meme>().await.map_err(MemeError::Http)
    }
}

/// Everything the command handlers need.
pub struct CommandState {
    pub composer: Composer,
    pub transport: TelegramTransport,
    pub memes: Option<MemeClient>,
    pub send_timeout: Duration,
}

pub fn identify_body(chat_id: i64) -> String {
    format!("This chat ID: {}", chat_id)
}

pub fn unknown_body() -> String {
    let names: Vec<String> = Command::bot_commands()
        .iter()
        .map(|c| format!("/{}", c.command.trim_start_matches('/')))
        .collect();
    format!("Available commands are: {}", names.join(", "))
}

pub fn meme_body(meme: &Meme) -> String {
    format!("{}\n{}", meme.title, meme.url)
}

pub async fn handle_command(msg: Message, cmd: Command, state: Arc<CommandState>) -> ResponseResult<()> {
    let chat_id = msg.chat.id.0;
    info!("Command {:?} from chat {}", cmd, chat_id);

    let body = match cmd {
        Command::Identify => identify_body(chat_id),
        Command::Meme => match state.memes {
            Some(ref memes) => match memes.fetch().await {
                Ok(meme) => meme_body(&meme),
                Err(e) => {
                    warn!("Meme fetch failed: {}", e);
                    COMING_SOON.to_string()
                }
            },
            None => COMING_SOON.to_string(),
        },
    };

    reply(&state, chat_id, &body).await;
    Ok(())
}

/// Any slash command that didn't parse as a [`Command`].
pub async fn handle_unknown_command(msg: Message, state: Arc<CommandState>) -> ResponseResult<()> {
    let chat_id = msg.chat.id.0;
    info!("Unknown command {:?} from chat {}", msg.text(), chat_id);
    reply(&state, chat_id, &unknown_body()).await;
    Ok(())
}

async fn reply(state: &CommandState, chat_id: i64, body: &str) {
    let message = state.composer.reply(body);
    // Failures are already logged by deliver
    let _ = deliver(&state.transport, chat_id, &message.text(), state.send_timeout).await;
}
