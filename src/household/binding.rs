//! Chat binding: which conversation receives scheduled notifications.
//!
//! A free-text message starting with the control prefix ("bot ...") binds
//! the sending chat. If it also mentions the identify keyword the bot only
//! reports the chat id and leaves the binding alone. Anything else is
//! echoed back.

use regex::{Regex, RegexBuilder};
use tracing::info;

use crate::household::composer::{ComposedMessage, Composer};

/// What to do with an inbound free-text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// The sender's chat is now the notification target.
    Rebind { chat_id: i64, confirmation: ComposedMessage },
    /// Reply to the sender with this message.
    Respond(ComposedMessage),
    /// Reply with the identical text.
    Echo(String),
    Ignore,
}

/// Control keywords recognized in inbound text.
#[derive(Debug, Clone)]
pub struct ControlPattern {
    prefix: Regex,
    identify: Regex,
}

impl ControlPattern {
    pub fn new(prefix: &str, identify_keyword: &str, case_sensitive: bool) -> Result<Self, regex::Error> {
        let prefix = RegexBuilder::new(&format!(r"^\s*{}\b", regex::escape(prefix)))
            .case_insensitive(!case_sensitive)
            .build()?;
        let identify = RegexBuilder::new(&format!(r"\b{}\b", regex::escape(identify_keyword)))
            .case_insensitive(!case_sensitive)
            .build()?;
        Ok(Self { prefix, identify })
    }

    /// Text after the control prefix, if `text` is a control message.
    fn strip<'a>(&self, text: &'a str) -> Option<&'a str> {
        self.prefix.find(text).map(|m| &text[m.end()..])
    }
}

/// Single-slot registry of the active chat. Rebinding overwrites.
#[derive(Debug)]
pub struct ChatBinding {
    active_chat_id: Option<i64>,
    pattern: ControlPattern,
}

impl ChatBinding {
    pub fn new(pattern: ControlPattern) -> Self {
        Self { active_chat_id: None, pattern }
    }

    pub fn active_chat_id(&self) -> Option<i64> {
        self.active_chat_id
    }

    /// Classify an inbound free-text message and apply any rebinding.
    pub fn on_inbound(&mut self, text: &str, sender_chat_id: i64, composer: &Composer) -> Action {
        if text.trim().is_empty() {
            return Action::Ignore;
        }

        let Some(rest) = self.pattern.strip(text) else {
            return Action::Echo(text.to_string());
        };

        if self.pattern.identify.is_match(rest) {
            return Action::Respond(composer.reply(&format!("This chat ID: {}", sender_chat_id)));
        }

        let previous = self.active_chat_id.replace(sender_chat_id);
        info!("Chat binding {:?} -> {}", previous, sender_chat_id);
        Action::Rebind {
            chat_id: sender_chat_id,
            confirmation: composer.reply(&format!(
                "Ab jetzt gehen die Erinnerungen an diesen Chat ({}).",
                sender_chat_id
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(case_sensitive: bool) -> ChatBinding {
        ChatBinding::new(ControlPattern::new("bot", "identify", case_sensitive).unwrap())
    }

    #[test]
    fn test_identify_reports_chat_id() {
        let mut b = binding(false);
        let action = b.on_inbound("bot identify", 42, &Composer::default());
        match action {
            Action::Respond(msg) => assert!(msg.text().contains("42")),
            other => panic!("expected Respond, got {:?}", other),
        }
        assert_eq!(b.active_chat_id(), None);
    }

    #[test]
    fn test_plain_text_is_echoed() {
        let mut b = binding(false);
        assert_eq!(b.on_inbound("hello", 99, &Composer::default()), Action::Echo("hello".into()));
        assert_eq!(b.active_chat_id(), None);
    }

    #[test]
    fn test_control_message_rebinds() {
        let mut b = binding(false);
        let action = b.on_inbound("bot hi", 99, &Composer::default());
        assert!(matches!(action, Action::Rebind { chat_id: 99, .. }));
        assert_eq!(b.active_chat_id(), Some(99));
    }

    #[test]
    fn test_rebind_overwrites() {
        let mut b = binding(false);
        b.on_inbound("bot", 1, &Composer::default());
        b.on_inbound("bot here", 2, &Composer::default());
        assert_eq!(b.active_chat_id(), Some(2));
    }

    #[test]
    fn test_sequence_from_identify_to_rebind() {
        let mut b = binding(false);
        let composer = Composer::default();
        assert!(matches!(b.on_inbound("bot identify", 42, &composer), Action::Respond(_)));
        assert!(matches!(b.on_inbound("hello", 99, &composer), Action::Echo(_)));
        assert!(matches!(b.on_inbound("bot hi", 99, &composer), Action::Rebind { .. }));
        assert_eq!(b.active_chat_id(), Some(99));
    }

    #[test]
    fn test_prefix_needs_word_boundary() {
        let mut b = binding(false);
        assert!(matches!(b.on_inbound("bottle of wine", 5, &Composer::default()), Action::Echo(_)));
        assert_eq!(b.active_chat_id(), None);
    }

    #[test]
    fn test_case_insensitive_by_default() {
        let mut b = binding(false);
        assert!(matches!(b.on_inbound("Bot IDENTIFY", 7, &Composer::default()), Action::Respond(_)));
    }

    #[test]
    fn test_case_sensitive_variant() {
        let mut b = binding(true);
        assert!(matches!(b.on_inbound("Bot hi", 7, &Composer::default()), Action::Echo(_)));
        assert!(matches!(b.on_inbound("bot hi", 7, &Composer::default()), Action::Rebind { .. }));
    }

    #[test]
    fn test_blank_is_ignored() {
        let mut b = binding(false);
        assert_eq!(b.on_inbound("   ", 7, &Composer::default()), Action::Ignore);
    }

    #[test]
    fn test_prefix_is_escaped() {
        let mut b = ChatBinding::new(ControlPattern::new("wg.bot", "id", false).unwrap());
        assert!(matches!(b.on_inbound("wgxbot hi", 3, &Composer::default()), Action::Echo(_)));
        assert!(matches!(b.on_inbound("wg.bot id", 3, &Composer::default()), Action::Respond(_)));
    }
}
