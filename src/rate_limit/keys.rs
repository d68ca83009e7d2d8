//! Key extractors: partition rate limits by message attributes.

use crate::{Message, Target};

/// How a rate-limit key is derived from the message being sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyExtractor {
    /// One shared limit for everything.
    Global,
    /// Per message id (effectively per message).
    MessageId,
    /// Per body format.
    Format,
    /// Per the first target's kind.
    TargetType,
    /// Concatenation of several extractors, `:`-joined.
    Composite(Vec<KeyExtractor>),
}

impl KeyExtractor {
    pub fn extract(&self, message: &Message, targets: &[Target]) -> String {
        match self {
            KeyExtractor::Global => "global".to_string(),
            KeyExtractor::MessageId => message.id.clone(),
            KeyExtractor::Format => format!("format:{:?}", message.format).to_lowercase(),
            KeyExtractor::TargetType => match targets.first() {
                Some(target) => format!("target:{}", target.kind),
                None => "target:none".to_string(),
            },
            KeyExtractor::Composite(parts) => parts
                .iter()
                .map(|p| p.extract(message, targets))
                .collect::<Vec<_>>()
                .join(":"),
        }
    }
}
