//! Logical message and delivery target model.
//!
//! A [`Message`] is immutable once enqueued; callers construct it through
//! [`MessageBuilder`]. Targets validate per kind and can be auto-detected
//! from a bare value string.

use crate::NotifyError;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

/// Body format of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    #[default]
    Text,
    Markdown,
    Html,
}

/// Dispatch priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// Kind of delivery endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Email,
    Phone,
    User,
    Group,
    Channel,
    Webhook,
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TargetKind::Email => "email",
            TargetKind::Phone => "phone",
            TargetKind::User => "user",
            TargetKind::Group => "group",
            TargetKind::Channel => "channel",
            TargetKind::Webhook => "webhook",
        };
        f.write_str(s)
    }
}

/// A single delivery endpoint.
///
/// `platform` may be empty, meaning the router picks one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub kind: TargetKind,
    pub value: String,
    #[serde(default)]
    pub platform: String,
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$").expect("email pattern")
    })
}

fn phone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\+[1-9]\d{1,14}$").expect("phone pattern"))
}

impl Target {
    pub fn new(kind: TargetKind, value: impl Into<String>, platform: impl Into<String>) -> Self {
        Self { kind, value: value.into(), platform: platform.into() }
    }

    pub fn email(value: impl Into<String>) -> Self {
        Self::new(TargetKind::Email, value, "email")
    }

    pub fn phone(value: impl Into<String>) -> Self {
        Self::new(TargetKind::Phone, value, "sms")
    }

    pub fn webhook(value: impl Into<String>) -> Self {
        Self::new(TargetKind::Webhook, value, "webhook")
    }

    /// Auto-detect the target kind and platform from a bare value.
    ///
    /// Detection never alters the value, so it is idempotent.
    pub fn detect(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.contains('@') && value.contains('.') {
            Self::new(TargetKind::Email, value, "email")
        } else if value.starts_with('+') && value.len() > 5 {
            Self::new(TargetKind::Phone, value, "sms")
        } else if value.starts_with("http://") || value.starts_with("https://") {
            Self::new(TargetKind::Webhook, value, "webhook")
        } else if value.starts_with("ou_") || value.starts_with("oc_") {
            Self::new(TargetKind::User, value, "feishu")
        } else if value.starts_with("og_") {
            Self::new(TargetKind::Group, value, "feishu")
        } else {
            Self::new(TargetKind::User, value, "auto")
        }
    }

    /// Validate the value against the pattern for its kind.
    pub fn validate(&self) -> Result<(), NotifyError> {
        if self.value.is_empty() {
            return Err(NotifyError::Validation("target value is empty".into()));
        }
        match self.kind {
            TargetKind::Email => {
                if !email_re().is_match(&self.value) {
                    return Err(NotifyError::Validation(format!(
                        "invalid email address: {}",
                        self.value
                    )));
                }
            }
            TargetKind::Phone => {
                if !phone_re().is_match(&self.value) {
                    return Err(NotifyError::Validation(format!(
                        "invalid E.164 phone number: {}",
                        self.value
                    )));
                }
            }
            TargetKind::Webhook => {
                if !self.value.starts_with("http://") && !self.value.starts_with("https://") {
                    return Err(NotifyError::Validation(format!(
                        "webhook url must start with http:// or https://: {}",
                        self.value
                    )));
                }
            }
            TargetKind::User | TargetKind::Group | TargetKind::Channel => {
                if self.value.len() < 2 {
                    return Err(NotifyError::Validation(format!(
                        "{} id too short: {}",
                        self.kind, self.value
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A logical notification, immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub format: MessageFormat,
    #[serde(default)]
    pub priority: Priority,
    pub targets: Vec<Target>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub platform_data: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_duration_millis")]
    pub delay: Option<Duration>,
}

mod opt_duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

impl Message {
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// When the message becomes due. `scheduled_at` wins over `delay`;
    /// neither means immediate.
    pub fn due_delay(&self, now: DateTime<Utc>) -> Option<Duration> {
        if let Some(at) = self.scheduled_at {
            let delta = at.signed_duration_since(now);
            return Some(delta.to_std().unwrap_or(Duration::ZERO));
        }
        self.delay
    }

    /// Validate the message and every target.
    pub fn validate(&self) -> Result<(), NotifyError> {
        if self.targets.is_empty() {
            return Err(NotifyError::Validation("message has no targets".into()));
        }
        for target in &self.targets {
            target.validate()?;
        }
        Ok(())
    }
}

/// Fluent builder for [`Message`].
#[derive(Debug, Default)]
pub struct MessageBuilder {
    id: Option<String>,
    title: String,
    body: String,
    format: MessageFormat,
    priority: Priority,
    targets: Vec<Target>,
    metadata: HashMap<String, String>,
    variables: HashMap<String, String>,
    platform_data: HashMap<String, serde_json::Value>,
    scheduled_at: Option<DateTime<Utc>>,
    delay: Option<Duration>,
}

impl MessageBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn format(mut self, format: MessageFormat) -> Self {
        self.format = format;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn target(mut self, target: Target) -> Self {
        self.targets.push(target);
        self
    }

    pub fn targets(mut self, targets: impl IntoIterator<Item = Target>) -> Self {
        self.targets.extend(targets);
        self
    }

    /// Add a target by auto-detecting kind and platform from the value.
    pub fn to(mut self, value: impl Into<String>) -> Self {
        self.targets.push(Target::detect(value));
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn platform_data(mut self, platform: impl Into<String>, data: serde_json::Value) -> Self {
        self.platform_data.insert(platform.into(), data);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Finish the message, generating an id when none was given.
    pub fn build(self) -> Result<Message, NotifyError> {
        let message = Message {
            id: self.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            title: self.title,
            body: self.body,
            format: self.format,
            priority: self.priority,
            targets: self.targets,
            metadata: self.metadata,
            variables: self.variables,
            platform_data: self.platform_data,
            scheduled_at: self.scheduled_at,
            delay: self.delay,
        };
        message.validate()?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_email() {
        let t = Target::detect("a@x.com");
        assert_eq!(t.kind, TargetKind::Email);
        assert_eq!(t.platform, "email");
    }

    #[test]
    fn detect_phone() {
        let t = Target::detect("+15550001111");
        assert_eq!(t.kind, TargetKind::Phone);
        assert_eq!(t.platform, "sms");
    }

    #[test]
    fn detect_webhook() {
        assert_eq!(Target::detect("https://hooks.example.com/x").kind, TargetKind::Webhook);
        assert_eq!(Target::detect("http://hooks.example.com/x").platform, "webhook");
    }

    #[test]
    fn detect_feishu_ids() {
        assert_eq!(Target::detect("ou_abc123").platform, "feishu");
        assert_eq!(Target::detect("oc_abc123").kind, TargetKind::User);
        assert_eq!(Target::detect("og_abc123").kind, TargetKind::Group);
    }

    #[test]
    fn detect_fallback_is_auto_user() {
        let t = Target::detect("somebody");
        assert_eq!(t.kind, TargetKind::User);
        assert_eq!(t.platform, "auto");
    }

    #[test]
    fn detect_is_idempotent() {
        for value in ["a@x.com", "+15550001111", "https://x.example", "ou_1", "og_1", "plain"] {
            let first = Target::detect(value);
            let second = Target::detect(&first.value);
            assert_eq!(first.kind, second.kind, "detect not idempotent for {value}");
        }
    }

    #[test]
    fn short_phone_is_not_detected_as_phone() {
        assert_eq!(Target::detect("+1234").kind, TargetKind::User);
    }

    #[test]
    fn email_validation() {
        assert!(Target::email("first.last+tag@sub.example.com").validate().is_ok());
        assert!(Target::email("not-an-email").validate().is_err());
        assert!(Target::email("missing@tld").validate().is_err());
    }

    #[test]
    fn phone_validation() {
        assert!(Target::phone("+15550001111").validate().is_ok());
        assert!(Target::phone("+0123").validate().is_err());
        assert!(Target::phone("15550001111").validate().is_err());
    }

    #[test]
    fn webhook_validation() {
        assert!(Target::webhook("https://x.example/hook").validate().is_ok());
        assert!(Target::webhook("ftp://x.example").validate().is_err());
    }

    #[test]
    fn id_targets_require_two_chars() {
        assert!(Target::new(TargetKind::User, "ab", "").validate().is_ok());
        assert!(Target::new(TargetKind::Channel, "x", "").validate().is_err());
        assert!(Target::new(TargetKind::Group, "", "").validate().is_err());
    }

    #[test]
    fn builder_generates_id_when_absent() {
        let m = Message::builder().title("hi").body("there").to("a@x.com").build().unwrap();
        assert!(!m.id.is_empty());

        let m2 = Message::builder().id("custom").title("hi").to("a@x.com").build().unwrap();
        assert_eq!(m2.id, "custom");
    }

    #[test]
    fn builder_rejects_empty_targets() {
        let err = Message::builder().title("hi").build().unwrap_err();
        assert!(matches!(err, NotifyError::Validation(_)));
    }

    #[test]
    fn scheduled_at_wins_over_delay() {
        let now = Utc::now();
        let m = Message::builder()
            .to("a@x.com")
            .scheduled_at(now + chrono::Duration::seconds(10))
            .delay(Duration::from_secs(99))
            .build()
            .unwrap();
        let due = m.due_delay(now).unwrap();
        assert!(due <= Duration::from_secs(10));
        assert!(due > Duration::from_secs(8));
    }

    #[test]
    fn past_scheduled_at_is_due_immediately() {
        let now = Utc::now();
        let m = Message::builder()
            .to("a@x.com")
            .scheduled_at(now - chrono::Duration::seconds(10))
            .build()
            .unwrap();
        assert_eq!(m.due_delay(now), Some(Duration::ZERO));
    }

    #[test]
    fn immediate_message_has_no_due_delay() {
        let m = Message::builder().to("a@x.com").build().unwrap();
        assert_eq!(m.due_delay(Utc::now()), None);
    }

    #[test]
    fn message_roundtrips_through_json() {
        let m = Message::builder()
            .id("m1")
            .title("t")
            .body("b")
            .format(MessageFormat::Markdown)
            .priority(Priority::High)
            .to("a@x.com")
            .metadata("team", "core")
            .delay(Duration::from_millis(1500))
            .build()
            .unwrap();
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(m, back);
    }
}
