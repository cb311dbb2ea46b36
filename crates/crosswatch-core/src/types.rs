use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque event identifier (UUIDv4).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight hex chars, for compact log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EventId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Which input list a channel came from.
///
/// Source channels carry raw first-language intelligence; smart channels carry
/// corroborating commentary and are additionally mirrored to a separate chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelClass {
    Source,
    Smart,
}

impl fmt::Display for ChannelClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelClass::Source => write!(f, "source"),
            ChannelClass::Smart => write!(f, "smart"),
        }
    }
}

impl std::str::FromStr for ChannelClass {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "source" => Ok(ChannelClass::Source),
            "smart" => Ok(ChannelClass::Smart),
            other => Err(format!("unknown channel class: {}", other)),
        }
    }
}

/// Event category assigned by the extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Strike,
    Rocket,
    Clash,
    Arrest,
    Movement,
    Statement,
    Casualty,
    #[default]
    Other,
    Irrelevant,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Strike => "strike",
            EventType::Rocket => "rocket",
            EventType::Clash => "clash",
            EventType::Arrest => "arrest",
            EventType::Movement => "movement",
            EventType::Statement => "statement",
            EventType::Casualty => "casualty",
            EventType::Other => "other",
            EventType::Irrelevant => "irrelevant",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Credibility hints extracted alongside the signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CredibilityIndicators {
    #[serde(default)]
    pub has_media_reference: bool,
    #[serde(default)]
    pub cites_named_source: bool,
    #[serde(default)]
    pub uses_vague_language: bool,
    #[serde(default)]
    pub is_forwarded_claim: bool,
}

/// Structured extract of a single message. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EventSignature {
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub event_type: EventType,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub is_urgent: bool,
    #[serde(default)]
    pub credibility_indicators: CredibilityIndicators,
}

impl EventSignature {
    /// Signatures typed `irrelevant` are dropped before they reach the pool.
    pub fn is_relevant(&self) -> bool {
        self.event_type != EventType::Irrelevant
    }
}

/// A normalized message as it leaves the ingest fan-in.
#[derive(Debug, Clone)]
pub struct ChannelPost {
    /// Normalized text (NFC, tashkeel stripped, URLs removed, whitespace collapsed).
    pub text: String,
    /// Channel username without the leading `@`.
    pub channel: String,
    pub link: Option<String>,
    pub media_id: Option<String>,
    pub class: ChannelClass,
    pub received_at: DateTime<Utc>,
}

/// In-memory aggregation of messages believed to describe one incident.
///
/// The signature is the first contributing message's extract and is never
/// mutated after creation. Terminal state (sent/expired) lives in the store;
/// the pool drops the event in both cases.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: EventId,
    pub signature: EventSignature,
    pub texts: Vec<String>,
    pub channels: std::collections::HashSet<String>,
    pub channel_classes: HashMap<String, ChannelClass>,
    pub links: Vec<String>,
    pub first_ts: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub sent: bool,
}

impl Event {
    pub fn source_count(&self) -> usize {
        self.channels.len()
    }

    /// Longest contributed text — used as the body of trend reports.
    pub fn representative_text(&self) -> &str {
        self.texts
            .iter()
            .max_by_key(|t| t.len())
            .map(|t| t.as_str())
            .unwrap_or("")
    }

    /// True when both source- and smart-class channels contributed.
    pub fn is_cross_class(&self) -> bool {
        let mut has_source = false;
        let mut has_smart = false;
        for class in self.channel_classes.values() {
            match class {
                ChannelClass::Source => has_source = true,
                ChannelClass::Smart => has_smart = true,
            }
        }
        has_source && has_smart
    }
}
