//! Typed WhatsApp Cloud webhook payloads. Shapes are validated by serde at
//! the HTTP boundary so malformed envelopes never reach the ingestion logic.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(default)]
    pub object: Option<String>,
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub id: Option<String>,
    pub changes: Vec<WebhookChange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookChange {
    #[serde(default)]
    pub field: Option<String>,
    pub value: WebhookValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookValue {
    pub metadata: BusinessMetadata,
    #[serde(default)]
    pub contacts: Vec<WebhookContact>,
    #[serde(default)]
    pub messages: Vec<WebhookMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessMetadata {
    pub phone_number_id: String,
    pub display_phone_number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookContact {
    pub wa_id: String,
    #[serde(default)]
    pub profile: Option<ContactProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactProfile {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookMessage {
    pub id: String,
    pub from: String,
    /// Unix seconds as a string, per the provider wire format.
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub audio: Option<AudioContent>,
    #[serde(default)]
    pub referral: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioContent {
    pub id: String,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub voice: bool,
}

impl WebhookValue {
    /// Contact matching the message sender, falling back to the first listed
    /// contact. `None` means the message cannot be attributed.
    pub fn contact_for(&self, from: &str) -> Option<&WebhookContact> {
        self.contacts
            .iter()
            .find(|c| c.wa_id == from)
            .or_else(|| self.contacts.first())
    }
}

impl WebhookMessage {
    /// Parse the provider timestamp; malformed values degrade to the epoch
    /// rather than aborting ingestion.
    pub fn received_at(&self) -> DateTime<Utc> {
        self.timestamp
            .parse::<i64>()
            .ok()
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .unwrap_or(DateTime::UNIX_EPOCH)
    }
}

impl WebhookContact {
    pub fn display_name(&self) -> Option<&str> {
        self.profile.as_ref().and_then(|p| p.name.as_deref())
    }
}
