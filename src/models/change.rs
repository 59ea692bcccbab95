//! Change events emitted by the change detector.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{AdvisoryKey, RiskLevel};

/// Classification of a fetch against the previously stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    New,
    ContentChanged,
    RiskChanged,
    Unchanged,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::New => "new",
            ChangeType::ContentChanged => "content_changed",
            ChangeType::RiskChanged => "risk_changed",
            ChangeType::Unchanged => "unchanged",
        }
    }

    /// Whether this classification is a state transition worth logging.
    pub fn is_transition(&self) -> bool {
        !matches!(self, ChangeType::Unchanged)
    }
}

/// One entry of the append-only change log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Sequence number assigned by the store on append (completion order)
    #[serde(default)]
    pub id: u64,

    pub advisory_key: AdvisoryKey,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,

    pub new_hash: String,

    pub change_type: ChangeType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_risk_level: Option<RiskLevel>,

    pub new_risk_level: RiskLevel,

    pub detected_at: DateTime<Utc>,
}
