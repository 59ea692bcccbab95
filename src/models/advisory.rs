//! Advisory records and the raw content adapters hand back.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::RiskLevel;

/// Identity of an advisory: one record per source and country.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AdvisoryKey {
    pub source_id: String,
    pub country_code: String,
}

impl AdvisoryKey {
    pub fn new(source_id: impl Into<String>, country_code: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            country_code: country_code.into(),
        }
    }
}

impl fmt::Display for AdvisoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_id, self.country_code)
    }
}

/// Normalized advisory as produced by a source adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvisoryRecord {
    /// Source identifier (e.g., "us_state_dept")
    pub source_id: String,

    /// Normalized country code or name
    pub country_code: String,

    /// Advisory headline
    pub title: String,

    /// Advisory body text
    pub content: String,

    /// Risk level exactly as the source phrased it
    pub risk_level_raw: String,

    /// Risk level mapped onto the canonical scale
    pub risk_level_standardized: RiskLevel,

    /// Fingerprint of title, content and standardized risk level
    pub content_hash: String,

    /// Page or API URL the advisory came from
    pub source_url: String,

    /// When the source says it last updated the advisory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,

    /// When the engine fetched it
    pub scraped_at: DateTime<Utc>,
}

impl AdvisoryRecord {
    pub fn key(&self) -> AdvisoryKey {
        AdvisoryKey::new(&self.source_id, &self.country_code)
    }
}

/// Unparsed response from a source together with its query context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawContent {
    pub source_id: String,

    /// Country the fetch was for, `None` for an all-countries listing
    pub country_code: Option<String>,

    pub url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

impl RawContent {
    pub fn new(
        source_id: impl Into<String>,
        country_code: Option<&str>,
        url: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            country_code: country_code.map(str::to_string),
            url: url.into(),
            body: body.into(),
            fetched_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display_joins_source_and_country() {
        let key = AdvisoryKey::new("us_state_dept", "France");
        assert_eq!(key.to_string(), "us_state_dept:France");
    }
}
