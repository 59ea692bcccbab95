//! Content-hash change detection.
//!
//! Compares each freshly parsed record with the stored one for the same
//! (source, country) key, stores the new record and appends a
//! [`ChangeEvent`] when something actually changed.

use std::sync::Arc;

use chrono::Utc;

use crate::error::Result;
use crate::models::{AdvisoryRecord, ChangeEvent, ChangeType};
use crate::services::normalizer;
use crate::storage::AdvisoryStore;

/// What `detect` decided for one record.
#[derive(Debug, Clone)]
pub struct ChangeOutcome {
    pub change_type: ChangeType,
    /// The appended event; `None` for `unchanged`
    pub event: Option<ChangeEvent>,
    pub record: AdvisoryRecord,
}

/// Classify `current` against the previously stored record.
pub fn classify(previous: Option<&AdvisoryRecord>, current: &AdvisoryRecord) -> ChangeType {
    match previous {
        None => ChangeType::New,
        Some(prev) if prev.content_hash == current.content_hash => ChangeType::Unchanged,
        Some(prev) if prev.risk_level_standardized != current.risk_level_standardized => {
            ChangeType::RiskChanged
        }
        Some(_) => ChangeType::ContentChanged,
    }
}

pub struct ChangeDetector {
    store: Arc<dyn AdvisoryStore>,
}

impl ChangeDetector {
    pub fn new(store: Arc<dyn AdvisoryStore>) -> Self {
        Self { store }
    }

    /// Store `record` and log the transition it represents.
    ///
    /// Only transitions are appended; an `unchanged` record still replaces
    /// the stored copy so `scraped_at` stays fresh.
    pub async fn detect(&self, mut record: AdvisoryRecord) -> Result<ChangeOutcome> {
        record.content_hash = normalizer::fingerprint(
            &record.title,
            &record.content,
            record.risk_level_standardized,
        );

        let previous = self.store.replace_advisory(record.clone()).await?;
        let change_type = classify(previous.as_ref(), &record);

        if !change_type.is_transition() {
            log::debug!("{}: unchanged", record.key());
            return Ok(ChangeOutcome {
                change_type,
                event: None,
                record,
            });
        }

        let event = self
            .store
            .append_change(ChangeEvent {
                id: 0,
                advisory_key: record.key(),
                previous_hash: previous.as_ref().map(|p| p.content_hash.clone()),
                new_hash: record.content_hash.clone(),
                change_type,
                previous_risk_level: previous.as_ref().map(|p| p.risk_level_standardized),
                new_risk_level: record.risk_level_standardized,
                detected_at: Utc::now(),
            })
            .await?;

        match change_type {
            ChangeType::RiskChanged => log::info!(
                "{}: risk changed {} -> {}",
                record.key(),
                previous
                    .as_ref()
                    .map(|p| p.risk_level_standardized.as_str())
                    .unwrap_or("none"),
                record.risk_level_standardized
            ),
            _ => log::info!("{}: {}", record.key(), change_type.as_str()),
        }

        Ok(ChangeOutcome {
            change_type,
            event: Some(event),
            record,
        })
    }
}
