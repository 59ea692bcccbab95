//! Content normalizer.
//!
//! Pure mapping from source-specific advisory representations into
//! [`AdvisoryRecord`] and the standardized [`RiskLevel`] scale. Nothing here
//! touches the network or storage.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};
use unicode_segmentation::UnicodeSegmentation;

use crate::error::{AppError, Result};
use crate::models::{AdvisoryRecord, RawContent, RiskLevel};

/// Maximum characters kept from an advisory body.
pub const MAX_CONTENT_CHARS: usize = 20_000;

/// Advisory fields extracted by an adapter, before normalization.
#[derive(Debug, Clone, Default)]
pub struct AdvisoryDraft {
    pub title: String,
    pub content: String,
    pub risk_level_raw: String,
    /// Set when the adapter mapped the level itself (e.g. from API flags)
    pub risk_level: Option<RiskLevel>,
    pub source_url: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Collapse runs of whitespace into single spaces and trim.
pub fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Decode the handful of entities sources leave in text and tidy whitespace.
pub fn clean_text(s: &str) -> String {
    let decoded = s
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&rsquo;", "'")
        .replace("&lsquo;", "'")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace('\u{00A0}', " ");
    normalize_whitespace(&decoded)
}

/// Canonical form of a country identifier.
///
/// Two- and three-letter codes are upper-cased; names are title-cased word by
/// word so "  united   KINGDOM" and "United Kingdom" share one key.
pub fn normalize_country(raw: &str) -> String {
    let compact = normalize_whitespace(raw);
    if compact.len() <= 3 && compact.chars().all(|c| c.is_ascii_alphabetic()) {
        return compact.to_ascii_uppercase();
    }
    compact
        .split(' ')
        .map(|word| {
            let lower = word.to_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// URL slug for a country name ("Côte d'Ivoire" → "cote-d-ivoire").
pub fn country_slug(country: &str) -> String {
    let mut slug = String::with_capacity(country.len());
    for c in country.to_lowercase().chars() {
        let mapped = match c {
            'á' | 'à' | 'â' | 'ä' | 'ã' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'ö' | 'õ' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            'ñ' => 'n',
            c if c.is_ascii_alphanumeric() => c,
            _ => '-',
        };
        if mapped == '-' && (slug.is_empty() || slug.ends_with('-')) {
            continue;
        }
        slug.push(mapped);
    }
    slug.trim_end_matches('-').to_string()
}

/// First `max` graphemes of `raw`, whitespace-collapsed, with an ellipsis if cut.
pub fn excerpt(raw: &str, max: usize) -> String {
    let compact = normalize_whitespace(raw);
    let mut graphemes = compact.graphemes(true);
    let head: String = graphemes.by_ref().take(max).collect();
    if graphemes.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

/// Map a numbered level ("Level 3: Reconsider Travel") onto the 4-tier scale.
pub fn risk_from_numbered_level(raw: &str) -> Option<RiskLevel> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"(?i)\blevel\s*([1-4])\b").ok())
        .as_ref()?;
    let caps = re.captures(raw)?;
    match caps.get(1)?.as_str() {
        "1" => Some(RiskLevel::NormalPrecautions),
        "2" => Some(RiskLevel::ExerciseCaution),
        "3" => Some(RiskLevel::ReconsiderTravel),
        "4" => Some(RiskLevel::AvoidAllTravel),
        _ => None,
    }
}

/// Phrases used by government sources, most specific first.
const PHRASES: &[(&str, RiskLevel)] = &[
    ("all but essential travel", RiskLevel::ReconsiderTravel),
    ("avoid non-essential travel", RiskLevel::ReconsiderTravel),
    ("reconsider your need to travel", RiskLevel::ReconsiderTravel),
    ("reconsider travel", RiskLevel::ReconsiderTravel),
    ("do not travel", RiskLevel::AvoidAllTravel),
    ("against all travel", RiskLevel::AvoidAllTravel),
    ("avoid all travel", RiskLevel::AvoidAllTravel),
    ("exercise increased caution", RiskLevel::ExerciseCaution),
    ("exercise a high degree of caution", RiskLevel::ExerciseCaution),
    ("high degree of caution", RiskLevel::ExerciseCaution),
    ("exercise normal precautions", RiskLevel::NormalPrecautions),
    ("normal safety precautions", RiskLevel::NormalPrecautions),
    ("normal security precautions", RiskLevel::NormalPrecautions),
    ("normal precautions", RiskLevel::NormalPrecautions),
];

/// Map a free-text advice phrase onto the 4-tier scale.
pub fn risk_from_phrase(raw: &str) -> Option<RiskLevel> {
    let lower = clean_text(raw).to_lowercase();
    PHRASES
        .iter()
        .find(|(phrase, _)| lower.contains(phrase))
        .map(|(_, level)| *level)
}

/// Map a legal-obligation label or a canonical level name.
pub fn risk_from_label(raw: &str) -> Option<RiskLevel> {
    let lower = clean_text(raw).to_lowercase();
    let aux = match lower.as_str() {
        "mandatory" | "required" | "compulsory" => Some(RiskLevel::Mandatory),
        "recommended" | "advised" => Some(RiskLevel::Recommended),
        "prohibited" | "banned" | "not permitted" => Some(RiskLevel::Prohibited),
        "mixed" | "varies" | "partial" => Some(RiskLevel::Mixed),
        _ => None,
    };
    aux.or_else(|| lower.replace([' ', '-'], "_").parse().ok())
}

/// Map any raw risk representation, failing closed when nothing matches.
pub fn standardize_risk(raw: &str) -> Result<RiskLevel> {
    risk_from_numbered_level(raw)
        .or_else(|| risk_from_phrase(raw))
        .or_else(|| risk_from_label(raw))
        .ok_or_else(|| {
            AppError::validation(format!(
                "unmapped risk level '{}'",
                excerpt(raw, 80)
            ))
        })
}

/// Deterministic fingerprint over normalized title, content and risk level.
pub fn fingerprint(title: &str, content: &str, risk: RiskLevel) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_whitespace(title).as_bytes());
    hasher.update(b"\n");
    hasher.update(normalize_whitespace(content).as_bytes());
    hasher.update(b"\n");
    hasher.update(risk.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

/// Turn an adapter draft into a validated, hashed record.
pub fn finish_record(raw: &RawContent, draft: AdvisoryDraft) -> Result<AdvisoryRecord> {
    let country = raw
        .country_code
        .as_deref()
        .map(normalize_country)
        .unwrap_or_default();

    let title = clean_text(&draft.title);
    let mut content = clean_text(&draft.content);
    if content.chars().count() > MAX_CONTENT_CHARS {
        content = content.chars().take(MAX_CONTENT_CHARS).collect();
    }
    let risk_level_raw = clean_text(&draft.risk_level_raw);
    let risk = match draft.risk_level {
        Some(level) => level,
        None => standardize_risk(&risk_level_raw)?,
    };

    let record = AdvisoryRecord {
        source_id: raw.source_id.clone(),
        country_code: country,
        content_hash: fingerprint(&title, &content, risk),
        title,
        content,
        risk_level_raw,
        risk_level_standardized: risk,
        source_url: draft.source_url.unwrap_or_else(|| raw.url.clone()),
        last_updated: draft.last_updated,
        scraped_at: raw.fetched_at,
    };
    validate_record(&record)?;
    Ok(record)
}

/// Schema checks a record must pass before it is stored.
pub fn validate_record(record: &AdvisoryRecord) -> Result<()> {
    if record.source_id.trim().is_empty() {
        return Err(AppError::validation("source_id is empty"));
    }
    if record.country_code.trim().is_empty() {
        return Err(AppError::validation(format!(
            "{}: country_code is empty",
            record.source_id
        )));
    }
    if record.title.trim().is_empty() {
        return Err(AppError::validation(format!(
            "{}: title is empty",
            record.key()
        )));
    }
    if record.content.trim().is_empty() {
        return Err(AppError::validation(format!(
            "{}: content is empty",
            record.key()
        )));
    }
    if record.risk_level_raw.trim().is_empty() {
        return Err(AppError::validation(format!(
            "{}: raw risk level is empty",
            record.key()
        )));
    }
    url::Url::parse(&record.source_url).map_err(|e| {
        AppError::validation(format!(
            "{}: bad source_url '{}': {e}",
            record.key(),
            record.source_url
        ))
    })?;
    Ok(())
}
