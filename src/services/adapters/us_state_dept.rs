//! U.S. Department of State travel advisories (scraped HTML).

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use reqwest::Client;
use scraper::Html;

use crate::error::{AppError, Result};
use crate::models::{AdvisoryRecord, RawContent};
use crate::services::adapters::SourceAdapter;
use crate::services::normalizer::{self, AdvisoryDraft};
use crate::utils::{self, http};

pub const SOURCE_ID: &str = "us_state_dept";

const BASE_URL: &str = "https://travel.state.gov/content/travel/en/traveladvisories";

/// CSS selectors for a country advisory page.
const TITLE_SELECTOR: &str = ".tsg-rwd-eab-title-frame, h1";
const BODY_SELECTOR: &str = ".tsg-rwd-emergency-alert-text";
const DATE_SELECTOR: &str = ".tsg-rwd-eab-date-frame";

/// Country links on the advisories listing page.
const LISTING_SELECTOR: &str = "a[href$='-travel-advisory.html']";

pub struct UsStateDeptAdapter {
    client: Client,
    base_url: String,
}

impl UsStateDeptAdapter {
    pub fn new(client: Client) -> Self {
        Self::with_base_url(client, BASE_URL)
    }

    pub fn with_base_url(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn country_url(&self, country: &str) -> String {
        format!(
            "{}/traveladvisories/{}-travel-advisory.html",
            self.base_url,
            normalizer::country_slug(country)
        )
    }

    fn listing_url(&self) -> String {
        format!("{}/traveladvisories.html", self.base_url)
    }
}

#[async_trait]
impl SourceAdapter for UsStateDeptAdapter {
    fn id(&self) -> &str {
        SOURCE_ID
    }

    async fn fetch(&self, country: Option<&str>, timeout: Duration) -> Result<RawContent> {
        let url = match country {
            Some(c) => self.country_url(c),
            None => self.listing_url(),
        };
        log::debug!("Fetching {} advisory page {}", SOURCE_ID, url);
        let body = http::fetch_text(&self.client, SOURCE_ID, &url, timeout).await?;
        Ok(RawContent::new(SOURCE_ID, country, url, body))
    }

    fn parse(&self, raw: &RawContent) -> Result<Option<AdvisoryRecord>> {
        // The listing page carries no single-country advisory.
        if raw.country_code.is_none() {
            return Ok(None);
        }
        parse_advisory_page(raw).map(Some)
    }

    async fn health_check(&self) -> bool {
        http::reachable(&self.client, &self.listing_url(), Duration::from_secs(10)).await
    }

    fn countries(&self, listing: &RawContent) -> Result<Vec<String>> {
        let document = Html::parse_document(&listing.body);
        let links = utils::parse_selector(LISTING_SELECTOR)?;
        let countries: Vec<String> = utils::select_distinct_texts(&document, &links)
            .into_iter()
            .map(|text| country_from_link(&text))
            .filter(|c| !c.is_empty())
            .collect();
        if countries.is_empty() {
            return Err(AppError::parse(
                SOURCE_ID,
                "advisory listing has no country links",
                &listing.body,
            ));
        }
        Ok(countries)
    }
}

fn parse_advisory_page(raw: &RawContent) -> Result<AdvisoryRecord> {
    let document = Html::parse_document(&raw.body);
    let title_sel = utils::parse_selector(TITLE_SELECTOR)?;
    let body_sel = utils::parse_selector(BODY_SELECTOR)?;
    let date_sel = utils::parse_selector(DATE_SELECTOR)?;

    let title = utils::select_text(&document, &title_sel)
        .ok_or_else(|| AppError::parse(SOURCE_ID, "advisory title not found", &raw.body))?;
    let content = utils::select_all_text(&document, &body_sel);
    if content.is_empty() {
        return Err(AppError::parse(
            SOURCE_ID,
            "advisory body not found",
            &raw.body,
        ));
    }

    let risk_level_raw = extract_level(&title).unwrap_or_else(|| title.clone());
    let last_updated = utils::select_text(&document, &date_sel).and_then(|t| parse_date(&t));

    normalizer::finish_record(
        raw,
        AdvisoryDraft {
            title,
            content,
            risk_level_raw,
            risk_level: None,
            source_url: None,
            last_updated,
        },
    )
    .map_err(|e| {
        log::warn!(
            "{} advisory for {:?} rejected: {}",
            SOURCE_ID,
            raw.country_code,
            e
        );
        e
    })
}

/// "Burkina Faso Travel Advisory" → "Burkina Faso".
fn country_from_link(text: &str) -> String {
    const SUFFIX: &str = "travel advisory";
    let trimmed = text.trim();
    let cut = trimmed.len().saturating_sub(SUFFIX.len());
    match trimmed.get(cut..) {
        Some(tail) if tail.eq_ignore_ascii_case(SUFFIX) => trimmed[..cut].trim().to_string(),
        _ => trimmed.to_string(),
    }
}

/// "France - Level 2: Exercise Increased Caution" → "Level 2: Exercise Increased Caution".
fn extract_level(title: &str) -> Option<String> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"(?i)level\s*[1-4]\s*[:\-]?\s*[^|]*").ok())
        .as_ref()?;
    re.find(title).map(|m| m.as_str().trim().to_string())
}

/// The "Last Update" line ends with a date such as "July 26, 2024".
fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| {
            Regex::new(r"(January|February|March|April|May|June|July|August|September|October|November|December)\s+\d{1,2},\s+\d{4}").ok()
        })
        .as_ref()?;
    let found = re.find(text)?;
    NaiveDate::parse_from_str(found.as_str(), "%B %d, %Y")
        .ok()?
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
}
