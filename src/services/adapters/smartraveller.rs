//! Australian Government Smartraveller destination pages (scraped HTML).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use scraper::Html;

use crate::error::{AppError, Result};
use crate::models::{AdvisoryRecord, RawContent};
use crate::services::adapters::SourceAdapter;
use crate::services::normalizer::{self, AdvisoryDraft};
use crate::utils::{self, http};

pub const SOURCE_ID: &str = "smartraveller";

const BASE_URL: &str = "https://www.smartraveller.gov.au";

const TITLE_SELECTOR: &str = "h1";
const LEVEL_SELECTOR: &str = ".views-field-field-overall-advice-level strong, .overall-advice-level";
const BODY_SELECTOR: &str = ".views-field-field-latest-update p, .field--name-body p";
const DATE_SELECTOR: &str = "time[datetime]";

/// Destination links in the listing table.
const LISTING_SELECTOR: &str = "td.views-field-title a[href*='/destinations/']";

pub struct SmartravellerAdapter {
    client: Client,
    base_url: String,
}

impl SmartravellerAdapter {
    pub fn new(client: Client) -> Self {
        Self::with_base_url(client, BASE_URL)
    }

    pub fn with_base_url(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url_for(&self, country: Option<&str>) -> String {
        match country {
            Some(c) => format!(
                "{}/destinations/{}",
                self.base_url,
                normalizer::country_slug(c)
            ),
            None => format!("{}/destinations", self.base_url),
        }
    }
}

#[async_trait]
impl SourceAdapter for SmartravellerAdapter {
    fn id(&self) -> &str {
        SOURCE_ID
    }

    async fn fetch(&self, country: Option<&str>, timeout: Duration) -> Result<RawContent> {
        let url = self.url_for(country);
        let body = http::fetch_text(&self.client, SOURCE_ID, &url, timeout).await?;
        Ok(RawContent::new(SOURCE_ID, country, url, body))
    }

    fn parse(&self, raw: &RawContent) -> Result<Option<AdvisoryRecord>> {
        if raw.country_code.is_none() {
            return Ok(None);
        }

        let document = Html::parse_document(&raw.body);
        let title_sel = utils::parse_selector(TITLE_SELECTOR)?;
        let level_sel = utils::parse_selector(LEVEL_SELECTOR)?;
        let body_sel = utils::parse_selector(BODY_SELECTOR)?;
        let date_sel = utils::parse_selector(DATE_SELECTOR)?;

        let title = utils::select_text(&document, &title_sel)
            .ok_or_else(|| AppError::parse(SOURCE_ID, "destination heading not found", &raw.body))?;
        let level = utils::select_text(&document, &level_sel).ok_or_else(|| {
            AppError::parse(SOURCE_ID, "overall advice level not found", &raw.body)
        })?;
        let content = utils::select_all_text(&document, &body_sel);

        let last_updated = document
            .select(&date_sel)
            .next()
            .and_then(|el| el.value().attr("datetime"))
            .and_then(parse_datetime);

        // A page with only a level still carries an advisory.
        let content = if content.is_empty() { level.clone() } else { content };

        normalizer::finish_record(
            raw,
            AdvisoryDraft {
                title,
                content,
                risk_level_raw: level,
                last_updated,
                ..AdvisoryDraft::default()
            },
        )
        .map(Some)
    }

    async fn health_check(&self) -> bool {
        http::reachable(&self.client, &self.url_for(None), Duration::from_secs(10)).await
    }

    fn countries(&self, listing: &RawContent) -> Result<Vec<String>> {
        let document = Html::parse_document(&listing.body);
        let links = utils::parse_selector(LISTING_SELECTOR)?;
        let countries = utils::select_distinct_texts(&document, &links);
        if countries.is_empty() {
            return Err(AppError::parse(
                SOURCE_ID,
                "destination listing has no links",
                &listing.body,
            ));
        }
        Ok(countries)
    }
}

fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()?
                .and_hms_opt(0, 0, 0)
                .map(|dt| dt.and_utc())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RiskLevel;

    const PAGE: &str = r#"
        <html><body>
          <h1>Indonesia</h1>
          <div class="views-field views-field-field-overall-advice-level">
            <span>Overall advice level</span>
            <strong>Exercise a high degree of caution</strong>
          </div>
          <div class="views-field views-field-field-latest-update">
            <p>Exercise a high degree of caution in Indonesia overall.</p>
            <p>Reconsider your need to travel to Papua.</p>
          </div>
          <time datetime="2024-09-02T04:00:00Z">2 September 2024</time>
        </body></html>
    "#;

    fn raw(body: &str) -> RawContent {
        RawContent::new(
            SOURCE_ID,
            Some("Indonesia"),
            "https://www.smartraveller.gov.au/destinations/indonesia",
            body,
        )
    }

    #[test]
    fn parses_destination_page() {
        let adapter = SmartravellerAdapter::new(Client::new());
        let record = adapter.parse(&raw(PAGE)).unwrap().unwrap();
        assert_eq!(record.title, "Indonesia");
        assert_eq!(record.risk_level_raw, "Exercise a high degree of caution");
        // Level comes from the overall advice, not the regional "reconsider" line.
        assert_eq!(record.risk_level_standardized, RiskLevel::ExerciseCaution);
        assert!(record.content.contains("Papua"));
        assert!(record.last_updated.is_some());
    }

    #[test]
    fn missing_level_is_parse_error() {
        let adapter = SmartravellerAdapter::new(Client::new());
        let err = adapter
            .parse(&raw("<html><body><h1>Indonesia</h1></body></html>"))
            .unwrap_err();
        assert!(matches!(err, AppError::Parse { .. }));
    }

    #[test]
    fn unmapped_level_fails_validation() {
        let adapter = SmartravellerAdapter::new(Client::new());
        let page = r#"<h1>Fiji</h1><div class="overall-advice-level">Bring sunscreen</div>"#;
        let err = adapter.parse(&raw(page)).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn listing_yields_destinations() {
        let adapter = SmartravellerAdapter::new(Client::new());
        let listing = r#"
            <table>
              <tr><td class="views-field views-field-title"><a href="/destinations/asia/indonesia">Indonesia</a></td></tr>
              <tr><td class="views-field views-field-title"><a href="/destinations/pacific/fiji">Fiji</a></td></tr>
              <tr><td class="views-field views-field-region"><a href="/destinations/asia">Asia</a></td></tr>
            </table>
        "#;
        let raw = RawContent::new(SOURCE_ID, None, BASE_URL, listing);
        assert_eq!(adapter.countries(&raw).unwrap(), vec!["Indonesia", "Fiji"]);
    }

    #[test]
    fn parses_plain_dates() {
        assert!(parse_datetime("2024-09-02").is_some());
        assert!(parse_datetime("yesterday").is_none());
    }
}
