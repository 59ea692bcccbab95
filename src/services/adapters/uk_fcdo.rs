//! UK Foreign, Commonwealth & Development Office advice (GOV.UK content API).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use scraper::Html;
use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::models::{AdvisoryRecord, RawContent, RiskLevel};
use crate::services::adapters::SourceAdapter;
use crate::services::normalizer::{self, AdvisoryDraft};
use crate::utils::http;

pub const SOURCE_ID: &str = "uk_fcdo";

const BASE_URL: &str = "https://www.gov.uk/api/content/foreign-travel-advice";

#[derive(Debug, Deserialize)]
struct ContentItem {
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    public_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    web_url: Option<String>,
    details: Details,
}

#[derive(Debug, Deserialize)]
struct Details {
    #[serde(default)]
    alert_status: Vec<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    slug: String,
    #[serde(default)]
    body: String,
}

/// The `foreign-travel-advice` index item lists every country as a child link.
#[derive(Debug, Deserialize)]
struct Index {
    links: IndexLinks,
}

#[derive(Debug, Deserialize)]
struct IndexLinks {
    #[serde(default)]
    children: Vec<IndexChild>,
}

#[derive(Debug, Deserialize)]
struct IndexChild {
    #[serde(default)]
    title: String,
    #[serde(default)]
    details: Option<ChildDetails>,
}

#[derive(Debug, Deserialize)]
struct ChildDetails {
    #[serde(default)]
    country: Option<Country>,
}

#[derive(Debug, Deserialize)]
struct Country {
    name: String,
}

pub struct UkFcdoAdapter {
    client: Client,
    base_url: String,
}

impl UkFcdoAdapter {
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
            Some(c) => format!("{}/{}", self.base_url, normalizer::country_slug(c)),
            None => self.base_url.clone(),
        }
    }
}

#[async_trait]
impl SourceAdapter for UkFcdoAdapter {
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

        let item: ContentItem = serde_json::from_str(&raw.body).map_err(|e| {
            AppError::parse(SOURCE_ID, format!("unexpected content API shape: {e}"), &raw.body)
        })?;

        let risk = map_alert_status(&item.details.alert_status)?;
        let risk_level_raw = if item.details.alert_status.is_empty() {
            "none".to_string()
        } else {
            item.details.alert_status.join(",")
        };

        let mut blocks = Vec::new();
        if let Some(summary) = item.details.summary.as_deref() {
            blocks.push(html_to_text(summary));
        }
        // The warnings part carries the substance of the advice.
        if let Some(part) = item
            .details
            .parts
            .iter()
            .find(|p| p.slug == "warnings-and-insurance")
            .or_else(|| item.details.parts.first())
        {
            blocks.push(html_to_text(&part.body));
        }
        if blocks.iter().all(|b| b.is_empty()) {
            if let Some(desc) = item.description.as_deref() {
                blocks.push(desc.to_string());
            }
        }

        normalizer::finish_record(
            raw,
            AdvisoryDraft {
                title: item.title,
                content: blocks.join("\n"),
                risk_level_raw,
                risk_level: Some(risk),
                source_url: item.web_url,
                last_updated: item.public_updated_at,
            },
        )
        .map(Some)
    }

    async fn health_check(&self) -> bool {
        http::reachable(&self.client, &self.base_url, Duration::from_secs(10)).await
    }

    fn countries(&self, listing: &RawContent) -> Result<Vec<String>> {
        let index: Index = serde_json::from_str(&listing.body).map_err(|e| {
            AppError::parse(SOURCE_ID, format!("unexpected index shape: {e}"), &listing.body)
        })?;
        let mut countries: Vec<String> = Vec::with_capacity(index.links.children.len());
        for child in index.links.children {
            let name = child
                .details
                .and_then(|d| d.country)
                .map(|c| c.name)
                .unwrap_or_else(|| {
                    child
                        .title
                        .trim()
                        .trim_end_matches(" travel advice")
                        .to_string()
                });
            if !name.is_empty() && !countries.contains(&name) {
                countries.push(name);
            }
        }
        Ok(countries)
    }
}

/// Map GOV.UK alert flags onto the standardized scale, worst flag wins.
fn map_alert_status(flags: &[String]) -> Result<RiskLevel> {
    let mut worst = RiskLevel::NormalPrecautions;
    for flag in flags {
        let level = match flag.as_str() {
            "avoid_all_travel_to_whole_country" => RiskLevel::AvoidAllTravel,
            "avoid_all_but_essential_travel_to_whole_country" => RiskLevel::ReconsiderTravel,
            "avoid_all_travel_to_parts" => RiskLevel::ReconsiderTravel,
            "avoid_all_but_essential_travel_to_parts" => RiskLevel::ExerciseCaution,
            other => {
                return Err(AppError::validation(format!(
                    "{SOURCE_ID}: unmapped alert_status '{other}'"
                )));
            }
        };
        if level.tier() > worst.tier() {
            worst = level;
        }
    }
    Ok(worst)
}

fn html_to_text(fragment: &str) -> String {
    let html = Html::parse_fragment(fragment);
    normalizer::clean_text(&html.root_element().text().collect::<Vec<_>>().join(" "))
}
