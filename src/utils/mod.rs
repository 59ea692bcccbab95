//! Utility functions and helpers.

pub mod http;

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use scraper::{ElementRef, Html, Selector};

use crate::error::{AppError, Result};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Parse a CSS selector, reporting the selector text on failure.
pub fn parse_selector(s: &str) -> Result<Selector> {
    Selector::parse(s).map_err(|e| AppError::selector(s, format!("{e:?}")))
}

/// Text of the first element matching `selector`, whitespace-collapsed.
pub fn select_text(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .next()
        .map(element_text)
        .filter(|t| !t.is_empty())
}

/// Joined text of every element matching `selector`, one block per line.
pub fn select_all_text(document: &Html, selector: &Selector) -> String {
    document
        .select(selector)
        .map(element_text)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Distinct non-empty texts of the matching elements, in document order.
pub fn select_distinct_texts(document: &Html, selector: &Selector) -> Vec<String> {
    let mut seen = HashSet::new();
    document
        .select(selector)
        .map(element_text)
        .filter(|t| !t.is_empty() && seen.insert(t.clone()))
        .collect()
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
