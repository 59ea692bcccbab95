// src/lib.rs

//! Travel-advisory ingestion and scheduling engine.
//!
//! Pulls advisories from independent government sources on a schedule,
//! normalizes them onto one risk scale, detects changes and keeps a
//! queryable store of the latest records and their change log.

pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod storage;
pub mod utils;

pub use engine::Engine;
pub use error::{AppError, Result};
