//! Local filesystem storage implementation.
//!
//! Every table is a directory of JSON documents written atomically
//! (temp file, then rename). The change log is JSON Lines so appends never
//! rewrite history.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::models::{
    AdvisoryKey, AdvisoryRecord, ChangeEvent, DeadLetterEntry, JobStatus, ScrapeJob,
};
use crate::services::normalizer;
use crate::storage::{AdvisoryStore, sort_jobs};
use crate::utils::lock;

const ADVISORIES_DIR: &str = "advisories";
const JOBS_DIR: &str = "jobs";
const DEAD_LETTERS_DIR: &str = "dead_letters";
const CHANGES_FILE: &str = "changes.jsonl";

/// Local filesystem storage backend.
pub struct LocalStorage {
    root_dir: PathBuf,
    /// Serializes read-modify-write of one advisory document; different
    /// documents are written concurrently.
    advisory_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Next change id, loaded lazily from the log.
    change_seq: Mutex<Option<u64>>,
    dead_letter_lock: Mutex<()>,
}

impl LocalStorage {
    /// Create a new LocalStorage rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            advisory_locks: Default::default(),
            change_seq: Mutex::new(None),
            dead_letter_lock: Mutex::new(()),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Get the full path for a relative key.
    fn path(&self, key: &str) -> PathBuf {
        self.root_dir.join(key)
    }

    fn advisory_key(key: &AdvisoryKey) -> String {
        format!(
            "{}/{}/{}.json",
            ADVISORIES_DIR,
            file_stem(&key.source_id),
            file_stem(&normalizer::country_slug(&key.country_code))
        )
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        lock(&self.advisory_locks)
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    fn job_key(id: &str) -> String {
        format!("{}/{}.json", JOBS_DIR, file_stem(id))
    }

    fn dead_letter_key(id: &str) -> String {
        format!("{}/{}.json", DEAD_LETTERS_DIR, file_stem(id))
    }

    /// Ensure parent directory exists.
    async fn ensure_dir(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("create directory", parent, e))?;
        }
        Ok(())
    }

    /// Write bytes atomically (write to temp, then rename).
    async fn write_bytes(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(key);
        self.ensure_dir(&path).await?;

        let tmp = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| io_error("create", &tmp, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| io_error("write", &tmp, e))?;
        file.flush().await.map_err(|e| io_error("flush", &tmp, e))?;
        drop(file);

        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error("rename", &path, e))?;
        Ok(())
    }

    async fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write_bytes(key, &bytes).await
    }

    /// Read bytes, returning None if file doesn't exist.
    async fn read_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read", &path, e)),
        }
    }

    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.read_bytes(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("remove", &path, e)),
        }
    }

    /// Every JSON document directly under `dir`, in file name order.
    async fn read_dir_json<T: DeserializeOwned>(&self, dir: &Path) -> Result<Vec<T>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("list", dir, e)),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("list", dir, e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| io_error("read", &path, e))?;
            match serde_json::from_slice(&bytes) {
                Ok(value) => out.push(value),
                Err(e) => log::warn!("Skipping unreadable document {}: {}", path.display(), e),
            }
        }
        Ok(out)
    }

    async fn source_dirs(&self) -> Result<Vec<PathBuf>> {
        let root = self.path(ADVISORIES_DIR);
        let mut entries = match tokio::fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("list", &root, e)),
        };
        let mut dirs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("list", &root, e))?
        {
            if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    async fn read_changes(&self) -> Result<Vec<ChangeEvent>> {
        let Some(bytes) = self.read_bytes(CHANGES_FILE).await? else {
            return Ok(Vec::new());
        };
        let text = String::from_utf8_lossy(&bytes);
        let mut events = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            events.push(serde_json::from_str(line)?);
        }
        Ok(events)
    }
}

#[async_trait]
impl AdvisoryStore for LocalStorage {
    async fn replace_advisory(&self, record: AdvisoryRecord) -> Result<Option<AdvisoryRecord>> {
        let key = Self::advisory_key(&record.key());
        let key_lock = self.key_lock(&key);
        let _guard = key_lock.lock().await;
        let previous = self.read_json(&key).await?;
        self.write_json(&key, &record).await?;
        Ok(previous)
    }

    async fn advisory(&self, key: &AdvisoryKey) -> Result<Option<AdvisoryRecord>> {
        self.read_json(&Self::advisory_key(key)).await
    }

    async fn advisories(
        &self,
        country: &str,
        source: Option<&str>,
    ) -> Result<Vec<AdvisoryRecord>> {
        let country = normalizer::normalize_country(country);
        match source {
            Some(source) => Ok(self
                .advisory(&AdvisoryKey::new(source, &country))
                .await?
                .into_iter()
                .collect()),
            None => {
                let file = format!("{}.json", file_stem(&normalizer::country_slug(&country)));
                let mut out = Vec::new();
                for dir in self.source_dirs().await? {
                    let path = dir.join(&file);
                    if let Ok(bytes) = tokio::fs::read(&path).await {
                        out.push(serde_json::from_slice::<AdvisoryRecord>(&bytes)?);
                    }
                }
                Ok(out)
            }
        }
    }

    async fn append_change(&self, mut event: ChangeEvent) -> Result<ChangeEvent> {
        let mut seq = self.change_seq.lock().await;
        let last = match *seq {
            Some(last) => last,
            None => self
                .read_changes()
                .await?
                .last()
                .map(|e| e.id)
                .unwrap_or(0),
        };
        event.id = last + 1;

        let path = self.path(CHANGES_FILE);
        self.ensure_dir(&path).await?;
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| io_error("open", &path, e))?;
        file.write_all(&line)
            .await
            .map_err(|e| io_error("append", &path, e))?;
        file.flush().await.map_err(|e| io_error("flush", &path, e))?;

        *seq = Some(event.id);
        Ok(event)
    }

    async fn changes_since(&self, since: DateTime<Utc>) -> Result<Vec<ChangeEvent>> {
        Ok(self
            .read_changes()
            .await?
            .into_iter()
            .filter(|e| e.detected_at >= since)
            .collect())
    }

    async fn save_job(&self, job: &ScrapeJob) -> Result<()> {
        self.write_json(&Self::job_key(&job.id), job).await
    }

    async fn job(&self, id: &str) -> Result<Option<ScrapeJob>> {
        self.read_json(&Self::job_key(id)).await
    }

    async fn jobs(&self, status: Option<JobStatus>) -> Result<Vec<ScrapeJob>> {
        let mut jobs: Vec<ScrapeJob> = self.read_dir_json(&self.path(JOBS_DIR)).await?;
        jobs.retain(|j| status.is_none_or(|s| j.status == s));
        sort_jobs(&mut jobs);
        Ok(jobs)
    }

    async fn put_dead_letter(&self, entry: DeadLetterEntry) -> Result<()> {
        let _guard = self.dead_letter_lock.lock().await;
        self.write_json(&Self::dead_letter_key(&entry.id), &entry)
            .await
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>> {
        self.read_dir_json(&self.path(DEAD_LETTERS_DIR)).await
    }

    async fn take_dead_letter(&self, id: &str) -> Result<Option<DeadLetterEntry>> {
        let key = Self::dead_letter_key(id);
        let _guard = self.dead_letter_lock.lock().await;
        let entry = self.read_json(&key).await?;
        if entry.is_some() {
            self.remove(&key).await?;
        }
        Ok(entry)
    }

    async fn ping(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root_dir)
            .await
            .map_err(|e| io_error("create directory", &self.root_dir, e))?;
        let meta = tokio::fs::metadata(&self.root_dir)
            .await
            .map_err(|e| io_error("stat", &self.root_dir, e))?;
        if meta.permissions().readonly() {
            return Err(AppError::persistence(format!(
                "{} is read-only",
                self.root_dir.display()
            )));
        }
        Ok(())
    }
}

/// Keep identifiers from escaping their table directory.
fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

fn io_error(op: &str, path: &Path, err: std::io::Error) -> AppError {
    AppError::persistence(format!("failed to {op} {}: {err}", path.display()))
}
