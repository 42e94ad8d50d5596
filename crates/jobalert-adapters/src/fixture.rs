//! File-backed collaborators used for dry runs and local development.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use jobalert_core::{Device, JobPosting, KeywordSubscription};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::{JobSource, SourceError, SubscriptionDirectory};

pub fn load_fixture_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, Deserialize)]
struct PostingsFile {
    postings: Vec<JobPosting>,
}

#[derive(Debug, Clone, Deserialize)]
struct DirectoryFile {
    devices: Vec<Device>,
    subscriptions: Vec<KeywordSubscription>,
}

/// Serves postings from memory, as the scraper's table would.
#[derive(Debug, Clone)]
pub struct FixtureJobSource {
    postings: Vec<JobPosting>,
}

impl FixtureJobSource {
    pub fn new(mut postings: Vec<JobPosting>) -> Self {
        postings.sort_by_key(|p| p.id);
        Self { postings }
    }

    /// Reads `{"postings": [...]}`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let file: PostingsFile = load_fixture_file(path)?;
        Ok(Self::new(file.postings))
    }
}

#[async_trait]
impl JobSource for FixtureJobSource {
    async fn postings_since(
        &self,
        after_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<JobPosting>, SourceError> {
        Ok(self
            .postings
            .iter()
            .filter(|p| after_id.map_or(true, |after| p.id > after))
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Devices and subscriptions loaded from a file. Deactivations are kept in memory.
#[derive(Debug)]
pub struct FixtureDirectory {
    devices: Vec<Device>,
    subscriptions: Vec<KeywordSubscription>,
    deactivated: Mutex<HashSet<String>>,
}

impl FixtureDirectory {
    pub fn new(devices: Vec<Device>, subscriptions: Vec<KeywordSubscription>) -> Self {
        Self {
            devices,
            subscriptions,
            deactivated: Mutex::new(HashSet::new()),
        }
    }

    /// Reads `{"devices": [...], "subscriptions": [...]}`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let file: DirectoryFile = load_fixture_file(path)?;
        Ok(Self::new(file.devices, file.subscriptions))
    }

    pub async fn deactivated_tokens(&self) -> Vec<String> {
        let mut tokens = self
            .deactivated
            .lock()
            .await
            .iter()
            .cloned()
            .collect::<Vec<_>>();
        tokens.sort();
        tokens
    }
}

#[async_trait]
impl SubscriptionDirectory for FixtureDirectory {
    async fn active_subscriptions(&self) -> Result<Vec<KeywordSubscription>, SourceError> {
        let deactivated = self.deactivated.lock().await;
        let live: HashSet<&str> = self
            .devices
            .iter()
            .filter(|d| d.is_active && !deactivated.contains(&d.device_token))
            .map(|d| d.id.as_str())
            .collect();
        Ok(self
            .subscriptions
            .iter()
            .filter(|s| s.is_active && live.contains(s.device_id.as_str()))
            .cloned()
            .collect())
    }

    async fn devices(&self, device_ids: &[String]) -> Result<Vec<Device>, SourceError> {
        let deactivated = self.deactivated.lock().await;
        Ok(self
            .devices
            .iter()
            .filter(|d| device_ids.contains(&d.id))
            .cloned()
            .map(|mut d| {
                if deactivated.contains(&d.device_token) {
                    d.is_active = false;
                }
                d
            })
            .collect())
    }

    async fn deactivate_device_token(&self, device_token: &str) -> Result<(), SourceError> {
        self.deactivated
            .lock()
            .await
            .insert(device_token.to_string());
        Ok(())
    }
}
