// src/settings.rs
use crate::adapters::SettingStore;
use crate::error::CoinError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Manual submissions further than this multiple above the user's average
/// are flagged.
pub const SUSPICIOUS_RATIO_KEY: &str = "suspicious_activity_ratio";
pub const DEFAULT_SUSPICIOUS_RATIO: f64 = 1.5;

/// Minimum anomaly score for a flagged submission to surface in the admin
/// review queue.
pub const REVIEW_THRESHOLD_KEY: &str = "suspicious_review_threshold";
pub const DEFAULT_REVIEW_THRESHOLD: f64 = 70.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Setting {
    pub key: String,
    pub value: String,
    pub description: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Setting {
    pub fn new(key: impl Into<String>, value: impl Into<String>, description: Option<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            description,
            updated_at: Utc::now(),
        }
    }
}

/// Runtime-tunable settings backed by the storage adapter, so a write from
/// one process is visible to every other on the next read.
#[derive(Clone)]
pub struct SettingsService {
    store: Arc<dyn SettingStore>,
}

impl SettingsService {
    pub fn new(store: Arc<dyn SettingStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Setting>, CoinError> {
        self.store.get_setting(key).await
    }

    pub async fn list(&self) -> Result<Vec<Setting>, CoinError> {
        self.store.list_settings().await
    }

    pub async fn update(
        &self,
        key: &str,
        value: impl Into<String>,
        description: Option<String>,
    ) -> Result<Setting, CoinError> {
        let setting = Setting::new(key, value, description);
        self.store.put_setting(setting.clone()).await?;
        Ok(setting)
    }

    /// Numeric read with fallback: absent or malformed values yield the
    /// default, storage failures propagate.
    pub async fn get_f64(&self, key: &str, default: f64) -> Result<f64, CoinError> {
        let value = self
            .store
            .get_setting(key)
            .await?
            .and_then(|s| s.value.parse::<f64>().ok())
            .unwrap_or(default);
        Ok(value)
    }

    pub async fn suspicious_ratio(&self) -> Result<f64, CoinError> {
        self.get_f64(SUSPICIOUS_RATIO_KEY, DEFAULT_SUSPICIOUS_RATIO).await
    }

    pub async fn review_threshold(&self) -> Result<f64, CoinError> {
        self.get_f64(REVIEW_THRESHOLD_KEY, DEFAULT_REVIEW_THRESHOLD).await
    }
}

/// Default rows seeded into a fresh store.
pub(crate) fn default_settings() -> Vec<Setting> {
    vec![
        Setting::new(
            SUSPICIOUS_RATIO_KEY,
            DEFAULT_SUSPICIOUS_RATIO.to_string(),
            Some("Reject manual step submissions above this multiple of the user's average".to_string()),
        ),
        Setting::new(
            REVIEW_THRESHOLD_KEY,
            DEFAULT_REVIEW_THRESHOLD.to_string(),
            Some("Minimum anomaly score shown in the admin review queue".to_string()),
        ),
    ]
}
