use std::{collections::HashMap, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::session::{ProgressRecord, UserChoice};

/// The auth-status lookup is display-only; it aborts early rather than
/// hold up the tuning UI. Progress traffic carries no timeout at all.
const AUTH_STATUS_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CatalogResponse {
    pub frequencies: Vec<String>,
    #[serde(rename = "assetBaseUrl")]
    pub asset_base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthStatus {
    pub authenticated: bool,
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    pub username: Option<String>,
}

/// The write side of the progress store, split out so the adapter's
/// dedupe/busy/monotonic logic can be exercised against a mock.
pub trait ProgressBackend: Send + Sync {
    fn read_progress(
        &self,
        user_id: &str,
        frequency: &str,
    ) -> impl std::future::Future<Output = Result<Option<ProgressRecord>>> + Send;
    fn write_progress(
        &self,
        user_id: &str,
        frequency: &str,
        record: ProgressRecord,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
    fn write_choice(
        &self,
        user_id: &str,
        choice: &UserChoice,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone)]
pub struct RadioApi {
    http: reqwest::Client,
    base: String,
}

impl RadioApi {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base_url.trim_end_matches('/').to_owned(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    /// `GET frequencies`. Accepts both the catalog-object shape and a bare
    /// string array from older servers.
    pub async fn fetch_catalog(&self) -> Result<CatalogResponse> {
        let raw: Value = self
            .http
            .get(self.url("/api/frequencies"))
            .send()
            .await
            .context("frequency catalog request failed")?
            .error_for_status()
            .context("frequency catalog request rejected")?
            .json()
            .await
            .context("frequency catalog response was not json")?;

        if let Ok(catalog) = serde_json::from_value::<CatalogResponse>(raw.clone()) {
            if !catalog.frequencies.is_empty() {
                return Ok(catalog);
            }
        }
        let frequencies: Vec<String> =
            serde_json::from_value(raw).context("frequency catalog had an unknown shape")?;
        Ok(CatalogResponse {
            frequencies,
            asset_base_url: None,
        })
    }

    /// `GET availableFrequencies(userId)`: the access-filtered list.
    pub async fn fetch_available(&self, user_id: &str) -> Result<Vec<String>> {
        self.http
            .get(self.url("/api/frequencies/available"))
            .query(&[("user", user_id)])
            .send()
            .await
            .context("available-frequencies request failed")?
            .error_for_status()?
            .json()
            .await
            .context("available-frequencies response was not json")
    }

    /// `GET dialogue(frequency)`: the raw script document, normalized by
    /// the caller.
    pub async fn fetch_dialogue(&self, frequency: &str) -> Result<Value> {
        self.http
            .get(self.url("/api/dialogue"))
            .query(&[("frequency", frequency)])
            .send()
            .await
            .with_context(|| format!("dialogue request for {frequency} failed"))?
            .error_for_status()?
            .json()
            .await
            .with_context(|| format!("dialogue response for {frequency} was not json"))
    }

    pub async fn fetch_auth_status(&self) -> Result<AuthStatus> {
        self.http
            .get(self.url("/api/auth/status"))
            .timeout(AUTH_STATUS_TIMEOUT)
            .send()
            .await
            .context("auth status request failed")?
            .error_for_status()?
            .json()
            .await
            .context("auth status response was not json")
    }

    pub async fn fetch_progress(&self, user_id: &str) -> Result<HashMap<String, ProgressRecord>> {
        self.http
            .get(self.url("/api/progress"))
            .query(&[("user", user_id)])
            .send()
            .await
            .context("progress fetch failed")?
            .error_for_status()?
            .json()
            .await
            .context("progress response was not json")
    }

    pub async fn fetch_choices(&self, user_id: &str, frequency: &str) -> Result<Vec<UserChoice>> {
        self.http
            .get(self.url("/api/choices"))
            .query(&[("user", user_id), ("frequency", frequency)])
            .send()
            .await
            .context("choice fetch failed")?
            .error_for_status()?
            .json()
            .await
            .context("choice response was not json")
    }

    pub async fn fetch_repeats(&self, user_id: &str) -> Result<HashMap<String, u32>> {
        self.http
            .get(self.url("/api/repeats"))
            .query(&[("user", user_id)])
            .send()
            .await
            .context("repeat-count fetch failed")?
            .error_for_status()?
            .json()
            .await
            .context("repeat-count response was not json")
    }

    pub async fn post_repeat(&self, user_id: &str, frequency: &str, count: u32) -> Result<()> {
        self.http
            .post(self.url("/api/repeats"))
            .query(&[("user", user_id), ("frequency", frequency)])
            .json(&serde_json::json!({ "count": count }))
            .send()
            .await
            .context("repeat-count save failed")?
            .error_for_status()
            .context("repeat-count save rejected")?;
        Ok(())
    }
}

impl ProgressBackend for RadioApi {
    async fn read_progress(
        &self,
        user_id: &str,
        frequency: &str,
    ) -> Result<Option<ProgressRecord>> {
        let response = self
            .http
            .get(self.url("/api/progress"))
            .query(&[("user", user_id), ("frequency", frequency)])
            .send()
            .await
            .context("progress read failed")?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let record = response
            .error_for_status()?
            .json()
            .await
            .context("progress read response was not json")?;
        Ok(Some(record))
    }

    async fn write_progress(
        &self,
        user_id: &str,
        frequency: &str,
        record: ProgressRecord,
    ) -> Result<()> {
        self.http
            .post(self.url("/api/progress"))
            .query(&[("user", user_id), ("frequency", frequency)])
            .json(&record)
            .send()
            .await
            .context("progress write failed")?
            .error_for_status()
            .context("progress write rejected")?;
        Ok(())
    }

    async fn write_choice(&self, user_id: &str, choice: &UserChoice) -> Result<()> {
        self.http
            .post(self.url("/api/choices"))
            .query(&[("user", user_id)])
            .json(choice)
            .send()
            .await
            .context("choice write failed")?
            .error_for_status()
            .context("choice write rejected")?;
        Ok(())
    }
}
