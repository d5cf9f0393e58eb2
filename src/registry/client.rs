use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;

use crate::config::{RegistryConfig, MANIFEST_ACCEPT_HEADER};
use crate::error::{ImageCycleError, Result};

/// One page of the registry's tag listing.
#[derive(Debug, Deserialize)]
pub struct TagPage {
    pub results: Vec<RawTag>,
    #[serde(default)]
    pub next: Option<String>,
}

/// A tag record as the registry reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTag {
    pub name: String,
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub full_size: u64,
    pub last_updated: DateTime<Utc>,
    /// Content hash of the tag's current manifest. Some listings carry it
    /// at the top level, some only per-architecture under `images`.
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub images: Vec<RawImage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawImage {
    #[serde(default)]
    pub digest: Option<String>,
}

impl RawTag {
    /// Best available content hash for this tag.
    pub fn content_digest(&self) -> Option<String> {
        self.digest
            .clone()
            .or_else(|| self.images.iter().find_map(|i| i.digest.clone()))
    }
}

/// HTTP client for one registry repository: paginated tag listing plus the
/// delete endpoints the reaper drives.
pub struct RegistryClient {
    http: Client,
    config: RegistryConfig,
}

impl RegistryClient {
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        let http = Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            config: config.clone(),
        })
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Fetch every page of the tag listing, following the `next` cursor
    /// until the registry reports no further page.
    pub async fn list_tags(&self) -> Result<Vec<RawTag>> {
        let mut results = Vec::new();
        let mut page = 1u32;
        loop {
            let tag_page = self.fetch_page(page).await?;
            tracing::debug!(page, count = tag_page.results.len(), "Fetched tag page");
            results.extend(tag_page.results);
            if tag_page.next.is_none() {
                break;
            }
            page += 1;
        }
        Ok(results)
    }

    async fn fetch_page(&self, page: u32) -> Result<TagPage> {
        let url = self.config.tags_url();
        let response = self
            .http
            .get(&url)
            .query(&[("page", page)])
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ImageCycleError::Registry(format!(
                "{}?page={} returned HTTP {}",
                url, page, status
            )));
        }

        let body = response.text().await?;
        // A body that is not JSON at all is a transport-level failure
        // (gateway error pages); JSON of the wrong shape is a decode error.
        let value: serde_json::Value = serde_json::from_str(&body).map_err(|_| {
            ImageCycleError::Transport(format!("{}?page={} returned a non-JSON body", url, page))
        })?;
        let tag_page: TagPage = serde_json::from_value(value)?;
        Ok(tag_page)
    }

    /// Issue one manifest DELETE, optionally with a bearer token. Returns
    /// the raw response; the caller decides how to handle a 401 challenge.
    pub async fn delete_manifest(
        &self,
        digest: &str,
        bearer: Option<&str>,
    ) -> Result<reqwest::Response> {
        let url = self.config.manifest_url(digest);
        let mut request = self
            .http
            .delete(&url)
            .header("Accept", MANIFEST_ACCEPT_HEADER);
        if let Some(token) = bearer {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        Ok(request.send().await?)
    }

    /// Hub-specific delete-by-tag-name endpoint, authorized with a session
    /// token from the hub login exchange.
    pub async fn delete_hub_tag(&self, tag: &str, session_token: &str) -> Result<reqwest::Response> {
        let url = self.config.hub_tag_url(tag);
        Ok(self
            .http
            .delete(&url)
            .header("Authorization", format!("JWT {}", session_token))
            .header("Accept", "application/json")
            .send()
            .await?)
    }
}
