use reqwest::StatusCode;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ReaperConfig;
use crate::error::Result;
use crate::registry::auth::{exchange_token, hub_session_token, parse_bearer_challenge};
use crate::scanner::{compare_tag_names, Category, Scanner, TagRecord};

/// One tag marked for deletion, with the content hash the last scan
/// recorded for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapTarget {
    pub tag: String,
    pub digest: Option<String>,
}

/// Applies the retention policy to scanner output and deletes the surplus
/// tags from the registry. Release tags are never touched.
pub struct Reaper {
    scanner: Arc<Scanner>,
    policy: ReaperConfig,
}

impl Reaper {
    pub fn new(scanner: Arc<Scanner>, policy: ReaperConfig) -> Self {
        tracing::debug!(
            keep_weeklies = policy.keep_weeklies,
            keep_dailies = policy.keep_dailies,
            keep_experimentals = policy.keep_experimentals,
            "Retention policy"
        );
        Self { scanner, policy }
    }

    /// Reapable categories from the full scan map, each ordered by
    /// last-updated ascending (oldest first). Releases are skipped
    /// entirely; they are never deleted.
    fn categorize(&self) -> HashMap<Category, Vec<TagRecord>> {
        let mut categorized: HashMap<Category, Vec<TagRecord>> = HashMap::new();
        let Some(result) = self.scanner.current() else {
            return categorized;
        };
        for record in result.records.values() {
            let category = Category::from_tag_name(&record.name);
            if matches!(
                category,
                Category::Weekly | Category::Daily | Category::Experimental
            ) {
                categorized.entry(category).or_default().push(record.clone());
            }
        }
        for list in categorized.values_mut() {
            list.sort_by(|a, b| match a.updated.cmp(&b.updated) {
                Ordering::Equal => compare_tag_names(&a.name, &b.name),
                other => other,
            });
        }
        categorized
    }

    /// Apply the retention counts: everything older than the kept tail of
    /// each category becomes a victim, with its hash from the last scan.
    pub fn select_victims(&self) -> Vec<ReapTarget> {
        let categorized = self.categorize();
        let mut victims = Vec::new();
        for (category, keep) in [
            (Category::Experimental, self.policy.keep_experimentals),
            (Category::Daily, self.policy.keep_dailies),
            (Category::Weekly, self.policy.keep_weeklies),
        ] {
            let Some(list) = categorized.get(&category) else {
                continue;
            };
            let surplus = list.len().saturating_sub(keep);
            for record in &list[..surplus] {
                victims.push(ReapTarget {
                    tag: record.name.clone(),
                    digest: record.digest.clone(),
                });
            }
        }
        tracing::debug!(count = victims.len(), "Selected reap victims");
        victims
    }

    /// Dry preview: the victim set as a space-separated tag list, with no
    /// deletion performed.
    pub fn report_reapable(&self) -> String {
        self.select_victims()
            .iter()
            .map(|v| v.tag.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Select and delete. Per-tag failures are logged and skipped; the
    /// run only fails on transport errors reaching the victim list.
    pub async fn reap(&self) -> Result<()> {
        let victims = self.select_victims();
        if victims.is_empty() {
            tracing::info!("No images to reap");
            return Ok(());
        }
        if self.policy.dry_run {
            let tags: Vec<&str> = victims.iter().map(|v| v.tag.as_str()).collect();
            tracing::info!(?tags, "Dry run: images that would be reaped");
            return Ok(());
        }
        if self.scanner.registry_config().is_public_hub() {
            self.delete_tags_from_hub(&victims).await
        } else {
            self.delete_manifests(&victims).await
        }
    }

    /// Standard distribution API: one manifest DELETE per victim, with a
    /// single bearer-challenge retry on 401.
    async fn delete_manifests(&self, victims: &[ReapTarget]) -> Result<()> {
        for victim in victims {
            let Some(digest) = &victim.digest else {
                tracing::warn!(tag = %victim.tag, "No content hash recorded; skipping");
                continue;
            };
            tracing::debug!(tag = %victim.tag, "Attempting to reap");
            match self.delete_one_manifest(digest).await {
                Ok(true) => {
                    self.scanner.remove_tag(&victim.tag);
                    self.scanner.write_cache().await;
                    tracing::info!(tag = %victim.tag, "Reaped");
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(tag = %victim.tag, "Delete failed: {}", e);
                }
            }
        }
        Ok(())
    }

    /// Returns true when the registry accepted the delete. A 401 is
    /// answered with exactly one token exchange and one retry.
    async fn delete_one_manifest(&self, digest: &str) -> Result<bool> {
        let registry = self.scanner.registry();
        let response = registry.delete_manifest(digest, None).await?;
        let response = if response.status() == StatusCode::UNAUTHORIZED {
            let www_auth = response
                .headers()
                .get("www-authenticate")
                .and_then(|h| h.to_str().ok())
                .map(|s| s.to_string());
            let Some(challenge) = www_auth.as_deref().and_then(parse_bearer_challenge) else {
                tracing::warn!("401 without a usable bearer challenge");
                return Ok(false);
            };
            let credentials = registry.config().credentials();
            let credentials = credentials.as_ref().map(|(u, p)| (u.as_str(), p.as_str()));
            let token = match exchange_token(registry.http(), &challenge, credentials).await {
                Ok(token) => token,
                Err(e) => {
                    // No token means no delete for this tag; the rest of
                    // the run continues.
                    tracing::warn!("Could not obtain delete token: {}", e);
                    return Ok(false);
                }
            };
            tracing::debug!("Retrying delete with fresh token");
            registry.delete_manifest(digest, Some(&token)).await?
        } else {
            response
        };

        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(%status, %body, "DELETE rejected");
        Ok(false)
    }

    /// The public hub's own API: exchange username/password for a session
    /// token once, then delete tags by name. A 404 counts as already gone.
    async fn delete_tags_from_hub(&self, victims: &[ReapTarget]) -> Result<()> {
        tracing::info!("Deleting tags via the hub API");
        let registry = self.scanner.registry();
        let Some((username, password)) = registry.config().credentials() else {
            tracing::error!("Hub deletion needs a username and password");
            return Ok(());
        };
        let token = match hub_session_token(registry.http(), &username, &password).await {
            Ok(token) => token,
            Err(e) => {
                tracing::error!("Could not acquire hub session token: {}", e);
                return Ok(());
            }
        };

        for victim in victims {
            tracing::info!(tag = %victim.tag, "Deleting tag");
            match registry.delete_hub_tag(&victim.tag, &token).await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() || status == StatusCode::NOT_FOUND {
                        // Gone either way; drop it from the map.
                        self.scanner.remove_tag(&victim.tag);
                        self.scanner.write_cache().await;
                    } else {
                        let body = response.text().await.unwrap_or_default();
                        tracing::warn!(tag = %victim.tag, %status, %body, "DELETE rejected");
                    }
                }
                Err(e) => {
                    tracing::warn!(tag = %victim.tag, "Delete failed: {}", e);
                }
            }
        }
        Ok(())
    }
}
