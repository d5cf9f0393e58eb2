pub mod cache;
pub mod classify;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::{RegistryConfig, ScannerConfig, SortField};
use crate::error::{ImageCycleError, Result};
use crate::registry::client::{RawTag, RegistryClient};

pub use cache::ScanCache;
pub use classify::{compare_tag_names, describe_tag, Category};

/// One tag as reduced from the registry listing. Immutable once fetched;
/// unique by name within a scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagRecord {
    pub name: String,
    pub id: u64,
    pub size: u64,
    pub updated: DateTime<Utc>,
    /// Content hash of the tag's manifest, when the listing carried one.
    /// The reaper needs it for delete-by-manifest.
    #[serde(default)]
    pub digest: Option<String>,
}

impl TagRecord {
    fn from_raw(raw: &RawTag) -> TagRecord {
        TagRecord {
            name: raw.name.clone(),
            id: raw.id,
            size: raw.full_size,
            updated: raw.last_updated,
            digest: raw.content_digest(),
        }
    }
}

/// The outcome of one complete scan. Replaced wholesale on every
/// successful scan; readers always observe one consistent result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    /// Ranked tags per category. Daily/weekly/release lists are trimmed to
    /// the configured keep counts; experimental/latest/other stay whole.
    pub by_category: HashMap<Category, Vec<TagRecord>>,
    /// Kept tag names, flattened in display order.
    pub all_tags: Vec<String>,
    /// Every tag the scan saw, untrimmed, keyed by name. The reaper
    /// categorizes and selects victims from this map.
    pub records: HashMap<String, TagRecord>,
    pub last_scan: DateTime<Utc>,
}

impl ScanResult {
    pub fn category(&self, category: Category) -> &[TagRecord] {
        self.by_category
            .get(&category)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

/// Scans a registry repository and reduces the tag listing into ranked
/// categories. The current result lives behind an `Arc` that is swapped
/// atomically; a failed scan leaves the previous result in place.
pub struct Scanner {
    registry: RegistryClient,
    config: ScannerConfig,
    cache: Option<ScanCache>,
    current: RwLock<Option<Arc<ScanResult>>>,
}

impl Scanner {
    pub fn new(registry_config: &RegistryConfig, config: ScannerConfig) -> Result<Self> {
        registry_config.validate()?;
        let registry = RegistryClient::new(registry_config)?;
        let cache = config.cachefile.clone().map(ScanCache::new);
        Ok(Self {
            registry,
            config,
            cache,
            current: RwLock::new(None),
        })
    }

    pub fn registry(&self) -> &RegistryClient {
        &self.registry
    }

    pub fn registry_config(&self) -> &RegistryConfig {
        self.registry.config()
    }

    /// Seed the current result from the cache file, if one is configured
    /// and present. A live scan always wins once it completes; cache
    /// trouble is logged, never fatal.
    pub async fn load_cache(&self) {
        let Some(cache) = &self.cache else {
            return;
        };
        if !cache.path().exists() {
            tracing::debug!(path = %cache.path().display(), "No scan cache to read");
            return;
        }
        match cache.load().await {
            Ok(result) => {
                let mut current = self.current.write().unwrap();
                if current.is_none() {
                    tracing::info!(
                        path = %cache.path().display(),
                        tags = result.records.len(),
                        "Seeded scan data from cache"
                    );
                    *current = Some(Arc::new(result));
                }
            }
            Err(e) => {
                tracing::warn!("Could not read scan cache: {}", e);
            }
        }
    }

    /// Fetch every tag page and reduce the listing into a fresh
    /// `ScanResult`, replacing the previous one atomically.
    pub async fn scan(&self) -> Result<Arc<ScanResult>> {
        let raw = self.registry.list_tags().await?;
        tracing::debug!(tags = raw.len(), "Scan fetched tag listing");
        let result = Arc::new(self.reduce(&raw));
        {
            let mut current = self.current.write().unwrap();
            *current = Some(result.clone());
        }
        self.write_cache().await;
        Ok(result)
    }

    /// Reduce raw tag records into ranked, trimmed categories.
    fn reduce(&self, raw: &[RawTag]) -> ScanResult {
        // Key by name first: a paginated listing can repeat a tag across
        // page boundaries when the repository changes mid-scan.
        let mut records: HashMap<String, TagRecord> = HashMap::new();
        for tag in raw {
            records.insert(tag.name.clone(), TagRecord::from_raw(tag));
        }

        let mut by_category: HashMap<Category, Vec<TagRecord>> = HashMap::new();
        for record in records.values() {
            by_category
                .entry(Category::from_tag_name(&record.name))
                .or_default()
                .push(record.clone());
        }

        for list in by_category.values_mut() {
            sort_ranked(list, self.config.sort_field);
        }

        for (category, keep) in [
            (Category::Daily, self.config.dailies),
            (Category::Weekly, self.config.weeklies),
            (Category::Release, self.config.releases),
        ] {
            if let Some(list) = by_category.get_mut(&category) {
                list.truncate(keep);
            }
        }

        let mut all_tags = Vec::new();
        for category in Category::DISPLAY_ORDER {
            if let Some(list) = by_category.get(&category) {
                all_tags.extend(list.iter().map(|t| t.name.clone()));
            }
        }

        ScanResult {
            by_category,
            all_tags,
            records,
            last_scan: Utc::now(),
        }
    }

    /// The current scan result, if any scan (or cache load) has completed.
    pub fn current(&self) -> Option<Arc<ScanResult>> {
        self.current.read().unwrap().clone()
    }

    /// Kept tag names in display order. Pure read; never touches the
    /// network.
    pub fn all_tags(&self) -> Vec<String> {
        self.current()
            .map(|r| r.all_tags.clone())
            .unwrap_or_default()
    }

    /// The top `n` ranked tags of one category. Pure read.
    pub fn top_tags(&self, category: Category, n: usize) -> Vec<TagRecord> {
        self.current()
            .map(|r| r.category(category).iter().take(n).cloned().collect())
            .unwrap_or_default()
    }

    /// Full record for one tag from the last scan.
    pub fn tag_record(&self, name: &str) -> Option<TagRecord> {
        self.current()?.records.get(name).cloned()
    }

    /// Block until a scan result is available, backing off exponentially.
    /// Fails with `ScanNotReady` once the delay would exceed the ceiling.
    pub async fn wait_for_scan(&self) -> Result<Arc<ScanResult>> {
        let ceiling = self.config.scan_wait_ceiling_secs;
        let mut delay = 1u64;
        loop {
            if let Some(result) = self.current() {
                return Ok(result);
            }
            if delay > ceiling {
                return Err(ImageCycleError::ScanNotReady);
            }
            tracing::debug!(delay, "No scan result yet; waiting");
            tokio::time::sleep(Duration::from_secs(delay)).await;
            delay *= 2;
        }
    }

    /// Fully qualified image references plus display descriptions for the
    /// kept daily, weekly, and release tags.
    pub fn image_info(&self) -> (Vec<String>, Vec<String>) {
        let Some(result) = self.current() else {
            return (Vec::new(), Vec::new());
        };
        let registry = self.registry.config();
        let mut names = Vec::new();
        let mut descriptions = Vec::new();
        for category in [Category::Daily, Category::Weekly, Category::Release] {
            for record in result.category(category) {
                names.push(registry.image_reference(&record.name));
                if let Some(desc) = describe_tag(&record.name) {
                    descriptions.push(desc);
                }
            }
        }
        (names, descriptions)
    }

    /// Image references the prepuller should warm: experimental tags plus
    /// the kept daily/weekly/release tags.
    pub fn prepull_images(&self) -> Vec<String> {
        let Some(result) = self.current() else {
            return Vec::new();
        };
        let registry = self.registry.config();
        let mut images = Vec::new();
        for category in [
            Category::Experimental,
            Category::Daily,
            Category::Weekly,
            Category::Release,
        ] {
            for record in result.category(category) {
                images.push(registry.image_reference(&record.name));
            }
        }
        images
    }

    /// Drop one tag from the current result (after the reaper deleted it
    /// upstream). Builds a new result and swaps it in; concurrent readers
    /// keep whichever snapshot they already hold.
    pub fn remove_tag(&self, name: &str) {
        let mut current = self.current.write().unwrap();
        let Some(result) = current.as_ref() else {
            return;
        };
        let mut next = ScanResult::clone(result);
        next.records.remove(name);
        for list in next.by_category.values_mut() {
            list.retain(|t| t.name != name);
        }
        next.all_tags.retain(|t| t != name);
        *current = Some(Arc::new(next));
    }

    /// Rewrite the cache file from the current result. Log-only: a cache
    /// write failure never fails the operation that triggered it.
    pub async fn write_cache(&self) {
        let (Some(cache), Some(result)) = (&self.cache, self.current()) else {
            return;
        };
        if let Err(e) = cache.store(&result).await {
            tracing::warn!("Could not write scan cache: {}", e);
        }
    }

    /// Spawn the periodic refresh task. A failed scan keeps the previous
    /// result and is retried at the next tick.
    pub fn start_periodic(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scanner = self.clone();
        let interval = Duration::from_secs(scanner.config.refresh_interval_secs);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match scanner.scan().await {
                    Ok(result) => {
                        tracing::info!(tags = result.records.len(), "Periodic scan complete")
                    }
                    Err(e) => tracing::error!("Periodic scan failed: {}", e),
                }
            }
        })
    }
}

/// Rank a category list in place, best first.
fn sort_ranked(list: &mut [TagRecord], sort_field: SortField) {
    match sort_field {
        SortField::Name => list.sort_by(|a, b| compare_tag_names(&b.name, &a.name)),
        SortField::Updated => list.sort_by(|a, b| match b.updated.cmp(&a.updated) {
            // Name order breaks timestamp ties so scans are deterministic.
            Ordering::Equal => compare_tag_names(&b.name, &a.name),
            other => other,
        }),
    }
}
