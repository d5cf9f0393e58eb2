use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{ImageCycleError, Result};

/// Default registry host (the public hub).
pub const DEFAULT_REGISTRY_HOST: &str = "hub.docker.com";

/// Accept header sent with manifest DELETE requests.
pub const MANIFEST_ACCEPT_HEADER: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Hub session-token login endpoint (the hub tag-delete API is not the
/// standard distribution API and needs its own auth exchange).
pub const HUB_LOGIN_URL: &str = "https://hub.docker.com/v2/users/login";

/// Field a scan sorts tag lists by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortField {
    /// Two-tier tag-name comparison (new underscore format before legacy).
    #[default]
    Name,
    /// Last-updated timestamp, newest first.
    Updated,
}

impl<'de> serde::Deserialize<'de> for SortField {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.to_lowercase().as_str() {
            "name" => Ok(SortField::Name),
            "updated" => Ok(SortField::Updated),
            _ => Err(serde::de::Error::custom(format!(
                "unknown variant `{}`, expected `name` or `updated`",
                s
            ))),
        }
    }
}

impl std::str::FromStr for SortField {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "name" => Ok(SortField::Name),
            "updated" => Ok(SortField::Updated),
            _ => Err(format!("Unknown sort field: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub prepull: PrepullConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub owner: String,
    pub name: String,
    /// Plain HTTP instead of HTTPS.
    #[serde(default)]
    pub insecure: bool,
    /// Override for the tag-listing path. Defaults to the hub-style
    /// `/v2/repositories/{owner}/{name}/tags/`.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Credentials for DELETE authorization (bearer exchange or hub login).
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_host() -> String {
    DEFAULT_REGISTRY_HOST.to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            host: default_host(),
            port: None,
            owner: String::new(),
            name: String::new(),
            insecure: false,
            path: None,
            timeout_secs: default_timeout_secs(),
            username: None,
            password: None,
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.owner.is_empty() || self.name.is_empty() {
            return Err(ImageCycleError::Config(
                "registry owner and name must be set".to_string(),
            ));
        }
        Ok(())
    }

    fn scheme(&self) -> &'static str {
        if self.insecure {
            "http"
        } else {
            "https"
        }
    }

    /// `host` or `host:port`.
    pub fn authority(&self) -> String {
        match self.port {
            Some(p) => format!("{}:{}", self.host, p),
            None => self.host.clone(),
        }
    }

    /// Full URL of the paginated tag-listing endpoint.
    pub fn tags_url(&self) -> String {
        let path = match &self.path {
            Some(p) => p.clone(),
            None => format!("/v2/repositories/{}/{}/tags/", self.owner, self.name),
        };
        format!("{}://{}{}", self.scheme(), self.authority(), path)
    }

    /// URL for deleting one manifest by content hash.
    pub fn manifest_url(&self, digest: &str) -> String {
        format!(
            "{}://{}/v2/{}/{}/manifests/{}",
            self.scheme(),
            self.authority(),
            self.owner,
            self.name,
            digest
        )
    }

    /// URL of the hub-specific delete-tag-by-name endpoint.
    pub fn hub_tag_url(&self, tag: &str) -> String {
        format!(
            "https://hub.docker.com/v2/repositories/{}/{}/tags/{}/",
            self.owner, self.name, tag
        )
    }

    /// Whether the hub-specific delete API applies instead of the
    /// distribution manifest API.
    pub fn is_public_hub(&self) -> bool {
        self.host.starts_with("hub.docker.com") || self.host.starts_with("registry.hub.docker.com")
    }

    /// Prefix for fully qualified image references. The public hub is
    /// elided entirely; container runtimes resolve bare `owner/name` there.
    pub fn image_prefix(&self) -> String {
        if self.host == DEFAULT_REGISTRY_HOST {
            return String::new();
        }
        format!("{}/", self.authority())
    }

    /// `host[:port]/owner/name:tag`, with the hub host elided.
    pub fn image_reference(&self, tag: &str) -> String {
        format!("{}{}/{}:{}", self.image_prefix(), self.owner, self.name, tag)
    }

    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.clone(), p.clone())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_dailies")]
    pub dailies: usize,
    #[serde(default = "default_weeklies")]
    pub weeklies: usize,
    #[serde(default = "default_releases")]
    pub releases: usize,
    #[serde(default)]
    pub sort_field: SortField,
    /// Optional on-disk JSON mirror of the scan result.
    #[serde(default)]
    pub cachefile: Option<PathBuf>,
    /// Interval for the periodic refresh task, if one is started.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Ceiling for the wait-for-first-scan backoff.
    #[serde(default = "default_scan_wait_ceiling_secs")]
    pub scan_wait_ceiling_secs: u64,
}

fn default_dailies() -> usize {
    3
}

fn default_weeklies() -> usize {
    2
}

fn default_releases() -> usize {
    1
}

fn default_refresh_interval_secs() -> u64 {
    3600
}

fn default_scan_wait_ceiling_secs() -> u64 {
    60
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            dailies: default_dailies(),
            weeklies: default_weeklies(),
            releases: default_releases(),
            sort_field: SortField::default(),
            cachefile: None,
            refresh_interval_secs: default_refresh_interval_secs(),
            scan_wait_ceiling_secs: default_scan_wait_ceiling_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepullConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Command the throwaway container runs; only the pull matters.
    #[serde(default = "default_command")]
    pub command: Vec<String>,
    /// UID the container runs as.
    #[serde(default)]
    pub uid: Option<i64>,
    /// Seconds between pod-phase polls.
    #[serde(default = "default_poll_delay_secs")]
    pub poll_delay_secs: u64,
    /// Poll attempts before a single pod is declared timed out.
    /// Together with the delay this defaults to about an hour per pod.
    #[serde(default = "default_max_poll_tries")]
    pub max_poll_tries: u32,
    /// Optional wall clock for the whole run, in seconds.
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
    #[serde(default)]
    pub node_policy: NodePolicy,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_command() -> Vec<String> {
    vec!["/bin/true".to_string()]
}

fn default_poll_delay_secs() -> u64 {
    1
}

fn default_max_poll_tries() -> u32 {
    3600
}

impl Default for PrepullConfig {
    fn default() -> Self {
        PrepullConfig {
            namespace: default_namespace(),
            command: default_command(),
            uid: None,
            poll_delay_secs: default_poll_delay_secs(),
            max_poll_tries: default_max_poll_tries(),
            run_timeout_secs: None,
            node_policy: NodePolicy::default(),
        }
    }
}

/// Label policy gating which nodes receive prepull pods. Lab-only versus
/// Lab+Dask eligibility is configuration, not code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePolicy {
    #[serde(default)]
    pub restrict_lab_nodes: bool,
    #[serde(default = "default_lab_label")]
    pub lab_label: String,
    #[serde(default)]
    pub allow_dask_spawn: bool,
    #[serde(default)]
    pub restrict_dask_nodes: bool,
    #[serde(default = "default_dask_label")]
    pub dask_label: String,
}

fn default_lab_label() -> String {
    "jupyterlab".to_string()
}

fn default_dask_label() -> String {
    "dask".to_string()
}

impl Default for NodePolicy {
    fn default() -> Self {
        NodePolicy {
            restrict_lab_nodes: false,
            lab_label: default_lab_label(),
            allow_dask_spawn: false,
            restrict_dask_nodes: false,
            dask_label: default_dask_label(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "default_keep_weeklies")]
    pub keep_weeklies: usize,
    #[serde(default = "default_keep_dailies")]
    pub keep_dailies: usize,
    #[serde(default = "default_keep_experimentals")]
    pub keep_experimentals: usize,
    #[serde(default)]
    pub dry_run: bool,
}

fn default_keep_weeklies() -> usize {
    78
}

fn default_keep_dailies() -> usize {
    15
}

fn default_keep_experimentals() -> usize {
    10
}

impl Default for ReaperConfig {
    fn default() -> Self {
        ReaperConfig {
            keep_weeklies: default_keep_weeklies(),
            keep_dailies: default_keep_dailies(),
            keep_experimentals: default_keep_experimentals(),
            dry_run: false,
        }
    }
}

impl Config {
    /// Load a TOML config file, then apply environment overrides.
    pub async fn load(path: Option<&std::path::Path>) -> Result<Config> {
        let mut config = match path {
            Some(p) => {
                let text = tokio::fs::read_to_string(p).await?;
                toml::from_str(&text)
                    .map_err(|e| ImageCycleError::Config(format!("{}: {}", p.display(), e)))?
            }
            None => Config::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Overlay environment-derived settings. These are the knobs the
    /// deployment charts set; anything else lives in the config file.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("LAB_REPO_HOST") {
            self.registry.host = v;
        }
        if let Ok(v) = std::env::var("LAB_REPO_OWNER") {
            self.registry.owner = v;
        }
        if let Ok(v) = std::env::var("LAB_REPO_NAME") {
            self.registry.name = v;
        }
        if let Some(v) = env_usize("PREPULLER_DAILIES") {
            self.scanner.dailies = v;
        }
        if let Some(v) = env_usize("PREPULLER_WEEKLIES") {
            self.scanner.weeklies = v;
        }
        if let Some(v) = env_usize("PREPULLER_RELEASES") {
            self.scanner.releases = v;
        }
        self.prepull.node_policy.restrict_lab_nodes |= env_bool("RESTRICT_LAB_NODES");
        self.prepull.node_policy.allow_dask_spawn |= env_bool("ALLOW_DASK_SPAWN");
        self.prepull.node_policy.restrict_dask_nodes |= env_bool("RESTRICT_DASK_NODES");
        if let Ok(v) = std::env::var("IMAGE_REAPER_USER") {
            self.registry.username = Some(v);
        }
        if let Ok(v) = std::env::var("IMAGE_REAPER_PASSWORD") {
            self.registry.password = Some(v);
        }
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Same truthiness rule the deployment charts rely on: unset, empty,
/// "false", "0", "no", and "n" are false; anything else is true.
fn env_bool(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => {
            let v = v.to_lowercase();
            !(v.is_empty() || v == "false" || v == "0" || v == "no" || v == "n")
        }
        Err(_) => false,
    }
}
