//! Unit tests for configuration
//!
//! Tests for sort-field parsing, registry URL construction, and defaults.

use imagecycle::config::{Config, RegistryConfig, SortField};
use std::str::FromStr;

#[test]
fn test_sort_field_from_str() {
    assert_eq!(SortField::from_str("name").unwrap(), SortField::Name);
    assert_eq!(SortField::from_str("updated").unwrap(), SortField::Updated);
    assert_eq!(SortField::from_str("UPDATED").unwrap(), SortField::Updated);
    assert!(SortField::from_str("size").is_err());
}

#[test]
fn test_sort_field_deserialize() {
    #[derive(serde::Deserialize)]
    struct Wrapper {
        sort_field: SortField,
    }
    let w: Wrapper = toml::from_str(r#"sort_field = "updated""#).unwrap();
    assert_eq!(w.sort_field, SortField::Updated);
    let bad: Result<Wrapper, _> = toml::from_str(r#"sort_field = "size""#);
    assert!(bad.is_err());
}

#[test]
fn test_config_defaults() {
    let toml_str = r#"
[registry]
owner = "testowner"
name = "lab"
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.registry.host, "hub.docker.com");
    assert_eq!(config.scanner.dailies, 3);
    assert_eq!(config.scanner.weeklies, 2);
    assert_eq!(config.scanner.releases, 1);
    assert_eq!(config.prepull.namespace, "default");
    assert_eq!(config.prepull.max_poll_tries, 3600);
    assert_eq!(config.reaper.keep_weeklies, 78);
    assert_eq!(config.reaper.keep_dailies, 15);
    assert_eq!(config.reaper.keep_experimentals, 10);
    assert!(!config.reaper.dry_run);
    assert!(!config.prepull.node_policy.restrict_lab_nodes);
    assert_eq!(config.prepull.node_policy.lab_label, "jupyterlab");
}

#[test]
fn test_registry_urls() {
    let registry = RegistryConfig {
        host: "registry.example.com".to_string(),
        port: Some(5000),
        owner: "testowner".to_string(),
        name: "lab".to_string(),
        ..Default::default()
    };
    assert_eq!(
        registry.tags_url(),
        "https://registry.example.com:5000/v2/repositories/testowner/lab/tags/"
    );
    assert_eq!(
        registry.manifest_url("sha256:abc"),
        "https://registry.example.com:5000/v2/testowner/lab/manifests/sha256:abc"
    );
    assert_eq!(
        registry.image_reference("w_2023_05"),
        "registry.example.com:5000/testowner/lab:w_2023_05"
    );
    assert!(!registry.is_public_hub());
}

#[test]
fn test_insecure_registry_uses_http() {
    let registry = RegistryConfig {
        host: "127.0.0.1".to_string(),
        port: Some(8080),
        owner: "o".to_string(),
        name: "n".to_string(),
        insecure: true,
        ..Default::default()
    };
    assert!(registry.tags_url().starts_with("http://127.0.0.1:8080/"));
}

#[test]
fn test_public_hub_elides_host_from_image_references() {
    let registry = RegistryConfig {
        owner: "testowner".to_string(),
        name: "lab".to_string(),
        ..Default::default()
    };
    assert!(registry.is_public_hub());
    assert_eq!(registry.image_reference("r170"), "testowner/lab:r170");
    assert_eq!(
        registry.hub_tag_url("r170"),
        "https://hub.docker.com/v2/repositories/testowner/lab/tags/r170/"
    );
}

#[test]
fn test_environment_overrides() {
    // No other test touches these variables, so this is race-free even
    // with the parallel test runner.
    std::env::set_var("LAB_REPO_HOST", "registry.internal.example.com");
    std::env::set_var("LAB_REPO_OWNER", "platform");
    std::env::set_var("LAB_REPO_NAME", "scilab");
    std::env::set_var("PREPULLER_DAILIES", "5");
    std::env::set_var("RESTRICT_LAB_NODES", "true");
    std::env::set_var("IMAGE_REAPER_USER", "reaper");
    std::env::set_var("IMAGE_REAPER_PASSWORD", "sekrit");

    let mut config = Config::default();
    config.apply_env();
    assert_eq!(config.registry.host, "registry.internal.example.com");
    assert_eq!(config.registry.owner, "platform");
    assert_eq!(config.registry.name, "scilab");
    assert_eq!(config.scanner.dailies, 5);
    assert!(config.prepull.node_policy.restrict_lab_nodes);
    assert_eq!(
        config.registry.credentials(),
        Some(("reaper".to_string(), "sekrit".to_string()))
    );

    for var in [
        "LAB_REPO_HOST",
        "LAB_REPO_OWNER",
        "LAB_REPO_NAME",
        "PREPULLER_DAILIES",
        "RESTRICT_LAB_NODES",
        "IMAGE_REAPER_USER",
        "IMAGE_REAPER_PASSWORD",
    ] {
        std::env::remove_var(var);
    }
}

#[test]
fn test_registry_validation() {
    let registry = RegistryConfig::default();
    assert!(registry.validate().is_err());

    let registry = RegistryConfig {
        owner: "o".to_string(),
        name: "n".to_string(),
        ..Default::default()
    };
    assert!(registry.validate().is_ok());
}
