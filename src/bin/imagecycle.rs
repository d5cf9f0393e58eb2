//! Batch entry points for the image lifecycle jobs: scan and report the
//! repository, prepull the selected images onto every node, or reap tags
//! that fell out of the retention window. Each subcommand runs once and
//! exits; an external scheduler provides the cadence.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use imagecycle::cluster::KubeCluster;
use imagecycle::config::Config;
use imagecycle::prepull::Prepuller;
use imagecycle::reaper::Reaper;
use imagecycle::scanner::Scanner;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file; environment variables override it.
    #[arg(short, long, env = "IMAGECYCLE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan the registry and print the kept images.
    Scan {
        /// Emit the full scan result as JSON instead of environment lines.
        #[arg(long)]
        json: bool,
    },
    /// Warm every schedulable node's image cache.
    Prepull {
        /// Extra image references to pull alongside the scan selection.
        #[arg(long = "image")]
        images: Vec<String>,
        /// Skip the registry scan and pull only the explicit images.
        #[arg(long)]
        no_scan: bool,
    },
    /// Delete tags that exceed the retention counts.
    Reap {
        /// Compute and log the victim set without deleting anything.
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Scan { json } => run_scan(config, json).await?,
        Commands::Prepull { images, no_scan } => run_prepull(config, images, no_scan).await?,
        Commands::Reap { dry_run } => run_reap(config, dry_run).await?,
    }
    Ok(())
}

async fn run_scan(config: Config, json: bool) -> imagecycle::Result<()> {
    let scanner = Scanner::new(&config.registry, config.scanner)?;
    scanner.load_cache().await;
    let result = scanner.scan().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(result.as_ref())?);
        return Ok(());
    }

    let (names, descriptions) = scanner.image_info();
    println!("# Environment variables for notebook containers");
    println!("LAB_CONTAINER_NAMES='{}'", names.join(","));
    println!("LAB_CONTAINER_DESCS='{}'", descriptions.join(","));
    println!("export LAB_CONTAINER_NAMES LAB_CONTAINER_DESCS");
    Ok(())
}

async fn run_prepull(
    config: Config,
    images: Vec<String>,
    no_scan: bool,
) -> imagecycle::Result<()> {
    let cluster = Arc::new(KubeCluster::connect().await?);
    let mut prepuller = Prepuller::new(cluster, config.prepull.clone());
    prepuller.add_images(images);

    if !no_scan {
        let scanner = Scanner::new(&config.registry, config.scanner)?;
        scanner.load_cache().await;
        scanner.scan().await?;
        prepuller.update_images_from_scan(&scanner);
    }

    prepuller.build_node_list().await?;
    prepuller.build_pod_specs();
    // Leftovers from an interrupted earlier run would collide with the
    // names this run derives.
    prepuller.clean_completed_pods().await?;
    prepuller.run().await?;
    prepuller.clean_completed_pods().await?;
    Ok(())
}

async fn run_reap(mut config: Config, dry_run: bool) -> imagecycle::Result<()> {
    config.reaper.dry_run |= dry_run;
    let scanner = Arc::new(Scanner::new(&config.registry, config.scanner)?);
    scanner.load_cache().await;
    scanner.scan().await?;

    let reaper = Reaper::new(scanner, config.reaper);
    reaper.reap().await
}
