//! devloop CLI
//!
//! Usage:
//!   devloop
//!   devloop path/to/devloop.yaml -s web
//!   devloop --dry-run --json

use devloop::{DockerCli, Manifest, Orchestrator, RunArgs};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    let args: RunArgs = argh::from_env();

    // Initialize logging
    let env = env_logger::Env::default().default_filter_or(args.log_filter());
    env_logger::init_from_env(env);

    // Load manifest
    log::info!("Loading manifest: {}", args.manifest);
    let manifest = match Manifest::from_file(Path::new(&args.manifest)) {
        Ok(m) => m,
        Err(e) => {
            log::error!("Failed to load manifest: {}", e);
            std::process::exit(1);
        }
    };

    // Validate only mode
    if args.validate {
        let graph = match args.graph(&manifest) {
            Ok(g) => g,
            Err(e) => {
                log::error!("Invalid dependency graph: {}", e);
                std::process::exit(1);
            }
        };
        let levels = graph.levels();
        let services: usize = levels.iter().map(Vec::len).sum();
        let resources = graph.len() - services;
        if args.json {
            let summary = serde_json::json!({
                "manifest": args.manifest,
                "valid": true,
                "services": services,
                "resources": resources,
                "levels": levels,
            });
            println!("{}", summary);
        } else {
            println!("Manifest '{}' is valid", args.manifest);
            println!("  Services: {}", services);
            println!("  Resources: {}", resources);
            println!("  Levels: {}", levels.len());
        }
        return;
    }

    let engine = Arc::new(DockerCli::new(args.engine.clone()));
    let mut orchestrator = match Orchestrator::new(manifest, args.orchestrator_config(), engine) {
        Ok(o) => o,
        Err(e) => {
            log::error!("Failed to create orchestrator: {}", e);
            std::process::exit(1);
        }
    };

    // Dry run mode
    if args.dry_run {
        match orchestrator.plan() {
            Ok(plan) if args.json => match serde_json::to_string_pretty(&plan) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    log::error!("Failed to serialize launch plan: {}", e);
                    std::process::exit(1);
                }
            },
            Ok(plan) => println!("{}", plan),
            Err(e) => {
                log::error!("Failed to generate launch plan: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    // Set up Ctrl+C handler
    {
        let shutdown_tx = shutdown_tx.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            log::info!("Received Ctrl+C, initiating shutdown...");
            let _ = shutdown_tx.send(());
        }) {
            log::error!("Failed to set Ctrl+C handler: {}", e);
            std::process::exit(1);
        }
    }

    // Start all services
    if let Err(e) = orchestrator.start_all(shutdown_rx.clone()).await {
        log::error!("Startup failed: {}", e);
        orchestrator.stop_all().await;
        std::process::exit(1);
    }

    for (name, url) in orchestrator.service_urls() {
        log::info!("  {} -> {}", name, url);
    }

    // Wait for shutdown signal or all services to exit
    orchestrator.wait(shutdown_rx).await;

    // Stop all services
    orchestrator.stop_all().await;

    log::info!("devloop exiting");
}
