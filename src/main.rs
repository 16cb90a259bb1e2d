use std::process::exit;

use clap::Parser;
use tag_watcher::args::{Args, Config};
use tag_watcher::builder::BuildxBuilder;
use tag_watcher::persistence::Persistence;
use tag_watcher::registry::RegistryClient;
use tag_watcher::sync;
use tracing::{error, info, trace};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    setup_tracing();
    trace!(args = ?args, "parsed args");

    let config = match Config::from_args(&args) {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "invalid configuration");
            exit(2);
        }
    };

    let registry = match RegistryClient::new(
        config.upstream_registry.clone(),
        config.upstream.name().clone(),
    ) {
        Ok(registry) => registry,
        Err(error) => {
            error!(%error, "failed to construct the upstream registry client");
            exit(2);
        }
    };

    if args.list_only {
        match registry.list_tags().await {
            Ok(tags) => {
                for tag in config.filter.candidates(&tags, config.only_tag.as_deref()) {
                    println!("{tag}");
                }
                return;
            }
            Err(error) => {
                error!(
                    error = &error as &dyn std::error::Error,
                    "failed to list upstream tags"
                );
                exit(1);
            }
        }
    }

    let persistence = match Persistence::new(&config.state).await {
        Ok(persistence) => persistence,
        Err(error) => {
            error!(%error, state = %config.state, "failed to open the state store");
            exit(2);
        }
    };

    if args.status {
        match persistence.all().await {
            Ok(records) => {
                for record in records {
                    println!(
                        "{}\t{}\t{}",
                        record.name,
                        record.last_build_status,
                        record.last_digest.as_deref().unwrap_or("-"),
                    );
                }
                return;
            }
            Err(error) => {
                error!(%error, "failed to read the state store");
                exit(1);
            }
        }
    }

    let builder = BuildxBuilder::new(
        config.dockerfile.clone(),
        config.context.clone(),
        config.pull,
    );

    if args.once {
        match sync::run_cycle(&config, &registry, &builder, &persistence).await {
            Ok(summary) => {
                info!(
                    built = summary.built.len(),
                    failed = summary.failed.len(),
                    skipped = summary.skipped,
                    unresolved = summary.unresolved,
                    "cycle complete"
                );
                exit(if summary.is_clean() { 0 } else { 1 });
            }
            Err(error) => {
                error!(error = &error as &dyn std::error::Error, "cycle failed");
                exit(1);
            }
        }
    }

    sync::run(&config, &registry, &builder, &persistence).await;
}

fn setup_tracing() {
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer())
        .init();
}
