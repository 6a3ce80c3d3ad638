// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use aviary::config::Config;

#[derive(Debug, Parser)]
#[command(name = "aviaryd", about = "Aviary session orchestration control plane")]
struct Cli {
    #[command(flatten)]
    config: Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // TLS crypto provider for reqwest/rustls.
    let _ = rustls::crypto::ring::default_provider().install_default();

    if let Err(e) = aviary::run(cli.config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
