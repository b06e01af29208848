use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod quantity;
mod recipes;
mod semantic;
mod storage;
#[cfg(test)]
mod tests;
mod web;
use config::{Config, IndexBackend};
use semantic::{Embedder, EmbeddingModel, IndexBuilder, QueryService};

fn init_logging(level: &str) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_embedder(config: &Config) -> anyhow::Result<Arc<dyn Embedder>> {
    let model = EmbeddingModel::new(
        &config.embedding.model,
        config.model_cache_dir(),
        Some(Duration::from_secs(config.embedding.download_timeout_secs)),
    )?
    .with_batch_size(config.embedding.batch_size);

    Ok(Arc::new(model))
}

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();

    let config = Config::load_with(&args.data_dir)
        .with_context(|| format!("failed to load config from {}", args.data_dir.display()))?;
    init_logging(&config.log_level);

    match args.command {
        cli::Command::Prepare { input, output } => {
            let output = output.unwrap_or_else(|| config.corpus_path());
            let count = recipes::prepare_file(&input, &output)?;
            log::info!("wrote {count} recipes to {}", output.display());
            Ok(())
        }

        cli::Command::Build { corpus, flat } => {
            let corpus = corpus.unwrap_or_else(|| config.corpus_path());
            let backend = if flat {
                IndexBackend::Flat
            } else {
                config.index.backend
            };

            // fail on a bad corpus before loading the model
            let docs = recipes::load_corpus(&corpus)?;

            let report = IndexBuilder::new(load_embedder(&config)?, config.artifacts())
                .with_batch_size(config.embedding.batch_size)
                .with_backend(backend)
                .with_progress(true)
                .build(&docs)?;

            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }

        cli::Command::Serve { listen } => {
            let service = QueryService::load(load_embedder(&config)?, config.artifacts())
                .context("refusing to serve without a loadable index")?;

            web::start_daemon(config, Arc::new(service), listen)
        }

        cli::Command::Query { ingredients, top_k } => {
            let service = QueryService::load(load_embedder(&config)?, config.artifacts())?;
            let top_k = top_k.unwrap_or(config.server.default_top_k);

            let response = service.query(&ingredients, top_k)?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
    }
}
