use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Directory holding config.yaml, the corpus and index artifacts
    #[clap(long, global = true, default_value = "models")]
    pub data_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Turn a raw recipe JSON array into the clean JSONL corpus
    Prepare {
        /// Raw recipe file (JSON array)
        #[clap(short, long)]
        input: PathBuf,

        /// Output corpus, defaults to the configured corpus in the data dir
        #[clap(short, long)]
        output: Option<PathBuf>,
    },

    /// Embed the corpus and write the index artifacts
    Build {
        /// Corpus to index, defaults to the configured corpus in the data dir
        #[clap(long)]
        corpus: Option<PathBuf>,

        /// Skip the accelerated index and write the flat matrix
        #[clap(long, default_value = "false")]
        flat: bool,
    },

    /// Serve the HTTP API
    Serve {
        /// Listen address, e.g. 127.0.0.1:8000
        #[clap(short, long)]
        listen: Option<String>,
    },

    /// Find recipes for a list of ingredients and print them as json
    Query {
        /// Ingredients, e.g. `egg milk "olive oil"`
        #[clap(required = true)]
        ingredients: Vec<String>,

        /// Number of recipes to return
        #[clap(short = 'k', long)]
        top_k: Option<usize>,
    },
}
