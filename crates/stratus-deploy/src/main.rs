//! The `stratus` command-line tool.

use anyhow::Result;
use clap::Parser;

use stratus_deploy::cli::{self, Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(cli::execute(cli))
}
