use clap::Parser;
use cli::{Cli, Commands};
use std::sync::Arc;

mod bench;
mod cli;
mod commands;
mod logging;

fn main() -> anyhow::Result<()> {
    logging::init();

    let cli = Cli::parse();
    let index = Arc::new(commands::open(&cli.index)?);

    match cli.command {
        Commands::Init => commands::init(&index)?,
        Commands::Get(params) => commands::get(&index, &cli.index, params)?,
        Commands::Set(params) => commands::set(&index, &cli.index, params)?,
        Commands::Remove(params) => commands::remove(&index, &cli.index, params)?,
        Commands::Dump { limit } => commands::dump(&index, limit)?,
        Commands::Stats => commands::stats(&index)?,
        Commands::Bench(params) => bench::run(index.clone(), params)?,
    }

    index.close()?;
    Ok(())
}
