use anyhow::Result;
use clap::Parser;
use sustainability_cli::{init_tracing, run_cli, Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.engine_config()?)?;
    run_cli(cli)
}
