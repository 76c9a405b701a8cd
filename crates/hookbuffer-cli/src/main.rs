use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = hookbuffer_cli::Cli::parse();
    hookbuffer_cli::init_tracing(&cli)?;
    hookbuffer_cli::run_cli(cli)
}
