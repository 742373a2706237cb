use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cmd::{
    bundle::Bundle, extract::Extract, inspect::Inspect, load::Load, mounts::Mounts, pull::Pull,
    push::Push, rebuild::Rebuild, save::Save, search::Search, search_tarball::SearchTarball,
    Globals,
};

mod cmd;

#[derive(Parser, Debug)]
#[command(version, about = "Stream container images between registries, daemons and archives")]
struct Args {
    #[command(flatten)]
    globals: Globals,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Parser, Debug)]
enum Commands {
    Pull(Pull),
    Extract(Extract),
    Bundle(Bundle),
    Mounts(Mounts),
    Load(Load),
    Save(Save),
    Push(Push),
    Rebuild(Rebuild),
    Search(Search),
    SearchTarball(SearchTarball),
    Inspect(Inspect),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let globals = args.globals.clone();
    let result = match args.command {
        Commands::Pull(cmd) => cmd.run(&globals).await,
        Commands::Extract(cmd) => cmd.run(&globals).await,
        Commands::Bundle(cmd) => cmd.run(&globals).await,
        Commands::Mounts(cmd) => cmd.run(&globals).await,
        Commands::Load(cmd) => cmd.run(&globals).await,
        Commands::Save(cmd) => cmd.run(&globals).await,
        Commands::Push(cmd) => cmd.run(&globals).await,
        Commands::Rebuild(cmd) => cmd.run(&globals).await,
        Commands::Search(cmd) => cmd.run(&globals).await,
        Commands::SearchTarball(cmd) => cmd.run(&globals).await,
        Commands::Inspect(cmd) => cmd.run(&globals).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error ({}): {err}", err.kind());
            ExitCode::FAILURE
        }
    }
}
