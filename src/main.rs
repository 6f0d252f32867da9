use anyhow::Result;
use clap::Parser;

use krill::cli::{self, Cli, Commands};
use krill::paths::Paths;

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    match cli.command {
        Commands::Agent(args) => cli::agent::run(args).await,
        Commands::Gateway => cli::gateway::run().await,
        Commands::Paths => {
            let paths = Paths::resolve()?;
            println!("home:     {}", paths.home.display());
            println!("config:   {}", paths.config_file.display());
            println!("auth:     {}", paths.auth_file.display());
            println!("state:    {}", paths.state_file.display());
            println!("sessions: {}", paths.sessions_dir.display());
            Ok(())
        }
    }
}
