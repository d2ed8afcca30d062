use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pacsnode::config::Config;

#[derive(Parser, Debug)]
#[command(
    name = "pacsnode",
    about = "Imaging node accepting store, notify and echo associations"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    cmd: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Accept associations until interrupted (default)
    Listen,
    /// Send a verification echo to a configured remote
    Echo {
        /// Name of the remote in the configuration
        remote: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    match cli.cmd.unwrap_or(Cmd::Listen) {
        Cmd::Listen => pacsnode::run(config).await,
        Cmd::Echo { remote } => {
            pacsnode::logging::init(&config)?;
            let status = pacsnode::node::echo(&config, &remote).await?;
            println!("{}: {}", remote, status);
            if status.is_success() {
                Ok(())
            } else {
                Err(anyhow::anyhow!("echo answered with {}", status))
            }
        }
    }
}
