use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tunwarden::{DownloadConfig, Installer, Supervisor, TunnelConfig, TunwardenError};

#[derive(Parser, Debug)]
#[command(name = "tunwarden")]
#[command(version)]
#[command(about = "Supervises a local tunnel agent and its forwarding endpoints")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download and install the tunnel agent binary
    Install {
        /// Where to place the binary (defaults to ~/.tunwarden/bin/tunneld)
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
    /// Open a tunnel from a JSON config file and run until interrupted
    Start {
        /// Supervisor configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Close one active tunnel by name
    Stop { name: String },
    /// List active tunnels
    List,
}

fn default_binary_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(".tunwarden")
        .join("bin")
        .join("tunneld")
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        error!("{err}");
        std::process::exit(err.exit_code());
    }
}

async fn run(cli: Cli) -> Result<(), TunwardenError> {
    match cli.command {
        Commands::Install { path } => {
            let target = path.unwrap_or_else(default_binary_path);
            let installer = Installer::new();
            let installed = installer
                .ensure_binary(&target, std::env::consts::OS, &DownloadConfig::default())
                .await?;
            println!("agent installed at {}", installed.display());
        }
        Commands::Start { config } => {
            let raw = tokio::fs::read_to_string(&config).await?;
            let config: TunnelConfig = serde_json::from_str(&raw)
                .map_err(|e| TunwardenError::Config(format!("invalid config file: {e}")))?;

            let supervisor = Supervisor::new();
            supervisor.on_crash(Box::new(|key| {
                error!(key = %key, "tunnel agent crashed; its tunnels are gone");
            }));

            let tunnel = supervisor.connect(&config).await?;
            println!("{} -> {}", tunnel.public_url, tunnel.local_addr);

            info!("tunnel up, press Ctrl-C to stop");
            let _ = tokio::signal::ctrl_c().await;

            supervisor.kill_all().await;
        }
        Commands::Stop { name } => {
            // The registry is in-memory per process; outside of an
            // embedding application this only reports unknown names.
            let supervisor = Supervisor::new();
            supervisor.disconnect(&name).await?;
            println!("tunnel {name} closed");
        }
        Commands::List => {
            let supervisor = Supervisor::new();
            for tunnel in supervisor.tunnels() {
                println!(
                    "{}\t{}\t{} -> {}",
                    tunnel.name, tunnel.proto, tunnel.public_url, tunnel.local_addr
                );
            }
        }
    }
    Ok(())
}
