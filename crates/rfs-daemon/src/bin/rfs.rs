//! rfs CLI - mount remote directories over SSH
//!
//! Usage:
//!   rfs up <alias>[:<path>] [mountpoint]   Mount a remote directory
//!   rfs ls                                 List all mounts
//!   rfs down [<alias>[:<path>]...]         Stop mounts (no args: all)
//!   rfs logs <alias>[:<path>]              Show logs for a mount

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use rfs_core::{parse_target, resolve_mount_name, Command, StateDir};
use rfs_daemon::{client, Supervisor};

#[derive(Parser)]
#[command(name = "rfs")]
#[command(about = "Mount remote directories over SSH", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount a remote directory
    Up {
        /// Target as <alias>[:<path>]; the path defaults to `~`
        target: String,

        /// Local mount point (default: under the state directory)
        mountpoint: Option<String>,
    },

    /// List all mounts
    Ls,

    /// Stop mounts; with no arguments, stop them all
    Down {
        /// Targets as <alias>[:<path>]
        targets: Vec<String>,
    },

    /// Show logs for a mount
    Logs {
        /// Target as <alias>[:<path>]
        target: String,
    },

    /// Run the supervisor in the foreground (started on demand)
    #[command(hide = true)]
    Daemon,
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            std::process::exit(1);
        }
    };

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    std::process::exit(run(cli.command).await);
}

async fn run(command: Commands) -> i32 {
    match command {
        Commands::Up { target, mountpoint } => {
            let (alias, path) = parse_target(&target);
            let response = match client::send_command(&Command::Up {
                ssh_alias: alias,
                remote_path: path,
                mount_dir: mountpoint,
            })
            .await
            {
                Ok(response) => response,
                Err(err) => return fail(&err.to_string()),
            };
            if let Some(error) = response.error {
                return fail(&error);
            }
            if let Some(mount) = response.mount {
                println!(
                    "{}:{}  port:{}  {}",
                    mount.ssh_alias, mount.remote_path, mount.port, mount.mount_dir
                );
            }
            0
        }

        Commands::Ls => {
            let response = match client::send_command(&Command::Ls).await {
                Ok(response) => response,
                Err(err) => return fail(&err.to_string()),
            };
            if let Some(error) = response.error {
                return fail(&error);
            }
            let mounts = response.mounts.unwrap_or_default();
            if mounts.is_empty() {
                println!("No mounts");
                return 0;
            }
            println!("{:<20} {:<6} {}", "ALIAS:PATH", "PORT", "MOUNT");
            for mount in mounts {
                println!(
                    "{:<20} {:<6} {}",
                    format!("{}:{}", mount.ssh_alias, mount.remote_path),
                    mount.port,
                    mount.mount_dir
                );
            }
            0
        }

        Commands::Down { targets } => {
            let names = targets.iter().map(|t| resolve_mount_name(t)).collect();
            let response = match client::send_command(&Command::Down { names }).await {
                Ok(response) => response,
                Err(err) => return fail(&err.to_string()),
            };
            if let Some(error) = response.error {
                return fail(&error);
            }
            for name in response.names.unwrap_or_default() {
                println!("{name} stopped");
            }
            0
        }

        Commands::Logs { target } => {
            let name = resolve_mount_name(&target);
            let log_file = StateDir::resolve().log_file(&name);
            match std::fs::read_to_string(&log_file) {
                Ok(contents) => {
                    print!("{contents}");
                    0
                }
                Err(err) => fail(&format!("{}: {err}", log_file.display())),
            }
        }

        Commands::Daemon => {
            let supervisor = Supervisor::new(StateDir::resolve());
            match supervisor.run().await {
                Ok(()) => 0,
                Err(err) => fail(&format!("supervisor failed: {err}")),
            }
        }
    }
}

fn fail(message: &str) -> i32 {
    eprintln!("Error: {message}");
    1
}
