//! thinvolctl - CLI client for the thinvold daemon.
//!
//! Usage:
//!   thinvolctl volume create --size 4194304
//!   thinvolctl snapshot create <volume>
//!   thinvolctl objectstore register vfs vfs.path=/srv/backups
//!   thinvolctl backup create <snapshot> --volume <v> --store <s>

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use uuid::Uuid;

use thinvol::control::{Request, Response};

const DEFAULT_SOCKET_PATH: &str = "/run/thinvol/thinvol.sock";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "thinvolctl")]
#[command(about = "Control the thinvold daemon")]
struct Cli {
    /// Control socket path
    #[arg(short, long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Volume management
    Volume {
        #[command(subcommand)]
        command: VolumeCommands,
    },
    /// Snapshot management
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommands,
    },
    /// Base image management
    Image {
        #[command(subcommand)]
        command: ImageCommands,
    },
    /// Object store management
    Objectstore {
        #[command(subcommand)]
        command: StoreCommands,
    },
    /// Backup management
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },
    /// Show daemon and driver information
    Info,
}

#[derive(Subcommand)]
enum VolumeCommands {
    /// Create a volume
    Create {
        /// Volume size in bytes
        #[arg(long)]
        size: u64,
        /// Volume UUID (minted if omitted)
        #[arg(long)]
        id: Option<Uuid>,
        /// Base image UUID
        #[arg(long)]
        base: Option<Uuid>,
    },
    /// Delete a volume
    Delete { id: Uuid },
    /// List volumes
    List {
        /// Limit to one volume
        #[arg(long)]
        id: Option<Uuid>,
    },
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// Create a snapshot of a volume
    Create {
        /// Parent volume UUID
        volume: Uuid,
        /// Snapshot UUID (minted if omitted)
        #[arg(long)]
        id: Option<Uuid>,
    },
    /// Delete a snapshot
    Delete {
        id: Uuid,
        #[arg(long)]
        volume: Uuid,
    },
}

#[derive(Subcommand)]
enum ImageCommands {
    /// Loopback-attach an image file
    Activate {
        /// Image file path
        file: PathBuf,
        /// Image UUID (minted if omitted)
        #[arg(long)]
        id: Option<Uuid>,
    },
    /// Detach an image
    Deactivate { id: Uuid },
}

#[derive(Subcommand)]
enum StoreCommands {
    /// Register an object store
    Register {
        /// Driver kind (vfs, s3)
        kind: String,
        /// Driver options as key=value pairs
        opts: Vec<String>,
    },
    /// Drop the local handle of an object store
    Deregister { id: Uuid },
    /// Add a volume to an object store
    AddVolume {
        store: Uuid,
        volume: Uuid,
    },
    /// Remove a volume and all of its backups from an object store
    RemoveVolume {
        store: Uuid,
        volume: Uuid,
    },
    /// List a volume's backups in an object store
    ListVolume {
        store: Uuid,
        volume: Uuid,
        #[arg(long)]
        snapshot: Option<Uuid>,
    },
}

#[derive(Subcommand)]
enum BackupCommands {
    /// Back up a snapshot into an object store
    Create {
        snapshot: Uuid,
        #[arg(long)]
        volume: Uuid,
        #[arg(long)]
        store: Uuid,
    },
    /// Restore a backed-up snapshot onto a volume
    Restore {
        snapshot: Uuid,
        /// Volume the snapshot was backed up from
        #[arg(long)]
        volume: Uuid,
        /// Target volume to restore onto
        #[arg(long)]
        target: Uuid,
        #[arg(long)]
        store: Uuid,
    },
    /// Remove a backed-up snapshot and collect unreferenced blocks
    Remove {
        snapshot: Uuid,
        #[arg(long)]
        volume: Uuid,
        #[arg(long)]
        store: Uuid,
    },
}

fn parse_opts(pairs: &[String]) -> Result<HashMap<String, String>> {
    let mut opts = HashMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid option {pair:?}, expected key=value"))?;
        opts.insert(key.to_string(), value.to_string());
    }
    Ok(opts)
}

fn format_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 * 1024 {
        format!("{:.2} GiB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    } else if bytes >= 1024 * 1024 {
        format!("{:.2} MiB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.2} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

async fn send_request(socket: &PathBuf, request: Request) -> Result<Response> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(socket))
        .await
        .with_context(|| format!("Timed out connecting to daemon at {}", socket.display()))?
        .with_context(|| format!("Failed to connect to daemon at {}", socket.display()))?;

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let req_json = serde_json::to_string(&request)? + "\n";
    writer.write_all(req_json.as_bytes()).await?;

    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let response: Response = serde_json::from_str(&line)?;

    Ok(response)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let request = match cli.command {
        Commands::Volume { command } => match command {
            VolumeCommands::Create { size, id, base } => Request::VolumeCreate { id, size, base },
            VolumeCommands::Delete { id } => Request::VolumeDelete { id },
            VolumeCommands::List { id } => Request::VolumeList { id },
        },
        Commands::Snapshot { command } => match command {
            SnapshotCommands::Create { volume, id } => Request::SnapshotCreate { id, volume },
            SnapshotCommands::Delete { id, volume } => Request::SnapshotDelete { id, volume },
        },
        Commands::Image { command } => match command {
            ImageCommands::Activate { file, id } => Request::ImageActivate { id, file },
            ImageCommands::Deactivate { id } => Request::ImageDeactivate { id },
        },
        Commands::Objectstore { command } => match command {
            StoreCommands::Register { kind, opts } => Request::StoreRegister {
                kind,
                opts: parse_opts(&opts)?,
            },
            StoreCommands::Deregister { id } => Request::StoreDeregister { id },
            StoreCommands::AddVolume { store, volume } => {
                Request::StoreAddVolume { store, volume }
            }
            StoreCommands::RemoveVolume { store, volume } => {
                Request::StoreRemoveVolume { store, volume }
            }
            StoreCommands::ListVolume {
                store,
                volume,
                snapshot,
            } => Request::StoreListVolume {
                store,
                volume,
                snapshot,
            },
        },
        Commands::Backup { command } => match command {
            BackupCommands::Create {
                snapshot,
                volume,
                store,
            } => Request::BackupCreate {
                snapshot,
                volume,
                store,
            },
            BackupCommands::Restore {
                snapshot,
                volume,
                target,
                store,
            } => Request::BackupRestore {
                snapshot,
                volume,
                target,
                store,
            },
            BackupCommands::Remove {
                snapshot,
                volume,
                store,
            } => Request::BackupRemove {
                snapshot,
                volume,
                store,
            },
        },
        Commands::Info => Request::Info,
    };

    let response = send_request(&cli.socket, request).await?;

    match response {
        Response::Ok => {
            println!("OK");
        }
        Response::Error(msg) => {
            eprintln!("Error: {}", msg);
            std::process::exit(1);
        }
        Response::Created(id) => {
            println!("{}", id);
        }
        Response::Info(info) => {
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Response::Volumes(volumes) => {
            if volumes.is_empty() {
                println!("No volumes");
            } else {
                println!("{:<38} {:>6} {:>12} SNAPSHOTS", "UUID", "DEVID", "SIZE");
                for volume in volumes {
                    println!(
                        "{:<38} {:>6} {:>12} {}",
                        volume.id,
                        volume.dev_id,
                        format_size(volume.size),
                        volume.snapshots.len()
                    );
                    for snapshot in volume.snapshots {
                        println!(
                            "  {:<36} {:>6} {}",
                            snapshot.id,
                            snapshot.dev_id,
                            if snapshot.activated { "open" } else { "" }
                        );
                    }
                }
            }
        }
        Response::Registered { store, block_size } => {
            println!("Store:     {}", store);
            println!("BlockSize: {}", format_size(block_size));
        }
        Response::RemoteVolume(None) => {
            println!("No such volume in object store");
        }
        Response::RemoteVolume(Some(volume)) => {
            println!("Volume:       {}", volume.id);
            println!("Size:         {}", format_size(volume.size));
            if let Some(base) = volume.base {
                println!("Base:         {}", base);
            }
            if let Some(last) = volume.last_snapshot_id {
                println!("LastSnapshot: {}", last);
            }
            if volume.snapshots.is_empty() {
                println!("No backed-up snapshots");
            } else {
                println!("SNAPSHOTS");
                for snapshot in volume.snapshots {
                    println!("  {}", snapshot);
                }
            }
        }
    }

    Ok(())
}
