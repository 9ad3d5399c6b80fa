//! thinvold - thin volume manager daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use thinvol::control::{Request, Response};
use thinvol::{Config, Daemon};

#[derive(Parser)]
#[command(
    name = "thinvold",
    about = "Thin-provisioned volume manager with object-store backup"
)]
struct Cli {
    /// Path to config file. If omitted, uses defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Daemon root directory. Overrides config file if specified.
    #[arg(long)]
    root: Option<PathBuf>,

    /// Control socket path. Overrides config file if specified.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Log verbosely.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = match cli.config {
        Some(ref path) => Config::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => Config::default(),
    };

    // CLI overrides
    if let Some(root) = cli.root {
        config.root = root;
    }
    if let Some(socket) = cli.socket {
        config.socket = socket;
    }

    let level = if cli.debug { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Setup control socket
    if let Some(parent) = config.socket.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if config.socket.exists() {
        std::fs::remove_file(&config.socket)?;
    }
    let socket_path = config.socket.clone();

    let daemon = Arc::new(
        Daemon::from_config(config)
            .await
            .context("Failed to start daemon")?,
    );

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("Failed to bind: {}", socket_path.display()))?;

    info!(
        socket = %socket_path.display(),
        root = %daemon.root().display(),
        driver = %daemon.config().driver.kind,
        "thinvold started"
    );

    // Control socket handler
    let control_handle = tokio::spawn({
        let daemon = Arc::clone(&daemon);
        async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let daemon = Arc::clone(&daemon);
                        tokio::spawn(async move {
                            if let Err(e) = handle_control(stream, daemon).await {
                                error!(error = %e, "Control connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        break;
                    }
                }
            }
        }
    });

    // Wait for shutdown signal
    let shutdown = async {
        let ctrl_c = signal::ctrl_c();
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    };
    shutdown.await;

    control_handle.abort();
    if let Err(e) = daemon.shutdown().await {
        error!(error = %e, "Shutdown error");
    }
    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }

    Ok(())
}

async fn handle_control(stream: tokio::net::UnixStream, daemon: Arc<Daemon>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                let resp = serde_json::to_string(&Response::Error(e.to_string()))? + "\n";
                writer.write_all(resp.as_bytes()).await?;
                continue;
            }
        };

        let response = process_request(&daemon, request).await;
        let resp = serde_json::to_string(&response)? + "\n";
        writer.write_all(resp.as_bytes()).await?;
    }
}

async fn process_request(daemon: &Daemon, request: Request) -> Response {
    match request {
        Request::Info => match daemon.info().await {
            Ok(info) => Response::Info(info),
            Err(e) => Response::Error(e.to_string()),
        },
        Request::VolumeCreate { id, size, base } => {
            match daemon.volume_create(id, base, size).await {
                Ok(id) => {
                    info!(volume = %id, size, "volume created");
                    Response::Created(id)
                }
                Err(e) => Response::Error(e.to_string()),
            }
        }
        Request::VolumeDelete { id } => match daemon.volume_delete(id).await {
            Ok(()) => {
                info!(volume = %id, "volume deleted");
                Response::Ok
            }
            Err(e) => Response::Error(e.to_string()),
        },
        Request::VolumeList { id } => match daemon.volume_list(id).await {
            Ok(volumes) => Response::Volumes(volumes),
            Err(e) => Response::Error(e.to_string()),
        },
        Request::SnapshotCreate { id, volume } => {
            match daemon.snapshot_create(id, volume).await {
                Ok(id) => {
                    info!(snapshot = %id, volume = %volume, "snapshot created");
                    Response::Created(id)
                }
                Err(e) => Response::Error(e.to_string()),
            }
        }
        Request::SnapshotDelete { id, volume } => {
            match daemon.snapshot_delete(id, volume).await {
                Ok(()) => {
                    info!(snapshot = %id, volume = %volume, "snapshot deleted");
                    Response::Ok
                }
                Err(e) => Response::Error(e.to_string()),
            }
        }
        Request::ImageActivate { id, file } => match daemon.image_activate(id, &file).await {
            Ok(id) => {
                info!(image = %id, "image activated");
                Response::Created(id)
            }
            Err(e) => Response::Error(e.to_string()),
        },
        Request::ImageDeactivate { id } => match daemon.image_deactivate(id).await {
            Ok(()) => {
                info!(image = %id, "image deactivated");
                Response::Ok
            }
            Err(e) => Response::Error(e.to_string()),
        },
        Request::StoreRegister { kind, opts } => {
            match daemon.store_register(&kind, &opts).await {
                Ok((store, block_size)) => Response::Registered { store, block_size },
                Err(e) => Response::Error(e.to_string()),
            }
        }
        Request::StoreDeregister { id } => match daemon.store_deregister(id).await {
            Ok(()) => Response::Ok,
            Err(e) => Response::Error(e.to_string()),
        },
        Request::StoreAddVolume { store, volume } => {
            match daemon.store_add_volume(store, volume).await {
                Ok(()) => Response::Ok,
                Err(e) => Response::Error(e.to_string()),
            }
        }
        Request::StoreRemoveVolume { store, volume } => {
            match daemon.store_remove_volume(store, volume).await {
                Ok(()) => Response::Ok,
                Err(e) => Response::Error(e.to_string()),
            }
        }
        Request::StoreListVolume {
            store,
            volume,
            snapshot,
        } => match daemon.store_list_volume(store, volume, snapshot).await {
            Ok(remote) => Response::RemoteVolume(remote),
            Err(e) => Response::Error(e.to_string()),
        },
        Request::BackupCreate {
            snapshot,
            volume,
            store,
        } => match daemon.backup_create(snapshot, volume, store).await {
            Ok(()) => {
                info!(snapshot = %snapshot, volume = %volume, store = %store, "backup created");
                Response::Ok
            }
            Err(e) => Response::Error(e.to_string()),
        },
        Request::BackupRestore {
            snapshot,
            volume,
            target,
            store,
        } => match daemon.backup_restore(snapshot, volume, target, store).await {
            Ok(()) => {
                info!(snapshot = %snapshot, target = %target, "backup restored");
                Response::Ok
            }
            Err(e) => Response::Error(e.to_string()),
        },
        Request::BackupRemove {
            snapshot,
            volume,
            store,
        } => match daemon.backup_remove(snapshot, volume, store).await {
            Ok(()) => {
                info!(snapshot = %snapshot, volume = %volume, "backup removed");
                Response::Ok
            }
            Err(e) => Response::Error(e.to_string()),
        },
    }
}
