//! Driftsync node binary.
//!
//! # Usage
//!
//! ```bash
//! # Serve two shares
//! driftsync-server --bind 0.0.0.0:4460 --share ~/sync/photos --share ~/sync/docs
//!
//! # Dial a peer and replicate one share (id printed on attach)
//! driftsync-server --share ~/sync/docs --db-dir ~/.driftsync \
//!     --connect 192.0.2.7:4460 --connect-share <share-id>
//! ```

use std::{path::PathBuf, sync::Arc, time::{Duration, Instant}};

use clap::Parser;
use driftsync_core::NodeInfo;
use driftsync_server::{ConnectionStatus, Server, ServerConfig, ServerError};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::Mutex,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Driftsync file synchronization node
#[derive(Parser, Debug)]
#[command(name = "driftsync-server")]
#[command(about = "Peer-to-peer file synchronization node")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:4460")]
    bind: String,

    /// Directory to attach as a share (repeatable)
    #[arg(short, long)]
    share: Vec<PathBuf>,

    /// Directory for share databases; omit for in-memory manifests
    #[arg(long)]
    db_dir: Option<PathBuf>,

    /// Peer address to dial
    #[arg(long)]
    connect: Option<String>,

    /// Share id to replicate over the dialed connection
    #[arg(long, requires = "connect")]
    connect_share: Option<String>,

    /// Seconds between filesystem scans
    #[arg(long, default_value = "30")]
    scan_interval: u64,

    /// Node name advertised to peers
    #[arg(long, default_value = "driftsync")]
    name: String,

    /// Maximum concurrent connections
    #[arg(long, default_value = "1024")]
    max_connections: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let node = NodeInfo { name: args.name.clone(), ..NodeInfo::default() };
    let mut server = Server::new(node, ServerConfig {
        max_connections: args.max_connections,
        ..ServerConfig::default()
    });

    if let Some(db_dir) = &args.db_dir {
        std::fs::create_dir_all(db_dir)?;
    }
    for path in &args.share {
        let db_path = args.db_dir.as_ref().map(|dir| {
            let stem = path.file_name().map(|n| n.to_string_lossy().into_owned());
            dir.join(format!("{}.db", stem.unwrap_or_else(|| "share".to_string())))
        });
        let share_id = server.attach_share(path, db_path.as_ref())?;
        tracing::info!(%share_id, path = %path.display(), "serving share");
    }
    server.start_scans();

    let server = Arc::new(Mutex::new(server));

    // Scan timer: step in-progress scans often, kick fresh scans on the
    // configured interval.
    {
        let server = Arc::clone(&server);
        let interval = Duration::from_secs(args.scan_interval.max(1));
        tokio::spawn(async move {
            let mut step = tokio::time::interval(Duration::from_millis(100));
            let mut kick = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = step.tick() => server.lock().await.scan_step_shares(),
                    _ = kick.tick() => server.lock().await.start_scans(),
                }
            }
        });
    }

    if let (Some(addr), Some(share_id)) = (args.connect.clone(), args.connect_share.clone()) {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            match TcpStream::connect(&addr).await {
                Ok(socket) => {
                    tracing::info!(%addr, %share_id, "dialed peer");
                    drive_connection(server, socket, Some(share_id)).await;
                },
                Err(e) => tracing::error!(%addr, error = %e, "dial failed"),
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(&args.bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    loop {
        match listener.accept().await {
            Ok((socket, peer_addr)) => {
                tracing::debug!(%peer_addr, "inbound connection");
                let server = Arc::clone(&server);
                tokio::spawn(drive_connection(server, socket, None));
            },
            Err(e) => tracing::error!(error = %e, "accept failed"),
        }
    }
}

/// Run one connection: read loop, keep-alive ticks, and outbound flushing.
async fn drive_connection(
    server: Arc<Mutex<Server>>,
    mut socket: TcpStream,
    initiate_share: Option<String>,
) {
    let id = {
        let Some(id) = server.lock().await.add_connection(Instant::now()) else {
            return;
        };
        id
    };

    if let Some(share_id) = initiate_share {
        // Bind before matching so the lock guard is released first.
        let kicked = server.lock().await.connect_share(id, &share_id, Instant::now());
        match kicked {
            Ok(ConnectionStatus::Open) => {},
            Ok(ConnectionStatus::Closed) => return,
            Err(e) => {
                tracing::error!(connection = id, error = %e, "connect kick failed");
                server.lock().await.remove_connection(id);
                return;
            },
        }
    }

    let mut buf = vec![0u8; 65536];
    let mut tick = tokio::time::interval(Duration::from_secs(1));

    loop {
        if !flush_outbound(&server, id, &mut socket).await {
            break;
        }

        tokio::select! {
            read = socket.read(&mut buf) => match read {
                Ok(0) => {
                    tracing::debug!(connection = id, "peer closed");
                    break;
                },
                Ok(n) => {
                    let status =
                        server.lock().await.connection_input(id, &buf[..n], Instant::now());
                    if !matches!(status, Ok(ConnectionStatus::Open)) {
                        break;
                    }
                },
                Err(e) => {
                    tracing::debug!(connection = id, error = %e, "read failed");
                    break;
                },
            },
            _ = tick.tick() => {
                let status = server.lock().await.tick_connection(id, Instant::now());
                if !matches!(status, Ok(ConnectionStatus::Open)) {
                    break;
                }
            },
        }
    }

    // Deliver any farewell bytes (e.g. CannotStart) queued before the close.
    loop {
        let next = server.lock().await.take_outbound(id);
        match next {
            Some(bytes) => {
                if socket.write_all(&bytes).await.is_err() {
                    break;
                }
            },
            None => break,
        }
    }
    server.lock().await.remove_connection(id);
}

/// Write queued bytes until the connection is drained, letting the protocol
/// pump payload chunks as the queue empties. Returns false when the
/// connection is gone.
async fn flush_outbound(server: &Arc<Mutex<Server>>, id: u64, socket: &mut TcpStream) -> bool {
    loop {
        let next = server.lock().await.take_outbound(id);
        match next {
            Some(bytes) => {
                if let Err(e) = socket.write_all(&bytes).await {
                    tracing::debug!(connection = id, error = %e, "write failed");
                    return false;
                }
            },
            None => {
                let pumped = {
                    let mut server = server.lock().await;
                    match server.on_write_complete(id) {
                        Ok(ConnectionStatus::Open) => server.has_outbound(id),
                        Ok(ConnectionStatus::Closed) => return false,
                        Err(ServerError::UnknownConnection(_)) => return false,
                        Err(e) => {
                            tracing::warn!(connection = id, error = %e, "pump failed");
                            return false;
                        },
                    }
                };
                if !pumped {
                    return true;
                }
            },
        }
    }
}
