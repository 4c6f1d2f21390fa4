//! portoshim binary: CRI over a Unix socket, backed by the porto daemon.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::Parser;
use tracing::warn;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use portoshim_cri::config::ShimConfig;
use portoshim_cri::server::ShimServer;

/// Kubernetes CRI shim for the porto container daemon.
#[derive(Parser, Debug)]
#[command(name = "portoshim", about = "Porto CRI shim")]
struct Args {
    /// Path to the CRI Unix domain socket.
    #[arg(long, default_value = "/run/portoshim.sock")]
    socket: PathBuf,

    /// Path to the porto daemon socket.
    #[arg(long, default_value = "/run/portod.socket")]
    porto_socket: PathBuf,

    /// Directory holding one overlay root per sandbox and container.
    #[arg(long, default_value = "/place/portoshim_volumes")]
    volumes_dir: PathBuf,

    /// Docker-format image store (filesystem usage reports).
    #[arg(long, default_value = "/place/porto_docker")]
    images_dir: PathBuf,

    /// Address of the exec streaming endpoint.
    #[arg(long, default_value = "127.0.0.1:10350")]
    streaming_addr: std::net::SocketAddr,

    /// Log file; reopened on SIGHUP. Logs go to stdout when unset.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Show debug logs.
    #[arg(long)]
    debug: bool,
}

/// Log sink that reopens its file on demand, so an external rotation can
/// move the old file aside and send SIGHUP.
#[derive(Clone)]
struct ReopenableLog {
    path: PathBuf,
    file: Arc<Mutex<std::fs::File>>,
}

impl ReopenableLog {
    fn open(path: PathBuf) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(ReopenableLog {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    fn reopen(&self) -> std::io::Result<()> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        *self.file.lock().expect("log sink poisoned") = file;
        Ok(())
    }
}

impl std::io::Write for ReopenableLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.lock().expect("log sink poisoned").write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.lock().expect("log sink poisoned").flush()
    }
}

impl<'a> MakeWriter<'a> for ReopenableLog {
    type Writer = ReopenableLog;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn init_logging(log_file: Option<PathBuf>, debug: bool) -> anyhow::Result<()> {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match log_file {
        Some(path) => {
            let sink = ReopenableLog::open(path)?;
            let rotate = sink.clone();
            tokio::spawn(async move {
                let mut sighup = tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::hangup(),
                )
                .expect("install SIGHUP handler");
                while sighup.recv().await.is_some() {
                    if let Err(err) = rotate.reopen() {
                        warn!(error = %err, "failed to reopen log file");
                    }
                }
            });
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(sink)
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.log_file.clone(), args.debug)?;

    let config = ShimConfig {
        socket_path: args.socket,
        porto_socket: args.porto_socket,
        volumes_dir: args.volumes_dir,
        images_dir: args.images_dir,
        streaming_addr: args.streaming_addr,
        ..Default::default()
    };

    tracing::info!(
        socket = %config.socket_path.display(),
        porto = %config.porto_socket.display(),
        "starting portoshim"
    );

    ShimServer::new(config).serve().await
}
