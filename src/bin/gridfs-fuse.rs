use std::path::PathBuf;

use clap::Parser;
use tracing::{debug, info, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gridfs_fuse::backend::mongo::MongoBackend;
use gridfs_fuse::bootstrap::ensure_schema;
use gridfs_fuse::fs::fuse::FuseDaemon;
use gridfs_fuse::fs::GridFsFuse;

/// Mirrors `original_source/gridfs_fuse/main.py`'s optparse surface, with
/// env fallbacks in the style of `tvix-store`'s `Cli`.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Connection string for the MongoDB client.
    #[arg(long, env = "GRIDFS_FUSE_MONGODB_URI", default_value = "mongodb://127.0.0.1:27017")]
    mongodb_uri: String,

    /// Name of the database where the filesystem lives.
    #[arg(long, env = "GRIDFS_FUSE_DATABASE", default_value = "gridfs_fuse")]
    database: String,

    /// Path where to mount the gridfs-fuse filesystem.
    #[arg(long)]
    mount_point: PathBuf,

    /// Log level. It's also possible to set `RUST_LOG` according to
    /// `tracing_subscriber::filter::EnvFilter`, which always takes priority.
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Whether to configure the mountpoint with allow_other. Requires
    /// /etc/fuse.conf to contain the user_allow_other option.
    #[arg(long, env, default_value_t = false)]
    allow_other: bool,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        // tracing has no 5-level distinction beyond ERROR, so WARNING and
        // CRITICAL both fold onto the nearest tracing level.
        match level {
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warning => Level::WARN,
            LogLevel::Error | LogLevel::Critical => Level::ERROR,
        }
    }
}

fn init_tracing(level: Level) {
    let debug_env = std::env::var("GRIDFS_FUSE_DEBUG")
        .map(|v| v != "0" && !v.is_empty())
        .unwrap_or(false);
    let default_directive = if debug_env { Level::DEBUG } else { level };

    let subscriber = tracing_subscriber::registry().with(
        tracing_subscriber::fmt::Layer::new().compact().with_filter(
            EnvFilter::builder()
                .with_default_directive(default_directive.into())
                .from_env()
                .expect("invalid RUST_LOG"),
        ),
    );
    subscriber.try_init().expect("failed to install tracing subscriber");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.into());
    debug!(mongodb_uri = %cli.mongodb_uri, database = %cli.database, mount_point = ?cli.mount_point, "starting gridfs-fuse");

    let backend = MongoBackend::connect(&cli.mongodb_uri, &cli.database).await?;

    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    ensure_schema(&backend.metadata, uid, gid).await?;

    let tokio_handle = tokio::runtime::Handle::current();
    let fs = GridFsFuse::new(backend.metadata, backend.chunks, tokio_handle);

    let mount_point = cli.mount_point.clone();
    let allow_other = cli.allow_other;
    let mut fuse_daemon = tokio::task::spawn_blocking(move || {
        info!(mount_path = ?mount_point, "mounting");
        FuseDaemon::new(fs, &mount_point, 1, allow_other)
    })
    .await??;

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, unmounting…");
    tokio::task::spawn_blocking(move || fuse_daemon.unmount()).await??;
    info!("unmount occurred, terminating…");

    Ok(())
}
