//! RFV viewer — entry point.
//!
//! ```text
//! rfv-viewer                      Connect with config/defaults
//! rfv-viewer --server host:port   Override the server endpoint
//! rfv-viewer --gen-config         Dump default config and exit
//! rfv-viewer --clear-cache        Empty the frame cache and exit
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rfv_core::{FrameCache, RfbSession, SessionConfig};

use rfv_viewer::config::ViewerConfig;
use rfv_viewer::sink::{LogDispatcher, WatchSink};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "rfv-viewer", about = "RFV remote framebuffer viewer")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "rfv-viewer.toml")]
    config: PathBuf,

    /// Server endpoint (overrides config). Example: 192.168.1.50:5900
    #[arg(short, long)]
    server: Option<String>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Empty the frame cache and exit.
    #[arg(long)]
    clear_cache: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&ViewerConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = ViewerConfig::load(&cli.config);
    if let Some(addr) = cli.server {
        match addr.rsplit_once(':') {
            Some((host, port)) => {
                config.server.host = host.to_string();
                config.server.port = port.parse()?;
            }
            None => config.server.host = addr,
        }
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("rfv-viewer v{}", env!("CARGO_PKG_VERSION"));

    // ── 1. Open the frame cache (fatal on failure) ──────────────

    let cache_dir = config.cache_dir();
    std::fs::create_dir_all(&cache_dir)?;
    let mut cache = match FrameCache::open(&cache_dir) {
        Ok(cache) => cache,
        Err(e) => {
            error!("cannot open frame cache at {}: {e}", cache_dir.display());
            return Err(e.into());
        }
    };

    if cli.clear_cache {
        cache.clear()?;
        let info = cache.info()?;
        info!(
            "cache cleared: {} items, {} bytes",
            info.items, info.data_size
        );
        return Ok(());
    }

    // ── 2. Build the session ────────────────────────────────────

    let (sink, mut frame_rx) = WatchSink::new();
    let session_config = SessionConfig {
        disable_caching: config.session.disable_caching,
        share_desktop: config.session.share_desktop,
        connect_timeout: config.connect_timeout(),
        app_name: config.session.app_name.clone(),
        ..SessionConfig::default()
    };
    let (mut session, handle) = RfbSession::new(sink, LogDispatcher, cache, session_config);

    // Ctrl-C terminates the session from outside the protocol loop.
    let ctrlc_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt: terminating session");
            ctrlc_handle.terminate();
        }
    });

    // Headless "renderer": report frame activity.
    tokio::spawn(async move {
        while frame_rx.changed().await.is_ok() {
            let snap = frame_rx.borrow_and_update();
            if let Some(dirty) = snap.dirty {
                tracing::debug!(
                    "frame {}x{}, dirty {}x{} at ({}, {})",
                    snap.width, snap.height, dirty.width, dirty.height, dirty.x, dirty.y
                );
            }
        }
    });

    // ── 3. Run until termination ────────────────────────────────

    match session
        .run(&config.server.host, config.server.port)
        .await
    {
        Ok(()) => info!("session closed"),
        Err(e) => warn!("session ended: {e}"),
    }

    Ok(())
}
