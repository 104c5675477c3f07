//! Stamp publisher entry point.
//!
//! ```text
//! stamp-publisher                     Publish until Ctrl-C
//! stamp-publisher --config <path>     Load a custom config TOML
//! stamp-publisher --gen-config        Write default config to stdout
//! stamp-publisher --decode <image>    Print the identifier stamped in an image
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use stamp_core::snapshot::decode_image;
use stamp_core::{FrameIdentifier, StripSpec, Threshold, decode};
use stamp_publisher::config::PublisherConfig;
use stamp_publisher::service::PublisherService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "stamp-publisher", about = "Live stream publisher with identifier strips")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "stamp-publisher.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Decode the identifier strip of an image file and exit.
    #[arg(long, value_name = "IMAGE")]
    decode: Option<PathBuf>,

    /// Fixed luma threshold (0.0–1.0) for `--decode`; dynamic if omitted.
    #[arg(long, requires = "decode")]
    threshold: Option<f32>,

    /// Stop after this many seconds (overrides `stream.duration_secs`).
    #[arg(long)]
    duration: Option<u64>,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = PublisherConfig::default().to_toml()?;
        println!("{text}");
        return Ok(ExitCode::SUCCESS);
    }

    // Load config.
    let mut config = PublisherConfig::load(&cli.config);
    if let Some(secs) = cli.duration {
        config.stream.duration_secs = secs;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // --decode: one-shot identifier lookup.
    if let Some(path) = &cli.decode {
        let threshold = cli.threshold.map(Threshold::Fixed).unwrap_or_default();
        return decode_file(path, &config.strip, threshold);
    }

    info!("stamp-publisher v{}", env!("CARGO_PKG_VERSION"));
    info!("stream: {} ({}x{} @ {} fps)", config.stream.stream_id, config.stream.width, config.stream.height, config.stream.fps);
    info!("snapshots: {}", config.snapshots.directory.display());

    let service = PublisherService::new(config)?;
    let stop = service.stop_handle();

    // Ctrl-C handler.
    let stop_clone = stop.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop_clone.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    match service.run().await {
        Ok(summary) => {
            info!(
                "published {} frames, {} identifiers",
                summary.frames_rendered, summary.identifiers_minted
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) if e.is_terminal() => {
            error!("publishing stopped: {e}");
            Ok(ExitCode::from(2))
        }
        Err(e) => Err(e.into()),
    }
}

fn decode_file(
    path: &Path,
    spec: &StripSpec,
    threshold: Threshold,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let bytes = std::fs::read(path)?;
    let frame = decode_image(&bytes)?;
    match decode(&frame, spec, threshold).map(FrameIdentifier::new) {
        Some(id) => {
            match id.split() {
                Some((sequence, mode)) => println!("{id}\tsequence={sequence}\tmode={mode:?}"),
                None => println!("{id}"),
            }
            Ok(ExitCode::SUCCESS)
        }
        None => {
            eprintln!("no identifier found in {}", path.display());
            Ok(ExitCode::FAILURE)
        }
    }
}
