//! stream_probe - subscribe to a camera's live socket and report what arrives.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use facewatch::{FacewatchConfig, SocketClient};

#[derive(Parser, Debug)]
#[command(name = "stream_probe", about = "Report frame rate and sizes of a live camera socket")]
struct Args {
    /// Camera id; the socket is looked up in the configured socket directory
    camera: Option<String>,

    /// Connect to this socket path instead
    #[arg(long, conflicts_with = "camera")]
    socket: Option<PathBuf>,

    /// Stop after this many frames
    #[arg(long)]
    frames: Option<u64>,

    /// Seconds between reports
    #[arg(long, default_value_t = 1)]
    interval: u64,

    /// Write the last received JPEG here on exit
    #[arg(long)]
    save: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut client = match (&args.socket, &args.camera) {
        (Some(path), _) => SocketClient::connect(path)?,
        (None, Some(camera)) => {
            let config = FacewatchConfig::load()?;
            SocketClient::for_camera(&config.socket_dir, camera)?
        }
        (None, None) => anyhow::bail!("either a camera id or --socket is required"),
    };

    let interval = Duration::from_secs(args.interval.max(1));
    let mut total = 0u64;
    let mut window_frames = 0u64;
    let mut window_bytes = 0usize;
    let mut window_start = Instant::now();
    let mut last = None;

    for frame in client.by_ref() {
        let frame = frame?;
        total += 1;
        window_frames += 1;
        window_bytes += frame.len();
        last = Some(frame);

        let elapsed = window_start.elapsed();
        if elapsed >= interval {
            let secs = elapsed.as_secs_f64();
            log::info!(
                "{:.1} frames/s, avg {} bytes/frame, {} frames total",
                window_frames as f64 / secs,
                window_bytes / window_frames.max(1) as usize,
                total
            );
            window_frames = 0;
            window_bytes = 0;
            window_start = Instant::now();
        }

        if args.frames.is_some_and(|limit| total >= limit) {
            break;
        }
    }
    client.close();
    log::info!("received {} frame(s)", total);

    if let (Some(path), Some(jpeg)) = (&args.save, last) {
        std::fs::write(path, &jpeg).with_context(|| format!("write {}", path.display()))?;
        log::info!("last frame saved to {}", path.display());
    }
    Ok(())
}
