//! axon CLI entrypoint.
//!
//! ```bash
//! axon probe --json
//! axon transcode --input in.h264 --output out.hevc
//! axon transcode --input in.h264 --output out.hevc --out-width 1280 --out-height 720 --json
//! axon transcode --input in.h264 --output out.hevc --config pipeline.json
//! ```
//!
//! The demo drives the transcode pipeline against the in-process software
//! card, so it runs on any host with no accelerator installed.

use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use axon_core::driver::{Codec, DeviceContext};
use axon_core::frame::StreamChunkDesc;
use axon_pipeline::{
    Resolution, StreamFormat, StreamObserver, TranscodeConfig, TranscodePipeline,
};
use axon_sim::SimCard;

const SEND_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(
    name = "axon",
    version,
    about = "Accelerator-card media pipeline demo",
    arg_required_else_help = true,
    after_help = "Examples:\n  axon probe --json\n  axon transcode --input in.h264 --output out.hevc --out-width 1280 --out-height 720\n  axon transcode --input in.h264 --output out.hevc --config pipeline.json --json"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Report the device this build drives.
    Probe {
        /// Emit a machine-readable report.
        #[arg(long)]
        json: bool,
    },
    /// Run a file through decode → (scale) → encode.
    Transcode(TranscodeArgs),
}

#[derive(Args, Debug)]
struct TranscodeArgs {
    /// Compressed input bitstream.
    #[arg(long)]
    input: PathBuf,
    /// Destination for the encoded stream.
    #[arg(long)]
    output: PathBuf,
    /// JSON pipeline config; overrides the geometry/codec flags.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Decode width.
    #[arg(long, default_value_t = 1920)]
    width: u32,
    /// Decode height.
    #[arg(long, default_value_t = 1080)]
    height: u32,
    /// Encode width.
    #[arg(long, default_value_t = 1280)]
    out_width: u32,
    /// Encode height.
    #[arg(long, default_value_t = 720)]
    out_height: u32,
    /// Input codec (h264 | hevc).
    #[arg(long, default_value = "h264")]
    codec: String,
    /// Output codec (h264 | hevc).
    #[arg(long, default_value = "hevc")]
    out_codec: String,
    /// Frame rate used to synthesize presentation timestamps.
    #[arg(long, default_value_t = 30)]
    fps: u32,
    /// Bytes per synthetic input packet.
    #[arg(long, default_value_t = 4096)]
    chunk_size: usize,
    /// How long to wait for in-flight frames to drain, in milliseconds.
    #[arg(long, default_value_t = 2000)]
    drain_timeout_ms: u64,
    /// Emit a machine-readable report.
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct ProbeReport {
    schema_version: u32,
    driver: &'static str,
    device: u32,
}

#[derive(Serialize)]
struct TranscodeReport {
    schema_version: u32,
    packets_in: u64,
    chunks_out: u64,
    bytes_out: u64,
    pts_regressions: u64,
    elapsed_ms: u64,
    output: PathBuf,
}

fn parse_codec(s: &str) -> anyhow::Result<Codec> {
    match s.to_ascii_lowercase().as_str() {
        "h264" | "264" | "avc" => Ok(Codec::H264),
        "hevc" | "h265" | "265" => Ok(Codec::Hevc),
        other => bail!("unknown codec '{other}'; use h264 or hevc"),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Commands::Probe { json } => probe(json),
        Commands::Transcode(args) => transcode(args),
    }
}

fn probe(json: bool) -> anyhow::Result<()> {
    let report = ProbeReport {
        schema_version: 1,
        driver: "sim",
        device: 0,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("device {}: software card ({})", report.device, report.driver);
    }
    Ok(())
}

struct FileWriter {
    file: Mutex<File>,
}

impl StreamObserver for FileWriter {
    fn on_stream(&self, chunk: &StreamChunkDesc) {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = file.write_all(&chunk.data) {
            warn!(%err, "output write failed");
        }
    }
}

fn transcode(args: TranscodeArgs) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            TranscodeConfig::from_json_str(&raw)?
        }
        None => TranscodeConfig::new(
            StreamFormat {
                codec: parse_codec(&args.codec)?,
                resolution: Resolution::new(args.width, args.height),
            },
            StreamFormat {
                codec: parse_codec(&args.out_codec)?,
                resolution: Resolution::new(args.out_width, args.out_height),
            },
        ),
    };
    if args.fps == 0 {
        bail!("fps must be > 0");
    }
    if args.chunk_size == 0 {
        bail!("chunk size must be > 0");
    }

    let input = fs::read(&args.input)
        .with_context(|| format!("reading input {}", args.input.display()))?;
    if input.is_empty() {
        bail!("input {} is empty", args.input.display());
    }

    let output = File::create(&args.output)
        .with_context(|| format!("creating output {}", args.output.display()))?;
    let observer: Arc<dyn StreamObserver> = Arc::new(FileWriter {
        file: Mutex::new(output),
    });

    let card = SimCard::new();
    let ctx = DeviceContext::new(card, 0);
    let mut pipeline = TranscodePipeline::create(ctx, config, observer)?;
    let metrics = pipeline.metrics();

    let begun = Instant::now();
    pipeline.start()?;

    let pts_step = i64::from(1_000_000 / args.fps);
    let mut packets: u64 = 0;
    for (i, packet) in input.chunks(args.chunk_size).enumerate() {
        pipeline.send_stream(packet, i as i64 * pts_step, SEND_TIMEOUT)?;
        packets += 1;
    }
    // End-of-stream marker.
    pipeline.send_stream(&[], packets as i64 * pts_step, SEND_TIMEOUT)?;
    info!(packets, "input fully queued");

    let drain_deadline = Instant::now() + Duration::from_millis(args.drain_timeout_ms);
    while metrics.snapshot().chunks_out < packets && Instant::now() < drain_deadline {
        std::thread::sleep(Duration::from_millis(10));
    }

    pipeline.stop()?;
    let snapshot = metrics.snapshot();
    pipeline.destroy()?;

    let report = TranscodeReport {
        schema_version: 1,
        packets_in: snapshot.packets_in,
        chunks_out: snapshot.chunks_out,
        bytes_out: snapshot.bytes_out,
        pts_regressions: snapshot.pts_regressions,
        elapsed_ms: begun.elapsed().as_millis() as u64,
        output: args.output.clone(),
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "transcoded {} packets -> {} chunks ({} bytes) in {} ms -> {}",
            report.packets_in,
            report.chunks_out,
            report.bytes_out,
            report.elapsed_ms,
            report.output.display()
        );
    }
    if snapshot.chunks_out < snapshot.packets_in {
        warn!(
            missing = snapshot.packets_in - snapshot.chunks_out,
            "some frames did not drain before the timeout"
        );
    }
    Ok(())
}
