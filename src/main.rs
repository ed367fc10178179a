use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use aerial_geoloc_rs::config::GeolocConfig;
use aerial_geoloc_rs::export::{Exporter, JsonExporter};
use aerial_geoloc_rs::pipeline::{Detector, FrameQueue, GeoPipeline, VideoFrame};
use aerial_geoloc_rs::sources::{HttpPollConfig, HttpPollSource, PushFeedSource, SrtLogSource};
use aerial_geoloc_rs::sync::PoseSynchronizer;
use aerial_geoloc_rs::{Detection, GeolocResult};

#[derive(Parser, Debug)]
#[command(name = "aerial_geoloc")]
#[command(about = "Geolocate and deduplicate drone video detections", long_about = None)]
struct Args {
    /// JSON config file (omitted fields keep their defaults)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Flight log subtitle track (.srt or .srt.gz), highest priority pose source
    #[arg(long)]
    pose_log: Option<PathBuf>,

    /// Recorded state messages, one JSON object per line, used as fallback
    #[arg(long)]
    pose_feed: Option<PathBuf>,

    /// Live state endpoint polled during the run, lowest priority
    #[arg(long)]
    poll_url: Option<String>,

    /// Epoch ms of video frame 0. Polled samples carry epoch stamps; without
    /// this, detection timestamps must be epoch ms too.
    #[arg(long)]
    poll_epoch_ms: Option<i64>,

    /// Device serial for the polled endpoint
    #[arg(long, default_value = "")]
    dev_sn: String,

    /// Per-frame detections, one JSON object per line
    #[arg(long)]
    detections: PathBuf,

    /// Output file (.json or .json.gz)
    #[arg(long, default_value = "geoloc_sessions/detections.json")]
    output: PathBuf,

    /// Override the dedup distance threshold (meters)
    #[arg(long)]
    distance_threshold: Option<f64>,

    /// Override the minimum quality score kept by dedup
    #[arg(long)]
    min_quality_score: Option<f64>,

    /// Deduplicate in tumbling windows while running
    #[arg(long, default_value_t = false)]
    streaming: bool,

    /// Leave pre-dedup records out of the output file
    #[arg(long, default_value_t = false)]
    no_raw: bool,
}

#[derive(Deserialize)]
struct FrameDetections {
    frame_number: u64,
    timestamp_ms: i64,
    #[serde(default)]
    detections: Vec<Detection>,
}

/// Replays detections recorded alongside the video.
struct RecordedDetector;

impl Detector<Vec<Detection>> for RecordedDetector {
    fn detect(&mut self, frame: &VideoFrame<Vec<Detection>>) -> GeolocResult<Vec<Detection>> {
        Ok(frame.image.clone())
    }
}

fn load_config(args: &Args) -> Result<GeolocConfig> {
    let mut config = match &args.config {
        Some(path) => GeolocConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => GeolocConfig::default(),
    };
    if let Some(threshold) = args.distance_threshold {
        config.dedup.distance_threshold_m = threshold;
    }
    if let Some(min_score) = args.min_quality_score {
        config.dedup.min_quality_score = min_score;
    }
    if args.streaming {
        config.pipeline.streaming_dedup = true;
    }
    config.validate()?;
    Ok(config)
}

fn load_frames(path: &PathBuf) -> Result<Vec<FrameDetections>> {
    let reader = BufReader::new(File::open(path).with_context(|| format!("opening {}", path.display()))?);
    let mut frames = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<FrameDetections>(&line) {
            Ok(frame) => frames.push(frame),
            Err(e) => log::warn!("{}:{}: skipping frame: {}", path.display(), line_no + 1, e),
        }
    }
    Ok(frames)
}

fn load_pose_feed(path: &PathBuf, capacity: usize) -> Result<PushFeedSource> {
    let feed = PushFeedSource::new("recorded-feed", capacity);
    let reader = BufReader::new(File::open(path).with_context(|| format!("opening {}", path.display()))?);
    for line in reader.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            // Rejected messages are counted and logged by the feed
            let _ = feed.on_message(&line);
        }
    }
    log::info!(
        "Loaded {} state messages ({} rejected) from {}",
        feed.message_count(),
        feed.rejected_count(),
        path.display()
    );
    Ok(feed)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = load_config(&args)?;

    println!("[{}] Aerial geolocation starting", ts_now());
    println!("  Detections: {}", args.detections.display());
    println!("  Output: {}", args.output.display());
    println!(
        "  Dedup: {} m threshold, min score {}{}",
        config.dedup.distance_threshold_m,
        config.dedup.min_quality_score,
        if config.pipeline.streaming_dedup { ", streaming" } else { "" }
    );

    let mut sync = PoseSynchronizer::new(config.sync.clone());
    let mut priority = 0;
    if let Some(path) = &args.pose_log {
        let log_source = SrtLogSource::from_file(path)?;
        println!("  Pose log: {} ({} samples)", path.display(), log_source.len());
        sync.add_source(Arc::new(log_source), priority);
        priority += 1;
    }
    if let Some(path) = &args.pose_feed {
        let feed = load_pose_feed(path, config.sync.buffer_capacity.max(100_000))?;
        sync.add_source(Arc::new(feed), priority);
        priority += 1;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let poller = match &args.poll_url {
        Some(url) => {
            if args.poll_epoch_ms.is_none() {
                log::warn!("--poll-url without --poll-epoch-ms: polled samples only match epoch-stamped detections");
            }
            let poll = Arc::new(HttpPollSource::new(
                "http-poll",
                HttpPollConfig {
                    base_url: url.clone(),
                    dev_sn: args.dev_sn.clone(),
                    buffer_capacity: config.sync.buffer_capacity,
                    time_offset_ms: args.poll_epoch_ms.unwrap_or(0),
                    ..HttpPollConfig::default()
                },
            )?);
            sync.add_source(poll.clone(), priority);
            Some(poll.spawn(Arc::clone(&stop)))
        }
        None => None,
    };
    if priority == 0 && poller.is_none() {
        anyhow::bail!("no pose source given (use --pose-log, --pose-feed or --poll-url)");
    }

    let frames = load_frames(&args.detections)?;
    println!("[{}] Replaying {} frames", ts_now(), frames.len());

    let queue = Arc::new(FrameQueue::new(config.pipeline.frame_queue_capacity));
    let mut pipeline = GeoPipeline::new(config, sync)?;

    let worker = {
        let queue = Arc::clone(&queue);
        let stop = Arc::clone(&stop);
        tokio::task::spawn_blocking(move || {
            pipeline.run_until_stopped(&queue, &mut RecordedDetector, &stop);
            pipeline
        })
    };

    // Recorded input: wait for room instead of letting the queue drop frames
    for frame in frames {
        while queue.len() >= queue.capacity() {
            sleep(Duration::from_millis(1)).await;
        }
        queue.push(VideoFrame {
            frame_number: frame.frame_number,
            timestamp_ms: frame.timestamp_ms,
            image: frame.detections,
        });
    }
    stop.store(true, Ordering::Release);

    let pipeline = worker.await.context("frame worker panicked")?;
    if let Some(handle) = poller {
        let _ = handle.await;
    }

    let output = pipeline.finish();
    let mut exporter = JsonExporter::new(&args.output);
    if args.no_raw {
        exporter = exporter.without_raw();
    }
    exporter.export(&output)?;

    let p = &output.pipeline_stats;
    let s = &output.sync_stats;
    let d = &output.dedup_stats;
    println!("\n=== Final Stats ===");
    println!("Frames: {} processed, {} without pose, {} skipped for GPS quality", p.frames_processed, p.frames_without_pose, p.frames_skipped_quality);
    println!("Detections: {} in, {} geolocated, {} geometry failures", p.detections_in, p.geolocated, p.geometry_failures);
    println!("Pose sync: {}/{} matched, avg offset {:.1} ms, {} failovers, {} recoveries", s.matched, s.lookups, s.avg_time_diff_ms, s.failovers, s.recoveries);
    println!("Dedup: {} -> {} records ({:.1}% removed)", d.input, d.output, d.removal_rate * 100.0);
    println!("[{}] Saved to {}", ts_now(), args.output.display());

    Ok(())
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}
