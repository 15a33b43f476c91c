// src/main.rs

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vehicle_speed::analysis::adaptive::{CalibrationEngine, JsonFileStore};
use vehicle_speed::pipeline::{replay, spawn_session, FrameReport, RunnerConfig, SpeedSession};
use vehicle_speed::types::Config;

const CONFIG_ENV: &str = "VEHICLE_SPEED_CONFIG";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "config.yaml".to_string());
    let config_found = Path::new(&config_path).exists();
    let config = if config_found {
        Config::load(&config_path)?
    } else {
        Config::default()
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🚗 Vehicle Speed Estimation Starting");
    if config_found {
        info!("✓ Configuration loaded from {}", config_path);
    } else {
        warn!("{} not found, running with defaults", config_path);
    }

    let store = JsonFileStore::new(&config.calibration.store_path);
    info!("✓ Calibration store: {}", store.path().display());
    let engine = Arc::new(CalibrationEngine::with_cycle_interval(
        Box::new(store),
        config.calibration.cycle_every_frames,
    ));
    let tunables = engine.snapshot();
    info!(
        "✓ Calibration ready: speed_scale={:.4} area_scale={:.3} alpha={:.3} floor={:.2} delay={:.0}ms",
        tunables.speed_scale_factor,
        tunables.area_scale_factor,
        tunables.ema_alpha,
        tunables.detection_confidence_floor,
        tunables.frame_delay_ms
    );

    let records = replay::load_recording(&config.session.replay_path)?;
    let (source, detector) = replay::split(records);

    let session = SpeedSession::new(engine.clone(), &config.session);
    let (report_tx, mut report_rx) = mpsc::channel::<FrameReport>(64);
    let handle = spawn_session(
        session,
        Box::new(source),
        Arc::new(detector),
        RunnerConfig::from(&config.session),
        Some(report_tx),
    );

    let stopper = handle.stopper();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, stopping session");
            stopper.stop();
        }
    });

    let printer = tokio::spawn(async move {
        while let Some(report) = report_rx.recv().await {
            if let Some(locked) = report.locked_report() {
                info!(
                    "🎯 Frame {}: {} {} {:.1} km/h ({}, conf {:.2})",
                    report.frame_id,
                    locked.tracking_id,
                    locked.class_name,
                    locked.estimate.target_speed_kmh,
                    locked.estimate.direction.as_str(),
                    locked.estimate.confidence
                );
            }
            for track in report.moving().filter(|t| !t.is_locked) {
                info!(
                    "   Frame {}: {} {} {:.1} km/h ({})",
                    report.frame_id,
                    track.tracking_id,
                    track.class_name,
                    track.estimate.target_speed_kmh,
                    track.estimate.direction.as_str()
                );
            }
        }
    });

    let summary = handle.join().await;
    // Loop is gone so the report sender is dropped and the printer drains out
    let _ = printer.await;

    match summary {
        Some(summary) => {
            info!("\n========================================");
            info!("✓ Session complete");
            info!("  Frames processed: {}", summary.total_frames);
            info!("  Tracks created: {}", summary.tracks_created);
            info!("  Speed estimates: {}", summary.speed_estimates);
            info!(
                "  Detection timeouts/failures: {}/{}",
                summary.detection_timeouts, summary.detection_failures
            );
            info!("  Calibration cycles: {}", summary.calibration_cycles);
            info!("  Processing Speed: {:.1} FPS", summary.fps);
            info!("{}", serde_json::to_string_pretty(&summary)?);
        }
        None => warn!("Session ended without a summary"),
    }

    let tunables = engine.snapshot();
    info!(
        "🔧 Calibration after {} sessions / {} frames: speed_scale={:.4} alpha={:.3} votes={}",
        tunables.total_sessions,
        tunables.total_frames,
        tunables.speed_scale_factor,
        tunables.ema_alpha,
        tunables.plate_vote_threshold
    );

    Ok(())
}
