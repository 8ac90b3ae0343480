use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use flate2::read::GzDecoder;
use nalgebra::Vector3;
use serde::Deserialize;

use state_estimator_rs::{
    EstimatorConfig, InertialSample, OdometrySample, PositionFix, StateEstimate, StateEstimator,
};

/// Replay a recorded sensor session through the estimator
#[derive(Parser, Debug)]
struct Args {
    /// Path to session_*.json[.gz] log
    #[arg(long)]
    log: PathBuf,

    /// Estimator configuration (JSON); defaults when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Where to write the estimate stream (JSON)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Where to write the final diagnostics snapshot (JSON)
    #[arg(long)]
    diagnostics: Option<PathBuf>,

    /// Override the absolute position sigma (meters)
    #[arg(long)]
    gps_sigma: Option<f64>,

    /// Fuse wheel odometry readings from the log
    #[arg(long, default_value_t = false)]
    use_odometry: bool,
}

#[derive(Deserialize)]
struct ImuData {
    accel: [f64; 3],
    gyro: [f64; 3],
}

#[derive(Deserialize)]
struct FixData {
    latitude: f64,
    longitude: f64,
    altitude: f64,
    accuracy: f64,
    #[serde(default = "default_valid")]
    valid: bool,
}

fn default_valid() -> bool {
    true
}

#[derive(Deserialize)]
struct OdometryData {
    linear: [f64; 3],
    angular: [f64; 3],
    #[serde(default)]
    linear_variance: Option<f64>,
    #[serde(default)]
    angular_variance: Option<f64>,
}

#[derive(Deserialize)]
struct Reading {
    timestamp: f64,
    imu: Option<ImuData>,
    fix: Option<FixData>,
    odometry: Option<OdometryData>,
}

#[derive(Deserialize)]
struct LogFile {
    readings: Vec<Reading>,
}

fn load_log(path: &Path) -> anyhow::Result<LogFile> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        let reader = BufReader::new(GzDecoder::new(file));
        Ok(serde_json::from_reader(reader)?)
    } else {
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EstimatorConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EstimatorConfig::default(),
    };
    if let Some(sigma) = args.gps_sigma {
        config.gps_sigma = sigma;
    }
    config.use_odometry |= args.use_odometry;

    let log = load_log(&args.log)?;
    println!("Replaying {} readings from {}", log.readings.len(), args.log.display());

    let estimator = StateEstimator::new(config)?;
    let outputs = estimator.subscribe();
    let mut estimates: Vec<StateEstimate> = Vec::new();

    for reading in &log.readings {
        let t = reading.timestamp;
        if let Some(imu) = &reading.imu {
            estimator.on_inertial_sample(InertialSample::new(
                t,
                Vector3::from(imu.accel),
                Vector3::from(imu.gyro),
            ))?;
        }
        if let Some(fix) = &reading.fix {
            let mut sample = PositionFix::new(t, fix.latitude, fix.longitude, fix.altitude, fix.accuracy);
            sample.valid = fix.valid;
            estimator.on_position_fix(sample)?;
        }
        if let Some(odom) = &reading.odometry {
            let mut sample = OdometrySample::new(t, Vector3::from(odom.linear), Vector3::from(odom.angular));
            sample.linear_variance = odom.linear_variance;
            sample.angular_variance = odom.angular_variance;
            estimator.on_odometry_sample(sample)?;
        }
        estimates.extend(outputs.try_iter());
    }

    estimator.shutdown()?;
    estimates.extend(outputs.try_iter());
    let final_state = estimator.current_state();
    let diagnostics = estimator.diagnostics();

    println!("\n=== Replay summary ===");
    println!("Estimates published: {}", estimates.len());
    println!(
        "Epochs: {} (degraded {}), fixes accepted/rejected: {}/{}, dropped constraints: {}",
        diagnostics.epochs,
        diagnostics.degraded_epochs,
        diagnostics.fixes_accepted,
        diagnostics.fixes_rejected,
        diagnostics.dropped_constraints
    );
    println!("Solve time: last {:.2} ms, max {:.2} ms", diagnostics.last_solve_ms, diagnostics.max_solve_ms);
    match final_state {
        Some(state) => println!(
            "Final t={:.3} pos=({:.2}, {:.2}, {:.2}) vel=({:.2}, {:.2}, {:.2})",
            state.timestamp,
            state.nav.position.x,
            state.nav.position.y,
            state.nav.position.z,
            state.nav.velocity.x,
            state.nav.velocity.y,
            state.nav.velocity.z
        ),
        None => println!("No estimate: estimator never initialized"),
    }

    if let Some(path) = &args.output {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &estimates)?;
        println!("Estimates written to {}", path.display());
    }
    if let Some(path) = &args.diagnostics {
        diagnostics.save(path)?;
        println!("Diagnostics written to {}", path.display());
    }

    Ok(())
}
