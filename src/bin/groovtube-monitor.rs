use std::path::PathBuf;

use clap::Parser;
use log::{error, info};

use groovtube_ble::transport::ble::BleTransport;
use groovtube_ble::{init_logging, BreathSession, SessionConfig};

/// Connect to a GroovTube and print live breath values.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to a JSON session config; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run a calibration once connected, before printing values.
    #[arg(long)]
    calibrate: bool,

    /// Override the dead zone fraction.
    #[arg(long)]
    dead_zone: Option<f64>,
}

fn load_config(path: Option<&PathBuf>) -> Result<SessionConfig, Box<dyn std::error::Error + Send + Sync>> {
    match path {
        None => Ok(SessionConfig::default()),
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&text)?)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_logging();
    info!(concat!("GroovTube monitor ", env!("CARGO_PKG_VERSION")));

    let args = Args::parse();
    let mut config = load_config(args.config.as_ref())?;
    if let Some(dead_zone) = args.dead_zone {
        config.dead_zone = dead_zone;
    }

    let transport = BleTransport::new().await?;
    let session = BreathSession::with_config(transport, config);

    session.on_ready_state_change(|state| info!("Ready state: {state:?}"));
    session.on_calibration_state_change(|calibrating| info!("Calibrating: {calibrating}"));
    session.on_error(|err| error!("Session error: {err}"));
    session.on_breath(|value| println!("breath {value:+.3}"));

    session.request_device().await?;

    tokio::select! {
        result = session.connect() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Aborted before the connection was established");
            session.disconnect().await?;
            return Ok(());
        }
    }

    if args.calibrate {
        println!("Calibrating; keep the tube at rest...");
        session.calibrate().await?;
        println!("Calibration done.");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    session.disconnect().await?;
    Ok(())
}
