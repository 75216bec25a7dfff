use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use fluxlink::{
    compute_flux, save_flux, Command, DeviceSession, FixedPosition, FsStorage, SimulatedSensor,
    Transport, DEFAULT_SLOPE_PRECISION,
};

#[derive(Parser, Debug)]
#[command(name = "fluxlink-demo", about = "Connect to a CO2 flux sensor and record a session")]
struct Args {
    /// BLE device address (e.g., AA:BB:CC:DD:EE:FF). Without it, the
    /// built-in simulator is used.
    #[arg(long)]
    address: Option<String>,
    /// Folder for session and flux CSV output.
    #[arg(long, default_value = "measurements")]
    folder: PathBuf,
    /// How long to acquire, in seconds.
    #[arg(long, default_value_t = 10)]
    seconds: u64,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        exit(1);
    }
}

async fn run() -> Result<()> {
    fluxlink::logging::init_logging();
    let args = Args::parse();

    let storage = Arc::new(FsStorage::new(&args.folder));
    let position = Arc::new(FixedPosition::default());

    let transport: Box<dyn Transport> = match &args.address {
        #[cfg(feature = "bluez")]
        Some(_address) => Box::new(fluxlink::BleTransport::new()),
        #[cfg(not(feature = "bluez"))]
        Some(_address) => anyhow::bail!(
            "hardware connections need the `bluez` feature; omit --address to use the simulator"
        ),
        None => Box::new(SimulatedSensor::new("Simulated sensor")),
    };
    let address = args
        .address
        .clone()
        .unwrap_or_else(|| "SIM:00:00:00:00:00".to_string());

    println!("--- Connecting to {address} ---");
    let mut session = DeviceSession::new(transport, storage.clone(), position.clone());
    session.connect(&address).await?;

    session.send_command(Command::Whois, None).await?;

    println!("Starting acquisition for {}s...", args.seconds);
    session.send_command(Command::StartAcquisition, None).await?;
    let _ = tokio::time::timeout(Duration::from_secs(args.seconds), session.run()).await;

    println!("Stopping...");
    match session.send_command(Command::StopAcquisition, None).await? {
        Some(path) => println!("Session saved to {}", path.display()),
        None => println!("No samples captured."),
    }

    let buffer = session.acquisition().buffer();
    println!("Buffered samples: {}", buffer.len());

    if buffer.len() >= 2 {
        let window = (buffer[0].timestamp, buffer[buffer.len() - 1].timestamp);
        match compute_flux(
            buffer,
            window,
            position.0,
            session.acquisition().sensor_name(),
            session.acquisition().calibration(),
            DEFAULT_SLOPE_PRECISION,
        ) {
            Ok(row) => {
                let path = save_flux(storage.as_ref(), &row).await?;
                println!(
                    "Flux: slope={} ppm/s, R2={:.3} -> {}",
                    row.co2_slope,
                    row.co2_r_squared,
                    path.display()
                );
            }
            Err(e) => println!("Flux not computed: {e}"),
        }
    }

    session.disconnect().await?;
    println!("Done.");
    Ok(())
}
