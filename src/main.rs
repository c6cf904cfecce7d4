use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use mecanum_zenoh_runtime::config::BaseConfig;

#[derive(Parser, Debug)]
#[command(about = "Zenoh runtime for a four-wheel mecanum base on ZDT X42 steppers")]
struct Args {
    /// JSON config file; every field is optional
    #[arg(long)]
    config: Option<PathBuf>,

    /// Drive the built-in simulator instead of the hardware
    #[arg(long)]
    simulate: bool,

    /// Stepper bus serial port
    #[arg(long)]
    port: Option<String>,

    /// IMU serial port
    #[arg(long)]
    imu_port: Option<String>,
}

fn load_config(args: &Args) -> Result<BaseConfig, Box<dyn std::error::Error + Send + Sync>> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading config from {}", path.display());
            BaseConfig::load(path)?
        }
        None => BaseConfig::default(),
    };
    if args.simulate {
        config.motor_enabled = false;
    }
    if let Some(port) = &args.port {
        config.serial.motor_port = port.clone();
    }
    if let Some(port) = &args.imu_port {
        config.serial.imu_port = port.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into()))
        .init(); // installs the subscriber globally

    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Config error: {}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = mecanum_zenoh_runtime::runtime::run(config).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
