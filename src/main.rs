use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use damiao_motor_runtime::config::{ENABLE_SETTLE, SessionConfig};
use damiao_motor_runtime::messages::Script;
use damiao_motor_runtime::motor::open_session;
use damiao_motor_runtime::runtime::{Sequencer, bring_up};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scenario {
    /// One motor on 0x01/0x11
    Single,
    /// Two motors on 0x01/0x11 and 0x02/0x12
    Dual,
}

/// Run a velocity test sequence on DaMiao motors
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// JSON session config (port, baud rate, motors, limits)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serial port of the USB-CAN adapter
    #[arg(long)]
    port: Option<String>,

    #[arg(long)]
    baud_rate: Option<u32>,

    /// Velocity limit in rad/s
    #[arg(long, allow_negative_numbers = true)]
    max_speed: Option<f32>,

    #[arg(long, value_enum, default_value_t = Scenario::Single)]
    scenario: Scenario,

    /// JSON script to run instead of the built-in scenario
    #[arg(long)]
    script: Option<PathBuf>,
}

fn load(args: &Args) -> Result<(SessionConfig, Script), Box<dyn std::error::Error>> {
    let mut config = match (&args.config, args.scenario) {
        (Some(path), _) => SessionConfig::from_json_file(path)?,
        (None, Scenario::Single) => SessionConfig::default(),
        (None, Scenario::Dual) => SessionConfig::dual_motor(),
    };
    if let Some(port) = &args.port {
        config.port = port.clone();
    }
    if let Some(baud_rate) = args.baud_rate {
        config.baud_rate = baud_rate;
    }
    if let Some(max_speed) = args.max_speed {
        config.max_speed = max_speed;
    }
    config.validate()?;

    let script = match (&args.script, args.scenario) {
        (Some(path), _) => Script::from_json_file(path)?,
        (None, Scenario::Single) => Script::single_motor(),
        (None, Scenario::Dual) => Script::dual_motor(),
    };
    Ok((config, script))
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::parse();
    let (config, script) = match load(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Config error: {}", e);
            std::process::exit(2);
        }
    };

    let mut session = match open_session(&config) {
        Ok(session) => session,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let sequence = async {
        let handles = bring_up(&mut session, &config.motors)?;
        tokio::time::sleep(ENABLE_SETTLE).await;
        Sequencer::new(script, handles)?.run(&mut session).await
    };

    // Ctrl+C drops the sequence and falls through to shutdown
    let outcome = tokio::select! {
        result = sequence => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping motors");
            Ok(())
        }
    };

    if let Err(e) = &outcome {
        error!("Sequence failed: {}", e);
    }

    let report = session.close();
    if !report.is_clean() {
        error!("{}", report);
    }

    info!("Program ended");
    if outcome.is_err() || !report.is_clean() {
        std::process::exit(1);
    }
}
