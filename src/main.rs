use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use wheel_servo_runtime::config::{BoardConfig, DEMO_TARGET_DEGREES, DEMO_TICKS};
use wheel_servo_runtime::error::Result;
use wheel_servo_runtime::motor::{ControlMode, DacAddress, DacCommand, MotionDirection, Wheel};
use wheel_servo_runtime::runtime::{self, RunOptions};

#[derive(Parser, Debug)]
#[command(name = "wheel-servo-runtime", about = "Two-wheel servo control over SPI and GPIO")]
struct Cli {
    /// JSON board config; missing fields use the built-in defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use the simulated board instead of the Raspberry Pi peripherals
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Closed-loop run toward a target
    Run {
        #[arg(long, value_enum, default_value = "left")]
        wheel: Wheel,
        #[arg(long, value_enum, default_value = "position")]
        mode: ControlMode,
        #[arg(long, value_enum, default_value = "forward")]
        direction: MotionDirection,
        /// Degrees (position) or degrees per second (velocity)
        #[arg(long, default_value_t = DEMO_TARGET_DEGREES)]
        target: f32,
        #[arg(long, default_value_t = DEMO_TICKS)]
        ticks: u32,
        /// Print one JSON report per tick
        #[arg(long)]
        telemetry: bool,
        /// Engage both brakes and zero the drive before exiting
        #[arg(long)]
        park_on_exit: bool,
    },
    /// Hold a fixed drive and report odometry
    Monitor {
        #[arg(long, value_enum, default_value = "left")]
        wheel: Wheel,
        #[arg(long, value_enum, default_value = "forward")]
        direction: MotionDirection,
        #[arg(long, default_value_t = 0x200)]
        value: i32,
        #[arg(long, default_value_t = DEMO_TICKS)]
        ticks: u32,
    },
    /// Send a single DAC command
    Dac {
        #[arg(long, value_enum, default_value = "all")]
        address: DacAddress,
        #[arg(long, value_enum, default_value = "write-update")]
        command: DacCommand,
        #[arg(long, default_value_t = 0)]
        value: i32,
    },
}

async fn execute(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => BoardConfig::load(path)?,
        None => BoardConfig::default(),
    };
    let mut driver = runtime::open_board(config, cli.simulate)?;

    match cli.command {
        Command::Run {
            wheel,
            mode,
            direction,
            target,
            ticks,
            telemetry,
            park_on_exit,
        } => {
            let opts = RunOptions {
                wheel,
                mode,
                direction,
                target,
                ticks,
                telemetry,
                park_on_exit,
            };
            runtime::run(&mut driver, &opts).await?;
        }
        Command::Monitor {
            wheel,
            direction,
            value,
            ticks,
        } => runtime::monitor(&mut driver, wheel, direction, value, ticks).await?,
        Command::Dac {
            address,
            command,
            value,
        } => runtime::write_dac(&mut driver, address, command, value)?,
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=debug for per-tick output)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = execute(cli).await {
        error!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
