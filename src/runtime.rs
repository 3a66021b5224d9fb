// Demo harness: closed-loop run, open-loop monitor, raw DAC write
//
// The caller drives the cadence: a tokio interval paces the ticks and Ctrl+C
// ends the loop early. Every exit path goes through `finish`, which releases
// the board handles.

use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::{BoardConfig, MONITOR_IDLE_VALUE, SIM_COUNTS_PER_DRIVE_UNIT};
use crate::error::Result;
use crate::hw::sim::SimBoard;
use crate::hw::{GpioPort, SpiTransport};
use crate::motor::{
    ControlLoopDriver, ControlMode, DacAddress, DacCommand, MotionDirection, Wheel,
    WheelControlState,
};

pub type BoxedBus = Box<dyn SpiTransport + Send>;
pub type BoxedGpio = Box<dyn GpioPort + Send>;
pub type BoardDriver = ControlLoopDriver<BoxedBus, BoxedGpio>;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub wheel: Wheel,
    pub mode: ControlMode,
    pub direction: MotionDirection,
    pub target: f32,
    pub ticks: u32,
    /// Print one JSON TickReport per tick on stdout
    pub telemetry: bool,
    /// Brake and zero the drive before releasing the board
    pub park_on_exit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    pub ticks: u32,
    pub initial_error: f32,
    pub final_error: f32,
    pub interrupted: bool,
}

/// Open the board: real hardware with the `rpi` feature unless `simulate`,
/// otherwise the simulated board with both wheels driven by their DAC outputs
pub fn open_board(config: BoardConfig, simulate: bool) -> Result<BoardDriver> {
    #[cfg(feature = "rpi")]
    if !simulate {
        use crate::hw::rpi::{RpiGpio, RpiSpi};
        info!("Opening Raspberry Pi GPIO and SPI devices");
        let bus: BoxedBus = Box::new(RpiSpi::new());
        let gpio: BoxedGpio = Box::new(RpiGpio::open()?);
        return ControlLoopDriver::open(bus, gpio, config);
    }

    if !simulate && !cfg!(feature = "rpi") {
        warn!("Built without the `rpi` feature, using the simulated board");
    }
    let board = SimBoard::new()
        .with_plant(Wheel::Left, 2048, SIM_COUNTS_PER_DRIVE_UNIT)
        .with_plant(Wheel::Right, 2048, SIM_COUNTS_PER_DRIVE_UNIT);
    let bus: BoxedBus = Box::new(board.bus());
    let gpio: BoxedGpio = Box::new(board.gpio());
    ControlLoopDriver::open(bus, gpio, config)
}

/// Closed-loop demo: drive one wheel toward `target` for a bounded number of ticks
pub async fn run<B, G>(driver: &mut ControlLoopDriver<B, G>, opts: &RunOptions) -> Result<RunSummary>
where
    B: SpiTransport,
    G: GpioPort,
{
    let result = closed_loop(driver, opts).await;
    finish(driver, opts.park_on_exit);
    result
}

async fn closed_loop<B, G>(
    driver: &mut ControlLoopDriver<B, G>,
    opts: &RunOptions,
) -> Result<RunSummary>
where
    B: SpiTransport,
    G: GpioPort,
{
    let period = driver.config().sample_period()?;
    let mut state = WheelControlState::new(opts.wheel, driver.config());
    driver.initialize(&mut state, opts.direction)?;

    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    info!(
        "Control loop started: {:?} wheel, {:?} mode, target {}, {} ticks every {:?}",
        opts.wheel, opts.mode, opts.target, opts.ticks, period
    );

    let mut summary = RunSummary {
        ticks: 0,
        initial_error: 0.0,
        final_error: 0.0,
        interrupted: false,
    };

    while summary.ticks < opts.ticks {
        tokio::select! {
            _ = tick.tick() => {}
            _ = &mut ctrl_c => {
                warn!("Interrupted after {} ticks", summary.ticks);
                summary.interrupted = true;
                break;
            }
        }

        let report = driver.tick(&mut state, opts.mode, opts.target)?;
        if summary.ticks == 0 {
            summary.initial_error = report.error;
        }
        summary.final_error = report.error;
        summary.ticks += 1;

        if opts.telemetry {
            println!("{}", serde_json::to_string(&report)?);
        }
    }

    info!(
        "Control loop done: {} ticks, error {:.2} -> {:.2}, health {:?}",
        summary.ticks,
        summary.initial_error,
        summary.final_error,
        state.health()
    );
    Ok(summary)
}

/// Open-loop odometry: hold a fixed drive and report distance and speed
pub async fn monitor<B, G>(
    driver: &mut ControlLoopDriver<B, G>,
    wheel: Wheel,
    direction: MotionDirection,
    value: i32,
    ticks: u32,
) -> Result<()>
where
    B: SpiTransport,
    G: GpioPort,
{
    let result = open_loop(driver, wheel, direction, value, ticks).await;
    finish(driver, false);
    result
}

async fn open_loop<B, G>(
    driver: &mut ControlLoopDriver<B, G>,
    wheel: Wheel,
    direction: MotionDirection,
    value: i32,
    ticks: u32,
) -> Result<()>
where
    B: SpiTransport,
    G: GpioPort,
{
    let period = driver.config().sample_period()?;
    driver.set_direction(wheel, direction)?;
    driver.write_dac(DacAddress::All, DacCommand::WriteUpdate, value)?;
    let mut monitor = driver.start_monitor(wheel, direction)?;

    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    for _ in 0..ticks {
        tokio::select! {
            _ = tick.tick() => {}
            _ = &mut ctrl_c => {
                warn!("Interrupted");
                break;
            }
        }
        let report = driver.monitor_tick(&mut monitor)?;
        println!("{}", serde_json::to_string(&report)?);
    }

    driver.write_dac(DacAddress::All, DacCommand::WriteUpdate, MONITOR_IDLE_VALUE)?;
    info!(
        "Monitor done: {:.2} degrees travelled",
        monitor.position_degrees()
    );
    Ok(())
}

/// Single raw DAC command
pub fn write_dac<B, G>(
    driver: &mut ControlLoopDriver<B, G>,
    address: DacAddress,
    command: DacCommand,
    value: i32,
) -> Result<()>
where
    B: SpiTransport,
    G: GpioPort,
{
    let result = driver.write_dac(address, command, value);
    finish(driver, false);
    result
}

fn finish<B: SpiTransport, G: GpioPort>(driver: &mut ControlLoopDriver<B, G>, park: bool) {
    if park {
        if let Err(e) = driver.park() {
            warn!("Failed to park board: {}", e);
        }
    }
    driver.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEMO_TARGET_DEGREES;
    use crate::error::ControlError;
    use crate::hw::sim::{SimBus, SimGpio};
    use crate::motor::dac;

    const STEP: i32 = 20;

    fn options(ticks: u32) -> RunOptions {
        RunOptions {
            wheel: Wheel::Left,
            mode: ControlMode::Position,
            direction: MotionDirection::Forward,
            target: DEMO_TARGET_DEGREES,
            ticks,
            telemetry: false,
            park_on_exit: false,
        }
    }

    fn sim_driver(board: &SimBoard) -> ControlLoopDriver<SimBus, SimGpio> {
        ControlLoopDriver::open(board.bus(), board.gpio(), BoardConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_demo_run_converges_and_releases() {
        let board = SimBoard::new().with_encoder(Wheel::Left, 2048, -STEP);
        let mut driver = sim_driver(&board);

        let summary = run(&mut driver, &options(200)).await.unwrap();
        assert_eq!(summary.ticks, 200);
        assert!(!summary.interrupted);
        assert!(summary.final_error.abs() < summary.initial_error.abs());
        assert!(driver.is_released());
        assert!(board.bus_released());
        // No parking unless asked for
        assert_eq!(board.pin_level(5), Some(true));
    }

    #[tokio::test]
    async fn test_park_on_exit() {
        let board = SimBoard::new().with_encoder(Wheel::Left, 2048, -STEP);
        let mut driver = sim_driver(&board);
        let opts = RunOptions {
            park_on_exit: true,
            ..options(3)
        };
        run(&mut driver, &opts).await.unwrap();
        assert_eq!(board.pin_level(5), Some(false));
        assert_eq!(board.dac_frames().last(), Some(&[0x3F, 0x00, 0x00]));
    }

    #[tokio::test]
    async fn test_failed_tick_still_releases() {
        let board = SimBoard::new().with_encoder(Wheel::Left, 2048, -STEP);
        let mut driver = sim_driver(&board);
        board.fail_encoder_reads(Wheel::Left, 2); // initialize read fails
        assert!(run(&mut driver, &options(10)).await.is_err());
        assert!(board.bus_released());
    }

    #[tokio::test]
    async fn test_monitor_writes_drive_then_idle() {
        let board = SimBoard::new().with_encoder(Wheel::Right, 100, STEP);
        let mut driver = sim_driver(&board);
        monitor(&mut driver, Wheel::Right, MotionDirection::Backward, 0x200, 5)
            .await
            .unwrap();

        let values: Vec<u16> = board
            .dac_frames()
            .into_iter()
            .map(|f| dac::decode(f).unwrap().2)
            .collect();
        assert_eq!(values, vec![0x200, MONITOR_IDLE_VALUE as u16]);
        assert_eq!(board.pin_level(19), Some(false));
    }

    #[test]
    fn test_open_board_simulated() {
        let mut driver = open_board(BoardConfig::default(), true).unwrap();
        write_dac(&mut driver, DacAddress::Right, DacCommand::WriteUpdate, 5000).unwrap();
        assert!(driver.is_released());
    }

    #[test]
    fn test_simulated_board_moves_under_drive() {
        let mut driver = open_board(BoardConfig::default(), true).unwrap();
        driver
            .write_dac(DacAddress::Left, DacCommand::WriteUpdate, 100)
            .unwrap();
        let mut monitor = driver
            .start_monitor(Wheel::Left, MotionDirection::Forward)
            .unwrap();
        let report = driver.monitor_tick(&mut monitor).unwrap();
        // 100 units at 0.5 counts each
        assert_eq!(report.delta, 50);
    }

    #[tokio::test]
    async fn test_zero_period_is_an_error_not_a_panic() {
        let board = SimBoard::new().with_encoder(Wheel::Left, 2048, -STEP);
        let mut driver = ControlLoopDriver::new(
            board.bus(),
            board.gpio(),
            BoardConfig {
                dt: 0.0,
                ..BoardConfig::default()
            },
        );
        assert!(matches!(
            run(&mut driver, &options(5)).await,
            Err(ControlError::InvalidArgument(_))
        ));
        assert!(driver.is_released());
    }
}
