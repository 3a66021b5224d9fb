// Per-wheel control loop driver
//
// Owns the bus and GPIO handles and runs one sampling tick at a time:
// read encoder -> rollover correction -> feedback -> PI -> direction line ->
// DAC write. The per-wheel state lives in a WheelControlState owned by the
// caller.

use tracing::{debug, error, info, warn};

use super::dac::{self, DacAddress, DacCommand};
use super::direction::DirectionController;
use super::encoder;
use super::pi::{self, PiController, PiGains};
use super::wrap::WrapTracker;
use super::{ControlMode, MotionDirection, Wheel};
use crate::config::BoardConfig;
use crate::error::{ControlError, Result};
use crate::hw::{BusChannel, GpioPort, SpiTransport};
use crate::messages::{ControllerHealth, OdometryReport, TickReport};

/// Everything one wheel carries from tick to tick.
///
/// Created uninitialized; [`ControlLoopDriver::initialize`] seeds it from the
/// encoder. A failed tick leaves it untouched apart from the encoder failure
/// count and the direction line, which always mirrors the last successful
/// GPIO write. The next tick then measures against an older `previous_angle`.
#[derive(Debug, Clone)]
pub struct WheelControlState {
    wheel: Wheel,
    tracker: WrapTracker,
    cumulative_position_degrees: f32,
    controller: PiController,
    direction: MotionDirection,
    /// Direction line currently driven opposite to `direction`
    line_reversed: bool,
    initialized: bool,
    ticks: u64,
    stale_ticks: u32,
    halted: bool,
}

impl WheelControlState {
    pub fn new(wheel: Wheel, config: &BoardConfig) -> Self {
        Self {
            wheel,
            tracker: WrapTracker::new(0, config.wrap_tolerance),
            cumulative_position_degrees: 0.0,
            controller: PiController::new(PiGains {
                kp: config.kp,
                ki: config.ki,
            }),
            direction: MotionDirection::Forward,
            line_reversed: false,
            initialized: false,
            ticks: 0,
            stale_ticks: 0,
            halted: false,
        }
    }

    /// Start a fresh session: back to uninitialized with empty accumulators
    pub fn reset(&mut self) {
        self.tracker = WrapTracker::new(0, self.tracker.tolerance());
        self.cumulative_position_degrees = 0.0;
        self.controller.reset();
        self.line_reversed = false;
        self.initialized = false;
        self.ticks = 0;
        self.stale_ticks = 0;
        self.halted = false;
    }

    pub fn wheel(&self) -> Wheel {
        self.wheel
    }

    pub fn previous_angle(&self) -> u16 {
        self.tracker.previous()
    }

    pub fn cumulative_position_degrees(&self) -> f32 {
        self.cumulative_position_degrees
    }

    pub fn integral_error(&self, mode: ControlMode) -> f32 {
        self.controller.integral(mode)
    }

    pub fn direction(&self) -> MotionDirection {
        self.direction
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn health(&self) -> ControllerHealth {
        if self.halted {
            ControllerHealth::Halted
        } else if self.stale_ticks > 0 {
            ControllerHealth::EncoderStale
        } else {
            ControllerHealth::Ok
        }
    }
}

/// Open-loop odometry: how far and how fast a wheel moves under a fixed drive
#[derive(Debug, Clone)]
pub struct OdometryMonitor {
    wheel: Wheel,
    direction: MotionDirection,
    tracker: WrapTracker,
    position_degrees: f32,
    elapsed: f32,
}

impl OdometryMonitor {
    pub fn position_degrees(&self) -> f32 {
        self.position_degrees
    }
}

/// Runs control ticks against one bus and one set of discrete outputs
pub struct ControlLoopDriver<B: SpiTransport, G: GpioPort> {
    bus: B,
    gpio: G,
    config: BoardConfig,
    outputs: DirectionController,
    released: bool,
}

impl<B: SpiTransport, G: GpioPort> ControlLoopDriver<B, G> {
    /// Wrap the handles without touching the hardware
    pub fn new(bus: B, gpio: G, config: BoardConfig) -> Self {
        let outputs = DirectionController::new(config.pins);
        Self {
            bus,
            gpio,
            config,
            outputs,
            released: false,
        }
    }

    /// Wrap the handles and bring up the board
    pub fn open(bus: B, gpio: G, config: BoardConfig) -> Result<Self> {
        let mut driver = Self::new(bus, gpio, config);
        driver.setup()?;
        Ok(driver)
    }

    /// Configure the three SPI channels and the brake/direction outputs
    pub fn setup(&mut self) -> Result<()> {
        self.ensure_live()?;
        self.config.validate()?;
        for channel in BusChannel::ALL {
            let settings = self.config.bus_settings(channel);
            self.bus
                .configure(channel, settings)
                .map_err(|e| as_setup(format!("SPI channel {}", channel.index()), e))?;
            info!(
                "SPI channel {} ({:?}): mode {}, {} bits, {} Hz",
                channel.index(),
                channel,
                settings.mode,
                settings.bits_per_word,
                settings.clock_hz
            );
        }
        self.outputs
            .init(&mut self.gpio)
            .map_err(|e| as_setup("brake/direction outputs", e))?;
        Ok(())
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    /// Seed `state` from the encoder and drive the direction line.
    ///
    /// Must be called once per session before the first tick.
    pub fn initialize(
        &mut self,
        state: &mut WheelControlState,
        direction: MotionDirection,
    ) -> Result<()> {
        self.ensure_live()?;
        let wheel = state.wheel;
        let sample = encoder::read(&mut self.bus, wheel)?;
        self.outputs.set_direction(&mut self.gpio, wheel, direction)?;

        state.tracker = WrapTracker::new(sample.angle, state.tracker.tolerance());
        state.direction = direction;
        state.line_reversed = false;
        state.initialized = true;
        state.stale_ticks = 0;
        info!(
            "{:?} wheel initialized at angle {} moving {:?}",
            wheel, sample.angle, direction
        );
        Ok(())
    }

    /// Run one sampling tick toward `target` (degrees, or degrees per second)
    pub fn tick(
        &mut self,
        state: &mut WheelControlState,
        mode: ControlMode,
        target: f32,
    ) -> Result<TickReport> {
        let wheel = state.wheel;
        if !state.initialized {
            return Err(ControlError::InvalidArgument(format!(
                "{:?} wheel ticked before initialize",
                wheel
            )));
        }
        if state.halted {
            return Err(ControlError::Halted { wheel });
        }
        self.ensure_live()?;

        match self.run_tick(state, mode, target) {
            Ok((next, report)) => {
                *state = next;
                Ok(report)
            }
            Err(e) if e.is_encoder_read() => Err(self.record_encoder_failure(state, e)),
            Err(e) => Err(e),
        }
    }

    fn run_tick(
        &mut self,
        state: &mut WheelControlState,
        mode: ControlMode,
        target: f32,
    ) -> Result<(WheelControlState, TickReport)> {
        let wheel = state.wheel;
        let dt = self.config.dt;
        let mut next = state.clone();

        let sample = encoder::read(&mut self.bus, wheel)?;
        state.stale_ticks = 0;
        let step = next.tracker.advance(sample.angle, next.direction);
        let moved = pi::delta_degrees(step.delta, self.config.gear_ratio);

        let feedback = match mode {
            ControlMode::Position => {
                next.cumulative_position_degrees += moved;
                next.cumulative_position_degrees
            }
            ControlMode::Velocity => moved / dt,
        };
        let out = next.controller.step(mode, target, feedback, dt);

        // Past the target in position mode: drive the line the other way,
        // rewritten on every tick the error stays negative
        let reversed = mode == ControlMode::Position && out.error < 0.0;
        if reversed {
            self.outputs
                .set_direction(&mut self.gpio, wheel, next.direction.reversed())?;
        } else if next.line_reversed {
            self.outputs
                .set_direction(&mut self.gpio, wheel, next.direction)?;
        }
        // The line is now physically set, whatever happens to the DAC write
        state.line_reversed = reversed;
        next.line_reversed = reversed;

        let drive = out.output as i32;
        dac::write(
            &mut self.bus,
            wheel.dac_address(),
            DacCommand::WriteUpdate,
            drive,
        )?;

        next.ticks += 1;
        next.stale_ticks = 0;
        debug!(
            "{:?} tick {}: angle={} delta={} feedback={:.2} err={:.2} err_i={:.2} out={:.1}",
            wheel, next.ticks, sample.angle, step.delta, feedback, out.error, out.integral, out.output
        );

        let report = TickReport {
            wheel,
            mode,
            tick: next.ticks,
            angle: sample.angle,
            delta: step.delta,
            wrapped: step.wrapped,
            feedback,
            error: out.error,
            integral: out.integral,
            output: out.output,
            dac_value: dac::clamp_value(drive),
            reversed,
        };
        Ok((next, report))
    }

    /// Count a failed encoder read; latch the brake once the limit is reached
    fn record_encoder_failure(
        &mut self,
        state: &mut WheelControlState,
        err: ControlError,
    ) -> ControlError {
        let wheel = state.wheel;
        state.stale_ticks += 1;
        warn!(
            "{:?} encoder read failed ({} in a row): {}",
            wheel, state.stale_ticks, err
        );

        match self.config.stale_tick_limit {
            Some(limit) if state.stale_ticks >= limit => {
                state.halted = true;
                if let Err(e) = self.outputs.set_brake(&mut self.gpio, wheel, true) {
                    error!("Failed to engage {:?} brake: {}", wheel, e);
                }
                error!(
                    "{:?} wheel halted after {} consecutive encoder read failures",
                    wheel, state.stale_ticks
                );
                ControlError::Halted { wheel }
            }
            _ => err,
        }
    }

    pub fn set_brake(&mut self, wheel: Wheel, engaged: bool) -> Result<()> {
        self.ensure_live()?;
        self.outputs.set_brake(&mut self.gpio, wheel, engaged)
    }

    pub fn set_direction(&mut self, wheel: Wheel, direction: MotionDirection) -> Result<()> {
        self.ensure_live()?;
        self.outputs.set_direction(&mut self.gpio, wheel, direction)
    }

    /// Send one raw DAC command
    pub fn write_dac(&mut self, address: DacAddress, command: DacCommand, value: i32) -> Result<()> {
        self.ensure_live()?;
        dac::write(&mut self.bus, address, command, value)
    }

    /// Engage both brakes and zero both DAC outputs. Never called implicitly.
    pub fn park(&mut self) -> Result<()> {
        self.ensure_live()?;
        for wheel in Wheel::BOTH {
            self.outputs.set_brake(&mut self.gpio, wheel, true)?;
        }
        dac::write(&mut self.bus, DacAddress::All, DacCommand::WriteUpdate, 0)?;
        info!("Board parked: brakes engaged, drive zeroed");
        Ok(())
    }

    /// Take a starting reading for an open-loop odometry run
    pub fn start_monitor(&mut self, wheel: Wheel, direction: MotionDirection) -> Result<OdometryMonitor> {
        self.ensure_live()?;
        let sample = encoder::read(&mut self.bus, wheel)?;
        Ok(OdometryMonitor {
            wheel,
            direction,
            tracker: WrapTracker::new(sample.angle, self.config.wrap_tolerance),
            position_degrees: 0.0,
            elapsed: 0.0,
        })
    }

    pub fn monitor_tick(&mut self, monitor: &mut OdometryMonitor) -> Result<OdometryReport> {
        self.ensure_live()?;
        let dt = self.config.dt;
        let sample = encoder::read(&mut self.bus, monitor.wheel)?;
        let step = monitor.tracker.advance(sample.angle, monitor.direction);
        let moved = pi::delta_degrees(step.delta, self.config.gear_ratio);

        monitor.position_degrees += moved;
        monitor.elapsed += dt;

        Ok(OdometryReport {
            wheel: monitor.wheel,
            angle: sample.angle,
            delta: step.delta,
            position_degrees: monitor.position_degrees,
            instant_speed: moved / dt,
            average_speed: monitor.position_degrees / monitor.elapsed,
        })
    }

    /// Release the bus and GPIO handles. Outputs are left as they are.
    pub fn shutdown(&mut self) {
        if self.released {
            return;
        }
        self.bus.release();
        self.gpio.release();
        self.released = true;
        info!("Board handles released");
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    fn ensure_live(&self) -> Result<()> {
        if self.released {
            return Err(ControlError::Released);
        }
        Ok(())
    }
}

impl<B: SpiTransport, G: GpioPort> Drop for ControlLoopDriver<B, G> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Report configuration failures as setup errors; bad arguments stay as they are
fn as_setup(what: impl Into<String>, err: ControlError) -> ControlError {
    match err {
        ControlError::Setup { .. } | ControlError::InvalidArgument(_) => err,
        other => ControlError::setup(what, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RESOLUTION;
    use crate::hw::sim::{SimBoard, SimBus, SimGpio};
    use crate::hw::SharedBus;
    use std::sync::{Arc, Barrier};
    use std::thread;

    const STEP: i32 = -41; // forward travel counts down

    fn open(board: &SimBoard, config: BoardConfig) -> ControlLoopDriver<SimBus, SimGpio> {
        ControlLoopDriver::open(board.bus(), board.gpio(), config).unwrap()
    }

    fn started(
        board: &SimBoard,
        wheel: Wheel,
    ) -> (ControlLoopDriver<SimBus, SimGpio>, WheelControlState) {
        started_with(board, wheel, BoardConfig::default())
    }

    fn started_with(
        board: &SimBoard,
        wheel: Wheel,
        config: BoardConfig,
    ) -> (ControlLoopDriver<SimBus, SimGpio>, WheelControlState) {
        let mut state = WheelControlState::new(wheel, &config);
        let mut driver = open(board, config);
        driver
            .initialize(&mut state, MotionDirection::Forward)
            .unwrap();
        (driver, state)
    }

    #[test]
    fn test_setup_configures_bus_and_outputs() {
        let board = SimBoard::new();
        let _driver = open(&board, BoardConfig::default());
        assert_eq!(board.configured(BusChannel::Dac).unwrap().clock_hz, 1_000_000);
        assert_eq!(
            board.configured(BusChannel::EncoderLeft).unwrap().clock_hz,
            10_000
        );
        assert!(board.configured(BusChannel::EncoderRight).is_some());
        for pin in [5, 6, 13, 19] {
            assert_eq!(board.pin_level(pin), Some(true));
        }
    }

    #[test]
    fn test_open_rejects_unusable_config() {
        let board = SimBoard::new();
        let config = BoardConfig {
            dt: 0.0,
            ..BoardConfig::default()
        };
        let err = ControlLoopDriver::open(board.bus(), board.gpio(), config)
            .err()
            .unwrap();
        assert!(matches!(err, ControlError::InvalidArgument(_)));
        assert!(board.configured(BusChannel::Dac).is_none());
    }

    #[test]
    fn test_setup_failure_is_setup_error() {
        let board = SimBoard::new();
        board.fail_gpio_writes(true);
        let err = ControlLoopDriver::open(board.bus(), board.gpio(), BoardConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, ControlError::Setup { .. }));
    }

    #[test]
    fn test_tick_before_initialize_touches_nothing() {
        let board = SimBoard::new().with_encoder(Wheel::Left, 1000, STEP);
        let config = BoardConfig::default();
        let mut state = WheelControlState::new(Wheel::Left, &config);
        let mut driver = open(&board, config);

        let err = driver
            .tick(&mut state, ControlMode::Position, 360.0)
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidArgument(_)));
        assert_eq!(board.encoder_angle(Wheel::Left), 1000);
        assert!(board.dac_frames().is_empty());
    }

    #[test]
    fn test_initialize_seeds_previous_angle() {
        let board = SimBoard::new().with_encoder(Wheel::Right, 1000, STEP);
        let (_driver, state) = started(&board, Wheel::Right);
        assert!(state.is_initialized());
        assert_eq!(state.previous_angle(), 1000);
        assert_eq!(board.pin_writes(19), 2); // setup + initialize
        assert_eq!(state.health(), ControllerHealth::Ok);
    }

    #[test]
    fn test_position_tick() {
        let board = SimBoard::new().with_encoder(Wheel::Left, 1000, STEP);
        let (mut driver, mut state) = started(&board, Wheel::Left);

        let report = driver
            .tick(&mut state, ControlMode::Position, 360.0)
            .unwrap();
        let moved = pi::delta_degrees(41, 10.0);
        assert_eq!(report.angle, 959);
        assert_eq!(report.delta, 41);
        assert!(!report.wrapped);
        assert!((report.feedback - moved).abs() < 1e-5);
        assert!((report.error - (360.0 - moved)).abs() < 1e-3);
        assert_eq!(report.dac_value, 1023);
        assert!(!report.reversed);
        assert_eq!(state.previous_angle(), 959);

        let frames = board.dac_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(
            dac::decode(frames[0]).unwrap(),
            (DacAddress::Left, DacCommand::WriteUpdate, 1023)
        );
    }

    #[test]
    fn test_tick_across_rollover() {
        let board = SimBoard::new().with_encoder(Wheel::Left, 20, STEP);
        let (mut driver, mut state) = started(&board, Wheel::Left);
        let report = driver
            .tick(&mut state, ControlMode::Position, 360.0)
            .unwrap();
        assert!(report.wrapped);
        assert_eq!(report.delta, 41);
        assert_eq!(report.angle, 20 + 4095 - 41);
    }

    #[test]
    fn test_position_ticks_accumulate_on_own_channel() {
        let board = SimBoard::new().with_encoder(Wheel::Left, 3000, STEP);
        let (mut driver, mut state) = started(&board, Wheel::Left);

        let first = driver
            .tick(&mut state, ControlMode::Position, 360.0)
            .unwrap();
        let mut last = first.clone();
        for _ in 1..500 {
            last = driver
                .tick(&mut state, ControlMode::Position, 360.0)
                .unwrap();
            assert!(!last.wrapped || last.delta == 41);
        }
        assert!(last.error.abs() < first.error.abs());
        assert!((state.cumulative_position_degrees() - 500.0 * pi::delta_degrees(41, 10.0)).abs() < 0.05);

        let frames = board.dac_frames();
        assert_eq!(frames.len(), 500);
        for frame in frames {
            let (address, command, _) = dac::decode(frame).unwrap();
            assert_eq!(address, DacAddress::Left);
            assert_eq!(command, DacCommand::WriteUpdate);
        }
    }

    #[test]
    fn test_proportional_loop_settles_on_target() {
        // Encoder speed follows the drive: 0.5 counts per read per DAC unit
        let board = SimBoard::new().with_plant(Wheel::Left, 2048, 0.5);
        let config = BoardConfig {
            ki: 0.0,
            ..BoardConfig::default()
        };
        let (mut driver, mut state) = started_with(&board, Wheel::Left, config);

        let mut last_error = f32::MAX;
        for _ in 0..1000 {
            let report = driver
                .tick(&mut state, ControlMode::Position, 360.0)
                .unwrap();
            assert!(report.error >= 0.0);
            assert!(report.error <= last_error);
            assert!(!report.reversed);
            last_error = report.error;
        }
        // Stops inside the band where the drive rounds to zero counts
        assert!(last_error < 1.0);
        assert!(state.cumulative_position_degrees() <= 360.0);
    }

    #[test]
    fn test_integral_carries_past_target_and_reverse_travel_reads_as_rollover() {
        let board = SimBoard::new().with_plant(Wheel::Left, 2048, 0.5);
        let (mut driver, mut state) = started(&board, Wheel::Left);

        let reports: Vec<TickReport> = (0..1000)
            .map(|_| {
                driver
                    .tick(&mut state, ControlMode::Position, 360.0)
                    .unwrap()
            })
            .collect();
        let crossing = reports.iter().position(|r| r.reversed).unwrap();
        assert!(reports[..crossing].iter().all(|r| r.error > 0.0));
        // The crossing tick itself lands within one tick of full-speed travel
        assert!(reports[crossing].error > -pi::delta_degrees(512, 10.0));

        // Once the line is reversed the count rises, which the forward
        // tracker reads as a rollover beyond the tolerance
        assert!(
            reports[crossing..]
                .iter()
                .any(|r| r.wrapped && r.delta > RESOLUTION / 2)
        );
        let last = reports.last().unwrap();
        assert!(last.error < -30.0);
        assert_eq!(last.dac_value, 0);
        assert_eq!(board.pin_level(13), Some(false));
    }

    #[test]
    fn test_failed_dac_write_keeps_direction_line_tracked() {
        let board = SimBoard::new().with_encoder(Wheel::Left, 1000, STEP);
        let (mut driver, mut state) = started(&board, Wheel::Left);

        // Overshoot tick reverses the line, then the DAC write fails
        board.fail_dac_writes(1);
        let err = driver
            .tick(&mut state, ControlMode::Position, 0.1)
            .unwrap_err();
        assert!(err.is_transport());
        assert_eq!(board.pin_level(13), Some(false));
        assert_eq!(state.ticks(), 0);

        // Error positive again: the commanded direction is restored
        let report = driver
            .tick(&mut state, ControlMode::Position, 100.0)
            .unwrap();
        assert!(!report.reversed);
        assert_eq!(board.pin_level(13), Some(true));
    }

    #[test]
    fn test_dac_failures_do_not_trip_encoder_guard() {
        let board = SimBoard::new().with_encoder(Wheel::Left, 1000, STEP);
        let config = BoardConfig {
            stale_tick_limit: Some(2),
            ..BoardConfig::default()
        };
        let (mut driver, mut state) = started_with(&board, Wheel::Left, config);

        board.fail_dac_writes(5);
        for _ in 0..5 {
            let err = driver
                .tick(&mut state, ControlMode::Position, 360.0)
                .unwrap_err();
            assert!(err.is_transport());
            assert!(!err.is_encoder_read());
        }
        assert_eq!(state.health(), ControllerHealth::Ok);
        assert_eq!(board.pin_level(5), Some(true));
        assert!(driver.tick(&mut state, ControlMode::Position, 360.0).is_ok());
    }

    #[test]
    fn test_overshoot_chatters_direction_line() {
        let board = SimBoard::new().with_encoder(Wheel::Left, 1000, STEP);
        let (mut driver, mut state) = started(&board, Wheel::Left);

        for _ in 0..5 {
            let report = driver.tick(&mut state, ControlMode::Position, 0.1).unwrap();
            assert!(report.reversed);
        }
        assert_eq!(board.pin_level(13), Some(false));
        assert_eq!(board.pin_writes(13), 2 + 5);
        // Commanded direction itself is unchanged
        assert_eq!(state.direction(), MotionDirection::Forward);

        // Error positive again: the commanded direction is restored once
        let report = driver
            .tick(&mut state, ControlMode::Position, 100.0)
            .unwrap();
        assert!(!report.reversed);
        assert_eq!(board.pin_level(13), Some(true));
        assert_eq!(board.pin_writes(13), 8);
        driver.tick(&mut state, ControlMode::Position, 100.0).unwrap();
        assert_eq!(board.pin_writes(13), 8);
    }

    #[test]
    fn test_velocity_output_accumulates() {
        let board = SimBoard::new().with_encoder(Wheel::Right, 2000, -1);
        let (mut driver, mut state) = started(&board, Wheel::Right);

        // 1 count per 1 ms is ~8.8 deg/s, well under the 100 deg/s target
        let mut last_output = f32::MIN;
        for _ in 0..20 {
            let report = driver
                .tick(&mut state, ControlMode::Velocity, 100.0)
                .unwrap();
            assert!(report.error > 0.0);
            assert!(report.output > last_output);
            assert!(!report.reversed);
            last_output = report.output;
        }
        assert_eq!(state.cumulative_position_degrees(), 0.0);
        assert!(state.integral_error(ControlMode::Velocity) > 0.0);
        assert_eq!(state.integral_error(ControlMode::Position), 0.0);
    }

    #[test]
    fn test_failed_read_leaves_state_untouched() {
        let board = SimBoard::new().with_encoder(Wheel::Left, 1000, STEP);
        let (mut driver, mut state) = started(&board, Wheel::Left);
        driver.tick(&mut state, ControlMode::Position, 360.0).unwrap();
        let before = (state.previous_angle(), state.ticks(), state.cumulative_position_degrees());

        board.fail_encoder_reads(Wheel::Left, 1);
        let err = driver
            .tick(&mut state, ControlMode::Position, 360.0)
            .unwrap_err();
        assert!(err.is_transport());
        assert_eq!(
            before,
            (state.previous_angle(), state.ticks(), state.cumulative_position_degrees())
        );
        assert_eq!(state.health(), ControllerHealth::EncoderStale);

        driver.tick(&mut state, ControlMode::Position, 360.0).unwrap();
        assert_eq!(state.health(), ControllerHealth::Ok);
    }

    #[test]
    fn test_repeated_failures_latch_brake() {
        let board = SimBoard::new().with_encoder(Wheel::Left, 1000, STEP);
        let config = BoardConfig {
            stale_tick_limit: Some(3),
            ..BoardConfig::default()
        };
        let mut state = WheelControlState::new(Wheel::Left, &config);
        let mut driver = open(&board, config);
        driver
            .initialize(&mut state, MotionDirection::Forward)
            .unwrap();

        board.fail_encoder_reads(Wheel::Left, 3);
        for _ in 0..2 {
            let err = driver.tick(&mut state, ControlMode::Position, 360.0).unwrap_err();
            assert!(err.is_transport());
        }
        let err = driver.tick(&mut state, ControlMode::Position, 360.0).unwrap_err();
        assert!(matches!(err, ControlError::Halted { wheel: Wheel::Left }));
        assert_eq!(state.health(), ControllerHealth::Halted);
        assert_eq!(board.pin_level(5), Some(false));

        // Latched: refused without touching the bus
        let angle = board.encoder_angle(Wheel::Left);
        assert!(driver.tick(&mut state, ControlMode::Position, 360.0).is_err());
        assert_eq!(board.encoder_angle(Wheel::Left), angle);

        state.reset();
        driver
            .initialize(&mut state, MotionDirection::Forward)
            .unwrap();
        driver.set_brake(Wheel::Left, false).unwrap();
        assert!(driver.tick(&mut state, ControlMode::Position, 360.0).is_ok());
    }

    #[test]
    fn test_staleness_guard_can_be_disabled() {
        let board = SimBoard::new().with_encoder(Wheel::Left, 1000, STEP);
        let config = BoardConfig {
            stale_tick_limit: None,
            ..BoardConfig::default()
        };
        let mut state = WheelControlState::new(Wheel::Left, &config);
        let mut driver = open(&board, config);
        driver
            .initialize(&mut state, MotionDirection::Forward)
            .unwrap();
        board.fail_encoder_reads(Wheel::Left, 50);
        for _ in 0..50 {
            let err = driver.tick(&mut state, ControlMode::Position, 360.0).unwrap_err();
            assert!(err.is_transport());
        }
        assert_eq!(state.health(), ControllerHealth::EncoderStale);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let board = SimBoard::new().with_encoder(Wheel::Left, 1000, STEP);
        let (mut driver, mut state) = started(&board, Wheel::Left);
        driver.shutdown();
        driver.shutdown();
        assert!(driver.is_released());
        assert!(board.bus_released());
        assert!(board.gpio_released());
        // No safe-state writes on teardown
        assert!(board.dac_frames().is_empty());
        assert_eq!(board.pin_level(5), Some(true));
        assert!(matches!(
            driver.tick(&mut state, ControlMode::Position, 360.0),
            Err(ControlError::Released)
        ));
    }

    #[test]
    fn test_drop_releases_handles() {
        let board = SimBoard::new();
        {
            let _driver = open(&board, BoardConfig::default());
        }
        assert!(board.bus_released());
    }

    #[test]
    fn test_park_brakes_and_zeroes() {
        let board = SimBoard::new();
        let mut driver = open(&board, BoardConfig::default());
        driver.park().unwrap();
        assert_eq!(board.pin_level(5), Some(false));
        assert_eq!(board.pin_level(6), Some(false));
        assert_eq!(board.dac_frames(), vec![[0x3F, 0x00, 0x00]]);
    }

    #[test]
    fn test_monitor_reports_speeds() {
        let board = SimBoard::new().with_encoder(Wheel::Left, 100, 20);
        let mut driver = open(&board, BoardConfig::default());
        driver
            .write_dac(DacAddress::All, DacCommand::WriteUpdate, 0x200)
            .unwrap();
        let mut monitor = driver
            .start_monitor(Wheel::Left, MotionDirection::Backward)
            .unwrap();

        let moved = pi::delta_degrees(20, 10.0);
        let mut report = driver.monitor_tick(&mut monitor).unwrap();
        for _ in 1..10 {
            report = driver.monitor_tick(&mut monitor).unwrap();
        }
        assert_eq!(report.delta, 20);
        assert!((report.position_degrees - 10.0 * moved).abs() < 1e-3);
        assert!((report.instant_speed - moved / 0.001).abs() < 0.5);
        assert!((report.average_speed - report.instant_speed).abs() < 0.5);
    }

    #[test]
    fn test_wheels_on_separate_threads_share_one_bus() {
        let board = SimBoard::new()
            .with_encoder(Wheel::Left, 1000, STEP)
            .with_encoder(Wheel::Right, 3000, STEP);
        let bus = SharedBus::new(board.bus());
        // Both loops finish before either driver drops and releases the pins
        let done = Arc::new(Barrier::new(2));

        let handles: Vec<_> = Wheel::BOTH
            .into_iter()
            .map(|wheel| {
                let bus = bus.clone();
                let gpio = board.gpio();
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    let config = BoardConfig::default();
                    let mut state = WheelControlState::new(wheel, &config);
                    let mut driver = ControlLoopDriver::open(bus, gpio, config).unwrap();
                    driver
                        .initialize(&mut state, MotionDirection::Forward)
                        .unwrap();
                    for _ in 0..100 {
                        driver
                            .tick(&mut state, ControlMode::Position, 360.0)
                            .unwrap();
                    }
                    done.wait();
                    state.cumulative_position_degrees()
                })
            })
            .collect();

        for handle in handles {
            let travelled = handle.join().unwrap();
            assert!((travelled - 100.0 * pi::delta_degrees(41, 10.0)).abs() < 0.05);
        }
        let frames = board.dac_frames();
        assert_eq!(frames.len(), 200);
        let right = frames
            .iter()
            .filter(|f| dac::decode(**f).unwrap().0 == DacAddress::Right)
            .count();
        assert_eq!(right, 100);
    }
}
