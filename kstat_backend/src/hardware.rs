/*!
Collaborators outside the instrument link: the motor/valve driver and the
profiler stage.

Only the interfaces live here. The GPIO motor driver is represented by
[`LoggingMotorDriver`], and a system without a profiler stage runs with
[`NullPositioner`].
*/

use std::collections::BTreeMap;
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, info};

/// Motor driver channel wired to the purge valve
pub const PURGE_CHANNEL: char = 'A';

/// Motor driver channel wired to the stirrer
pub const STIR_CHANNEL: char = 'B';

/// Failures reported by a positioning stage
#[derive(Error, Debug)]
pub enum HardwareError {
    #[error("Stage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stage fault: {0}")]
    Fault(String),
}

/// Dual H-bridge driving the purge valve and the stirrer
pub trait MotorDriver: Send + Sync {
    fn activate(&self, channel: char);
    fn deactivate(&self, channel: char);
    /// Run the channel at `speed` (0 stops it)
    fn start(&self, channel: char, speed: f64);
}

/// Last command seen on one motor channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChannelState {
    Active,
    Inactive,
    Running(f64),
}

/// Motor driver that only logs and remembers what it was told
#[derive(Debug, Default)]
pub struct LoggingMotorDriver {
    channels: Mutex<BTreeMap<char, ChannelState>>,
}

impl LoggingMotorDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, channel: char) -> Option<ChannelState> {
        self.lock().get(&channel).copied()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<char, ChannelState>> {
        self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update(&self, channel: char, state: ChannelState) {
        let previous = self.lock().insert(channel, state);
        if previous != Some(state) {
            info!("⚙️ Motor channel {} -> {:?}", channel, state);
        }
    }
}

impl MotorDriver for LoggingMotorDriver {
    fn activate(&self, channel: char) {
        self.update(channel, ChannelState::Active);
    }

    fn deactivate(&self, channel: char) {
        self.update(channel, ChannelState::Inactive);
    }

    fn start(&self, channel: char, speed: f64) {
        self.update(channel, ChannelState::Running(speed));
    }
}

/// Stepper stage that moves the electrode through a profile
///
/// Positions are in microsteps.
pub trait Positioner: Send {
    fn set_motion_limits(&mut self, max_speed: i64, max_acceleration: i64) -> Result<(), HardwareError>;
    fn move_to_position(&mut self, target: i64) -> Result<(), HardwareError>;
    fn get_current_position(&mut self) -> Result<i64, HardwareError>;
    fn halt_and_set_position(&mut self, position: i64) -> Result<(), HardwareError>;
    fn exit_safe_start(&mut self) -> Result<(), HardwareError>;
    fn enter_safe_start(&mut self) -> Result<(), HardwareError>;
    /// Whether the reverse limit switch is closed
    fn limit_switch_active(&mut self) -> Result<bool, HardwareError>;
}

/// Positioner for systems without a profiler stage
///
/// Tracks the commanded position and reports the limit switch as closed, so
/// homing completes immediately.
#[derive(Debug, Default)]
pub struct NullPositioner {
    position: i64,
}

impl NullPositioner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Positioner for NullPositioner {
    fn set_motion_limits(&mut self, max_speed: i64, max_acceleration: i64) -> Result<(), HardwareError> {
        debug!("No stage fitted: limits {} / {} ignored", max_speed, max_acceleration);
        Ok(())
    }

    fn move_to_position(&mut self, target: i64) -> Result<(), HardwareError> {
        debug!("No stage fitted: move to {}", target);
        self.position = target;
        Ok(())
    }

    fn get_current_position(&mut self) -> Result<i64, HardwareError> {
        Ok(self.position)
    }

    fn halt_and_set_position(&mut self, position: i64) -> Result<(), HardwareError> {
        self.position = position;
        Ok(())
    }

    fn exit_safe_start(&mut self) -> Result<(), HardwareError> {
        Ok(())
    }

    fn enter_safe_start(&mut self) -> Result<(), HardwareError> {
        Ok(())
    }

    fn limit_switch_active(&mut self) -> Result<bool, HardwareError> {
        Ok(true)
    }
}

/// Homing and step moves on top of a [`Positioner`]
pub struct Profiler {
    stage: Box<dyn Positioner>,
    steps_per_mm: f64,
    /// Bound on homing moves before giving up on the limit switch
    max_homing_moves: u32,
}

impl Profiler {
    pub fn new(stage: Box<dyn Positioner>, steps_per_mm: f64) -> Self {
        Self {
            stage,
            steps_per_mm,
            max_homing_moves: 10_000,
        }
    }

    /// Apply speed (mm/s) and acceleration (mm/s²) limits
    pub fn configure(&mut self, max_speed_mm_s: f64, max_acceleration_mm_s2: f64) -> Result<(), HardwareError> {
        let speed = (max_speed_mm_s * self.steps_per_mm * 10_000.0) as i64;
        let acceleration = (max_acceleration_mm_s2 * self.steps_per_mm * 100.0) as i64;
        self.stage.set_motion_limits(speed, acceleration)
    }

    /// Drive toward the reverse limit and call that position zero
    pub fn home(&mut self) -> Result<(), HardwareError> {
        info!("Homing profiler");
        self.stage.exit_safe_start()?;

        let step = self.steps_per_mm.round().max(1.0) as i64;
        let mut moves = 0;
        while !self.stage.limit_switch_active()? {
            if moves >= self.max_homing_moves {
                self.stage.enter_safe_start()?;
                return Err(HardwareError::Fault("reverse limit switch never closed".to_string()));
            }
            let position = self.stage.get_current_position()?;
            self.stage.move_to_position(position - step)?;
            moves += 1;
        }

        self.stage.halt_and_set_position(0)?;
        self.stage.enter_safe_start()?;
        Ok(())
    }

    /// Move by `distance_mm` relative to the current position
    pub fn move_step(&mut self, distance_mm: f64) -> Result<(), HardwareError> {
        info!("Moving profiler by {} mm", distance_mm);
        self.stage.exit_safe_start()?;
        let target = self.stage.get_current_position()? + (distance_mm * self.steps_per_mm) as i64;
        self.stage.move_to_position(target)?;
        self.stage.enter_safe_start()?;
        Ok(())
    }

    pub fn position_mm(&mut self) -> Result<f64, HardwareError> {
        Ok(self.stage.get_current_position()? as f64 / self.steps_per_mm)
    }

    /// Text shown in `profiler_position.children`
    pub fn position_label(&mut self) -> Result<String, HardwareError> {
        Ok(format_position(self.position_mm()?))
    }
}

/// `Profiler Position: 012.5 mm`
pub fn format_position(mm: f64) -> String {
    format!("Profiler Position: {:05.1} mm", mm)
}
