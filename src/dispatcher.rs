/// Command dispatcher
///
/// Joint updates are framed as text lines and queued FIFO; `tick()` writes at
/// most one frame to the serial link. The controller has no acknowledgement
/// protocol, so the tick cadence is the only flow control it gets.
///
/// The queue is unbounded by default. The tick period (milliseconds) is far
/// shorter than the interval between slider events a person can produce, so
/// the queue grows during a burst and drains right after. `QueueLimit::DropOldest`
/// caps it for hosts that cannot tolerate that.

use log::{debug, info, warn};
use std::collections::VecDeque;
use std::io::Write;
use std::time::Duration;
use thiserror::Error;

use crate::joints::{angle_in_range, speed_in_range, Joint, JointState, Pose, ANGLE_MAX, ANGLE_MIN, SPEED_MAX, SPEED_MIN};
use crate::serial_link::{LinkError, SerialLink, DEFAULT_BAUD, DEFAULT_READ_TIMEOUT};

pub const DEFAULT_TICK: Duration = Duration::from_millis(5);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Not connected: open a serial port before moving joints")]
    LinkNotReady,
    #[error("Joint index {0} is outside 1..=4")]
    InvalidJoint(u8),
    #[error("Angle {0} is outside {min}..={max}", min = ANGLE_MIN, max = ANGLE_MAX)]
    AngleOutOfRange(u8),
    #[error("Speed {0} is outside {min}..={max}", min = SPEED_MIN, max = SPEED_MAX)]
    SpeedOutOfRange(u8),
}

/// How a command is rendered on the wire.
///
/// The fixed firmware reads the joint up to the first comma and parses the
/// rest with `toInt()`, which stops at the next comma. A trailing speed field
/// is therefore accepted and ignored by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// `"<joint>,<angle>,<speed>\n"`
    #[default]
    AngleSpeed,
    /// `"<joint>,<angle>\n"`
    AngleOnly,
}

impl WireFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "angle_speed" => Some(WireFormat::AngleSpeed),
            "angle_only" => Some(WireFormat::AngleOnly),
            _ => None,
        }
    }

    pub fn frame(self, command: &PendingCommand) -> String {
        match self {
            WireFormat::AngleSpeed => format!("{},{},{}\n", command.joint.index(), command.angle, command.speed),
            WireFormat::AngleOnly => format!("{},{}\n", command.joint.index(), command.angle),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueLimit {
    #[default]
    Unbounded,
    /// Keep at most this many commands, discarding the oldest on overflow.
    DropOldest(usize),
}

impl QueueLimit {
    /// `0` means unbounded.
    pub fn from_config(limit: usize) -> Self {
        if limit == 0 {
            QueueLimit::Unbounded
        } else {
            QueueLimit::DropOldest(limit)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub joint: Joint,
    pub angle: u8,
    pub speed: u8,
    /// Creation order, strictly increasing per dispatcher.
    pub seq: u64,
}

#[derive(Debug)]
pub enum TickOutcome {
    Idle,
    Sent(PendingCommand),
    /// The frame was dropped; the queue has already moved on.
    Failed { command: PendingCommand, error: LinkError },
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub baud: u32,
    pub read_timeout: Duration,
    pub tick_period: Duration,
    pub queue_limit: QueueLimit,
    pub wire_format: WireFormat,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            baud: DEFAULT_BAUD,
            read_timeout: DEFAULT_READ_TIMEOUT,
            tick_period: DEFAULT_TICK,
            queue_limit: QueueLimit::Unbounded,
            wire_format: WireFormat::AngleSpeed,
        }
    }
}

#[derive(Debug)]
pub struct CommandDispatcher {
    link: SerialLink,
    queue: VecDeque<PendingCommand>,
    joints: Pose,
    next_seq: u64,
    dropped: u64,
    settings: DispatcherSettings,
}

impl CommandDispatcher {
    pub fn new(settings: DispatcherSettings) -> Self {
        Self {
            link: SerialLink::new(),
            queue: VecDeque::new(),
            joints: [JointState::default(); 4],
            next_seq: 0,
            dropped: 0,
            settings,
        }
    }

    pub fn connect(&mut self, port: &str) -> Result<(), LinkError> {
        self.link.open(port, self.settings.baud, self.settings.read_timeout)
    }

    pub fn attach(&mut self, port: &str, writer: Box<dyn Write + Send>) -> Result<(), LinkError> {
        self.link.attach(port, writer)
    }

    /// Close the link and discard anything still queued. Returns the discard count.
    pub fn disconnect(&mut self) -> usize {
        let discarded = self.queue.len();
        self.queue.clear();
        self.link.close();
        if discarded > 0 {
            warn!(target: "dispatcher", "Disconnected with {} pending command(s) discarded", discarded);
        }
        discarded
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_open()
    }

    pub fn port(&self) -> Option<&str> {
        self.link.port_path()
    }

    /// Validate and queue one joint update. Nothing is queued unless the link is open.
    pub fn request_update(&mut self, joint: u8, angle: u8, speed: u8) -> Result<(), DispatchError> {
        let joint = Joint::from_index(joint).ok_or(DispatchError::InvalidJoint(joint))?;
        self.request_joint(joint, angle, speed)
    }

    pub fn request_joint(&mut self, joint: Joint, angle: u8, speed: u8) -> Result<(), DispatchError> {
        if !angle_in_range(angle) {
            return Err(DispatchError::AngleOutOfRange(angle));
        }
        if !speed_in_range(speed) {
            return Err(DispatchError::SpeedOutOfRange(speed));
        }
        if !self.link.is_open() {
            return Err(DispatchError::LinkNotReady);
        }

        if let QueueLimit::DropOldest(limit) = self.settings.queue_limit {
            while self.queue.len() >= limit.max(1) {
                if let Some(stale) = self.queue.pop_front() {
                    self.dropped += 1;
                    debug!(target: "dispatcher", "Queue full ({}), dropped #{} for {}", limit, stale.seq, stale.joint);
                }
            }
        }

        self.joints[joint.slot()] = JointState { angle, speed };
        let command = PendingCommand { joint, angle, speed, seq: self.next_seq };
        self.next_seq += 1;
        self.queue.push_back(command);
        Ok(())
    }

    /// Write at most one queued frame to the link.
    pub fn tick(&mut self) -> TickOutcome {
        if !self.link.is_open() {
            return TickOutcome::Idle;
        }
        let Some(command) = self.queue.pop_front() else {
            return TickOutcome::Idle;
        };
        let frame = self.settings.wire_format.frame(&command);
        match self.link.write(frame.as_bytes()) {
            Ok(()) => {
                debug!(target: "dispatcher", "→ {}", frame.trim_end());
                TickOutcome::Sent(command)
            }
            Err(error) => {
                warn!(target: "dispatcher", "Failed to send #{} ({}): {}", command.seq, frame.trim_end(), error);
                TickOutcome::Failed { command, error }
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Commands discarded by the queue limit since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Last accepted state of every joint.
    pub fn joints(&self) -> Pose {
        self.joints
    }

    pub fn joint(&self, joint: Joint) -> JointState {
        self.joints[joint.slot()]
    }

    pub fn tick_period(&self) -> Duration {
        self.settings.tick_period
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        if self.link.is_open() {
            info!(target: "dispatcher", "Shutting down with {} pending command(s)", self.queue.len());
        }
    }
}
