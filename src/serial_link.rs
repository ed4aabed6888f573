/// Serial link to the servo controller
///
/// At most one link is open per process. Every owner of a serial port in
/// this process (a live link, a provisioning job) holds a `PortClaim`, so
/// the same device can never be driven and flashed at the same time.

use log::{debug, info, warn};
use serialport::{DataBits, FlowControl, Parity, StopBits};
use std::collections::BTreeSet;
use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use crate::ports::PortId;

/// Baud rate the fixed firmware opens its serial port at.
pub const DEFAULT_BAUD: u32 = 9600;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Serial port {port} is unavailable: {reason}")]
    PortUnavailable { port: PortId, reason: String },
    #[error("A serial link is already open on {port}")]
    AlreadyOpen { port: PortId },
    #[error("Serial port {port} is in use by another owner")]
    PortBusy { port: PortId },
    #[error("Serial link is not open")]
    NotOpen,
    #[error("Serial write failed: {0}")]
    WriteFailed(#[source] std::io::Error),
}

/// Ports currently owned by someone in this process.
static CLAIMED_PORTS: Mutex<BTreeSet<PortId>> = Mutex::new(BTreeSet::new());

fn claimed_ports() -> MutexGuard<'static, BTreeSet<PortId>> {
    CLAIMED_PORTS.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Exclusive ownership of a serial port, released on drop.
#[derive(Debug)]
pub struct PortClaim {
    port: PortId,
}

impl PortClaim {
    pub fn acquire(port: &str) -> Result<Self, LinkError> {
        let mut claimed = claimed_ports();
        if !claimed.insert(port.to_string()) {
            return Err(LinkError::PortBusy { port: port.to_string() });
        }
        debug!(target: "serial_link", "Claimed {}", port);
        Ok(Self { port: port.to_string() })
    }

    pub fn port(&self) -> &str {
        &self.port
    }
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        claimed_ports().remove(&self.port);
        debug!(target: "serial_link", "Released {}", self.port);
    }
}

pub fn is_port_claimed(port: &str) -> bool {
    claimed_ports().contains(port)
}

/// Port of the one live link in this process, if any.
static ACTIVE_LINK: Mutex<Option<PortId>> = Mutex::new(None);

fn active_link() -> MutexGuard<'static, Option<PortId>> {
    ACTIVE_LINK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Port the process-wide live link is open on.
pub fn active_link_port() -> Option<PortId> {
    active_link().clone()
}

/// Holds the process-wide link slot until dropped.
#[derive(Debug)]
struct LinkSlot;

impl LinkSlot {
    fn acquire(port: &str) -> Result<Self, LinkError> {
        let mut active = active_link();
        if let Some(current) = active.as_ref() {
            return Err(LinkError::AlreadyOpen { port: current.clone() });
        }
        *active = Some(port.to_string());
        Ok(LinkSlot)
    }
}

impl Drop for LinkSlot {
    fn drop(&mut self) {
        *active_link() = None;
    }
}

pub struct SerialLink {
    port: Option<Box<dyn Write + Send>>,
    claim: Option<PortClaim>,
    slot: Option<LinkSlot>,
}

impl fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialLink")
            .field("port", &self.port_path())
            .field("open", &self.is_open())
            .finish()
    }
}

impl Default for SerialLink {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialLink {
    pub fn new() -> Self {
        Self { port: None, claim: None, slot: None }
    }

    /// Open `port` as 8N1 without flow control.
    pub fn open(&mut self, port: &str, baud: u32, read_timeout: Duration) -> Result<(), LinkError> {
        if let Some(current) = self.port_path() {
            return Err(LinkError::AlreadyOpen { port: current.to_string() });
        }
        let slot = LinkSlot::acquire(port)?;
        let claim = PortClaim::acquire(port)?;
        let handle = serialport::new(port, baud)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::None)
            .timeout(read_timeout)
            .open()
            .map_err(|e| LinkError::PortUnavailable {
                port: port.to_string(),
                reason: e.to_string(),
            })?;
        info!(target: "serial_link", "Connected to {} at {} baud", port, baud);
        self.port = Some(handle);
        self.claim = Some(claim);
        self.slot = Some(slot);
        Ok(())
    }

    /// Install an already-open writer as the link for `port`.
    pub fn attach(&mut self, port: &str, writer: Box<dyn Write + Send>) -> Result<(), LinkError> {
        if let Some(current) = self.port_path() {
            return Err(LinkError::AlreadyOpen { port: current.to_string() });
        }
        let slot = LinkSlot::acquire(port)?;
        let claim = PortClaim::acquire(port)?;
        info!(target: "serial_link", "Attached writer for {}", port);
        self.port = Some(writer);
        self.claim = Some(claim);
        self.slot = Some(slot);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    pub fn port_path(&self) -> Option<&str> {
        self.claim.as_ref().map(PortClaim::port)
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        let port = self.port.as_mut().ok_or(LinkError::NotOpen)?;
        port.write_all(bytes).map_err(LinkError::WriteFailed)?;
        port.flush().map_err(LinkError::WriteFailed)
    }

    /// Safe to call when already closed.
    pub fn close(&mut self) {
        if self.port.take().is_some() {
            if let Some(path) = self.port_path() {
                info!(target: "serial_link", "Closed {}", path);
            }
        }
        self.claim = None;
        self.slot = None;
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// In-memory port that records every byte written to it.
///
/// Used for dry runs and in tests. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryPort {
    written: Arc<Mutex<Vec<u8>>>,
    failing: Arc<Mutex<bool>>,
}

impl MemoryPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail with `BrokenPipe` until reset.
    pub fn fail_writes(&self, fail: bool) {
        *self.failing.lock().unwrap_or_else(|p| p.into_inner()) = fail;
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.written.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Written data split into newline-terminated frames, terminators removed.
    pub fn frames(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.bytes())
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn clear(&self) {
        self.written.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

impl Write for MemoryPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if *self.failing.lock().unwrap_or_else(|p| p.into_inner()) {
            warn!(target: "serial_link", "MemoryPort rejecting {} byte(s)", buf.len());
            return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "memory port write failure"));
        }
        self.written.lock().unwrap_or_else(|p| p.into_inner()).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Serializes unit tests that hold a link, since only one may be open per process.
#[cfg(test)]
pub(crate) fn link_test_guard() -> MutexGuard<'static, ()> {
    static LINK_TESTS: Mutex<()> = Mutex::new(());
    LINK_TESTS.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_requires_open_link() {
        let mut link = SerialLink::new();
        assert!(!link.is_open());
        assert!(matches!(link.write(b"1,90,50\n"), Err(LinkError::NotOpen)));
    }

    #[test]
    fn test_attach_write_and_close_is_idempotent() {
        let _serial = link_test_guard();
        let port = MemoryPort::new();
        let mut link = SerialLink::new();
        link.attach("mem-link-basic", Box::new(port.clone())).unwrap();
        assert!(link.is_open());
        assert!(is_port_claimed("mem-link-basic"));

        link.write(b"2,45,10\n").unwrap();
        assert_eq!(port.frames(), vec!["2,45,10".to_string()]);

        link.close();
        link.close();
        assert!(!link.is_open());
        assert!(!is_port_claimed("mem-link-basic"));
    }

    #[test]
    fn test_second_open_is_rejected() {
        let _serial = link_test_guard();
        let mut link = SerialLink::new();
        link.attach("mem-link-first", Box::new(MemoryPort::new())).unwrap();
        let err = link.attach("mem-link-second", Box::new(MemoryPort::new())).unwrap_err();
        assert!(matches!(err, LinkError::AlreadyOpen { ref port } if port == "mem-link-first"));
        // The rejected attempt must not leave a stale claim behind.
        assert!(!is_port_claimed("mem-link-second"));
    }

    #[test]
    fn test_port_claim_blocks_link() {
        let _serial = link_test_guard();
        let claim = PortClaim::acquire("mem-link-claimed").unwrap();
        let mut link = SerialLink::new();
        let err = link.attach("mem-link-claimed", Box::new(MemoryPort::new())).unwrap_err();
        assert!(matches!(err, LinkError::PortBusy { .. }));
        drop(claim);
        link.attach("mem-link-claimed", Box::new(MemoryPort::new())).unwrap();
    }

    #[test]
    fn test_write_failure_is_reported() {
        let _serial = link_test_guard();
        let port = MemoryPort::new();
        let mut link = SerialLink::new();
        link.attach("mem-link-failing", Box::new(port.clone())).unwrap();
        port.fail_writes(true);
        assert!(matches!(link.write(b"1,0,1\n"), Err(LinkError::WriteFailed(_))));
        assert!(link.is_open());
    }

    #[test]
    fn test_drop_releases_claim() {
        let _serial = link_test_guard();
        {
            let mut link = SerialLink::new();
            link.attach("mem-link-dropped", Box::new(MemoryPort::new())).unwrap();
        }
        assert!(!is_port_claimed("mem-link-dropped"));
    }

    #[test]
    fn test_open_missing_device_is_unavailable() {
        let _serial = link_test_guard();
        let mut link = SerialLink::new();
        let err = link
            .open("/dev/servodriver-does-not-exist", DEFAULT_BAUD, DEFAULT_READ_TIMEOUT)
            .unwrap_err();
        assert!(matches!(err, LinkError::PortUnavailable { .. }));
        assert!(!is_port_claimed("/dev/servodriver-does-not-exist"));
    }

    #[test]
    fn test_only_one_link_per_process() {
        let _serial = link_test_guard();
        let mut first = SerialLink::new();
        first.attach("mem-link-arm-a", Box::new(MemoryPort::new())).unwrap();
        assert_eq!(active_link_port().as_deref(), Some("mem-link-arm-a"));

        let mut second = SerialLink::new();
        let err = second.attach("mem-link-arm-b", Box::new(MemoryPort::new())).unwrap_err();
        assert!(matches!(err, LinkError::AlreadyOpen { ref port } if port == "mem-link-arm-a"));
        assert!(!second.is_open());
        assert!(!is_port_claimed("mem-link-arm-b"));

        first.close();
        assert_eq!(active_link_port(), None);
        second.attach("mem-link-arm-b", Box::new(MemoryPort::new())).unwrap();
        assert_eq!(active_link_port().as_deref(), Some("mem-link-arm-b"));
    }

    #[test]
    fn test_busy_port_does_not_hold_link_slot() {
        let _serial = link_test_guard();
        let claim = PortClaim::acquire("mem-link-flashing").unwrap();
        let mut link = SerialLink::new();
        assert!(matches!(
            link.attach("mem-link-flashing", Box::new(MemoryPort::new())),
            Err(LinkError::PortBusy { .. })
        ));
        assert_eq!(active_link_port(), None);
        drop(claim);
    }
}
