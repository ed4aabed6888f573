/// Serial port enumeration for the port selector.

use log::{debug, warn};

pub type PortId = String;

/// Shown in the selector when enumeration finds nothing.
pub const NO_PORTS_PLACEHOLDER: &str = "No ports available";

/// Enumerate OS-visible serial devices, sorted by name.
///
/// Never fails: an enumeration error is logged and reported as "no ports".
/// Nothing is cached, every call asks the OS again.
pub fn list_ports() -> Vec<PortId> {
    match serialport::available_ports() {
        Ok(infos) => {
            let mut ports: Vec<PortId> = infos.into_iter().map(|info| info.port_name).collect();
            ports.sort();
            ports.dedup();
            debug!(target: "ports", "Found {} serial port(s): {:?}", ports.len(), ports);
            ports
        }
        Err(e) => {
            warn!(target: "ports", "Serial port enumeration failed: {}", e);
            Vec::new()
        }
    }
}

/// Interpret the selector text, treating blank text and the placeholder as no selection.
pub fn selected_port(text: &str) -> Option<PortId> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == NO_PORTS_PLACEHOLDER {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selected_port_rejects_placeholder() {
        assert_eq!(selected_port(""), None);
        assert_eq!(selected_port("   "), None);
        assert_eq!(selected_port(NO_PORTS_PLACEHOLDER), None);
        assert_eq!(selected_port("/dev/ttyUSB0"), Some("/dev/ttyUSB0".to_string()));
        assert_eq!(selected_port(" COM3 "), Some("COM3".to_string()));
    }

    #[test]
    fn test_list_ports_never_panics() {
        let ports = list_ports();
        let mut sorted = ports.clone();
        sorted.sort();
        assert_eq!(ports, sorted);
    }
}
