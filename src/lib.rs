/// Servo Driver Library
///
/// Live joint control, recorded sequences and firmware provisioning for a
/// four-servo arm, shared by the GUI and CLI binaries.

pub mod config_loader;
pub mod dispatcher;
pub mod firmware;
pub mod joints;
pub mod player;
pub mod ports;
pub mod provisioning;
pub mod sequence;
pub mod serial_link;
pub mod toolchain;
