use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use serde_yaml::{Mapping, Value};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dispatcher::{DispatcherSettings, QueueLimit, WireFormat, DEFAULT_TICK};
use crate::joints::JOINT_COUNT;
use crate::player::DEFAULT_AUTO_DELAY;
use crate::provisioning::{ProvisionSettings, BOARD_FQBN};
use crate::sequence::DEFAULT_SEQUENCE_FILE;
use crate::serial_link::{DEFAULT_BAUD, DEFAULT_READ_TIMEOUT};
use crate::toolchain::DEFAULT_CLI;

pub const CONFIG_FILE: &str = "servo_driver.yaml";

const OS_SECTIONS: [&str; 3] = ["RaspberryPi", "Ubuntu", "macOS"];

/// Keys older configs used for the board, core and library, which are now fixed.
const FIXED_BOARD_KEYS: [&str; 3] = ["BOARD_FQBN", "CORE_PACKAGE", "SERVO_LIBRARY"];

/// Everything the GUI and CLI need, resolved for one host.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub servo_port: Option<String>, // None means pick one in the UI
    pub baud: u32,
    pub read_timeout: Duration,
    pub tick_period: Duration,
    pub queue_limit: QueueLimit,
    pub wire_format: WireFormat,
    pub auto_delay: Duration,
    pub sequence_file: PathBuf,
    pub arduino_cli: PathBuf,
    pub provision: ProvisionSettings,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            servo_port: None,
            baud: DEFAULT_BAUD,
            read_timeout: DEFAULT_READ_TIMEOUT,
            tick_period: DEFAULT_TICK,
            queue_limit: QueueLimit::Unbounded,
            wire_format: WireFormat::AngleSpeed,
            auto_delay: DEFAULT_AUTO_DELAY,
            sequence_file: PathBuf::from(DEFAULT_SEQUENCE_FILE),
            arduino_cli: PathBuf::from(DEFAULT_CLI),
            provision: ProvisionSettings::default(),
        }
    }
}

impl DriverSettings {
    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            baud: self.baud,
            read_timeout: self.read_timeout,
            tick_period: self.tick_period,
            queue_limit: self.queue_limit,
            wire_format: self.wire_format,
        }
    }

    pub fn provision_settings(&self) -> ProvisionSettings {
        self.provision.clone()
    }
}

/// servo_driver.yaml next to Cargo.toml, unless SERVO_DRIVER_CONFIG points elsewhere.
pub fn config_path() -> PathBuf {
    env::var_os("SERVO_DRIVER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(CONFIG_FILE))
}

/// Load settings for `hostname`: DEFAULT block, then the host block, then the environment.
/// Fails loudly on a missing file or a malformed value.
pub fn load_driver_settings(hostname: &str) -> Result<DriverSettings> {
    let _ = dotenv();
    let path = config_path();
    let mut settings = load_driver_settings_from(&path, hostname)?;
    apply_env_overrides(&mut settings, |key| env::var(key).ok());
    log::info!(target: "config_loader", "DriverSettings for '{}': port={:?}, baud={}, tick={:?}, queue={:?}, cli={:?}",
               hostname, settings.servo_port, settings.baud, settings.tick_period, settings.queue_limit, settings.arduino_cli);
    Ok(settings)
}

pub fn load_driver_settings_from(path: &Path, hostname: &str) -> Result<DriverSettings> {
    let text = fs::read_to_string(path)
        .map_err(|e| anyhow!("Missing required {} at {:?}: {}", CONFIG_FILE, path, e))?;
    parse_driver_settings(&text, hostname).with_context(|| format!("Invalid settings in {:?}", path))
}

pub fn parse_driver_settings(text: &str, hostname: &str) -> Result<DriverSettings> {
    let yaml: Value = serde_yaml::from_str(text)?;
    let mut settings = DriverSettings::default();

    if let Some(defaults) = yaml.get("DEFAULT").and_then(|v| v.as_mapping()) {
        apply_block(&mut settings, defaults, "DEFAULT")?;
    }

    match host_block(&yaml, hostname) {
        Some(block) => apply_block(&mut settings, block, hostname)?,
        None => log::info!(target: "config_loader", "No host entry for '{}', using DEFAULT", hostname),
    }

    Ok(settings)
}

/// Search across known OS sections for a block matching hostname.
fn host_block<'a>(yaml: &'a Value, hostname: &str) -> Option<&'a Mapping> {
    OS_SECTIONS.iter().find_map(|os_key| {
        yaml.get(*os_key)
            .and_then(|v| v.as_mapping())
            .and_then(|os_map| os_map.get(&Value::from(hostname)))
            .and_then(|v| v.as_mapping())
    })
}

fn apply_block(settings: &mut DriverSettings, block: &Mapping, source: &str) -> Result<()> {
    if let Some(v) = block.get(&Value::from("SERVO_PORT")) {
        // An explicit null clears a port set in DEFAULT
        settings.servo_port = if v.is_null() { None } else { Some(str_value(v, "SERVO_PORT", source)?) };
    }
    if let Some(baud) = u64_key(block, "SERIAL_BAUD", source)? {
        settings.baud = u32::try_from(baud).map_err(|_| anyhow!("SERIAL_BAUD {} is too large for '{}'", baud, source))?;
    }
    if let Some(ms) = u64_key(block, "READ_TIMEOUT_MS", source)? {
        settings.read_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = u64_key(block, "TICK_MS", source)? {
        if ms == 0 {
            return Err(anyhow!("TICK_MS must be at least 1 for '{}'", source));
        }
        settings.tick_period = Duration::from_millis(ms);
    }
    if let Some(limit) = u64_key(block, "QUEUE_LIMIT", source)? {
        // A bound below one full pose would drop frames of the pose being sent
        if (1..JOINT_COUNT as u64).contains(&limit) {
            return Err(anyhow!(
                "QUEUE_LIMIT must be 0 (unbounded) or at least {} for '{}', got {}",
                JOINT_COUNT,
                source,
                limit
            ));
        }
        let limit = usize::try_from(limit).map_err(|_| anyhow!("QUEUE_LIMIT {} is too large for '{}'", limit, source))?;
        settings.queue_limit = QueueLimit::from_config(limit);
    }
    if let Some(name) = str_key(block, "WIRE_FORMAT", source)? {
        settings.wire_format = WireFormat::from_name(&name)
            .ok_or_else(|| anyhow!("WIRE_FORMAT must be angle_speed or angle_only for '{}', got {:?}", source, name))?;
    }
    if let Some(ms) = u64_key(block, "AUTO_DELAY_MS", source)? {
        settings.auto_delay = Duration::from_millis(ms);
    }
    if let Some(path) = str_key(block, "SEQUENCE_FILE", source)? {
        settings.sequence_file = PathBuf::from(path);
    }
    if let Some(cli) = str_key(block, "ARDUINO_CLI", source)? {
        settings.arduino_cli = PathBuf::from(cli);
    }
    for key in FIXED_BOARD_KEYS {
        if block.contains_key(&Value::from(key)) {
            return Err(anyhow!(
                "{} is not configurable ('{}'): firmware is always built for {}",
                key,
                source,
                BOARD_FQBN
            ));
        }
    }
    if let Some(secs) = u64_key(block, "UPLOAD_TIMEOUT_SECS", source)? {
        settings.provision.upload_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = u64_key(block, "TOOL_TIMEOUT_SECS", source)? {
        settings.provision.tool_timeout = Duration::from_secs(secs);
    }
    Ok(())
}

fn u64_key(block: &Mapping, key: &str, source: &str) -> Result<Option<u64>> {
    match block.get(&Value::from(key)) {
        None => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a non-negative integer for '{}', got {:?}", key, source, v)),
    }
}

fn str_key(block: &Mapping, key: &str, source: &str) -> Result<Option<String>> {
    block.get(&Value::from(key)).map(|v| str_value(v, key, source)).transpose()
}

fn str_value(v: &Value, key: &str, source: &str) -> Result<String> {
    v.as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("{} must be a string for '{}', got {:?}", key, source, v))
}

/// SERVO_PORT and ARDUINO_CLI from the environment (or .env) win over the YAML.
pub fn apply_env_overrides<F>(settings: &mut DriverSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(port) = lookup("SERVO_PORT").filter(|p| !p.trim().is_empty()) {
        log::info!(target: "config_loader", "SERVO_PORT overridden from environment: {}", port);
        settings.servo_port = Some(port);
    }
    if let Some(cli) = lookup("ARDUINO_CLI").filter(|c| !c.trim().is_empty()) {
        log::info!(target: "config_loader", "ARDUINO_CLI overridden from environment: {}", cli);
        settings.arduino_cli = PathBuf::from(cli);
    }
}
