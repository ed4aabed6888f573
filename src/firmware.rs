/// Fixed four-servo controller sketch.
///
/// The sketch reads `"<servo>,<angle>..."` lines at 9600 baud and writes the
/// angle to the servo on pins 4-7. Anything after the angle (the speed field)
/// is ignored by `toInt()`.

use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SKETCH_EXTENSION: &str = ".ino";

pub const FIRMWARE_TEMPLATE: &str = r#"#include <Servo.h>

Servo column;
Servo left_shoulder;
Servo right_shoulder;
Servo grip;

void setup() {
  Serial.begin(9600);
  column.attach(4);
  left_shoulder.attach(5);
  right_shoulder.attach(6);
  grip.attach(7);
}

void loop() {
  if (Serial.available() > 0) {
    String input = Serial.readStringUntil('\n');
    int commaIndex = input.indexOf(',');
    if (commaIndex > 0) {
      int servoNum = input.substring(0, commaIndex).toInt();
      int angle = input.substring(commaIndex + 1).toInt();

      switch (servoNum) {
        case 1:
          column.write(angle);
          break;
        case 2:
          left_shoulder.write(angle);
          break;
        case 3:
          right_shoulder.write(angle);
          break;
        case 4:
          grip.write(angle);
          break;
      }
    }
  }
}
"#;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SketchError {
    /// Name does not end in `.ino` or has nothing before the extension.
    #[error("Invalid sketch file name: {0}")]
    InvalidFileName(String),
    #[error("Failed to write sketch: {0}")]
    Io(String),
}

/// The toolchain expects a sketch to be named after its folder: `<dir>/<dir name>.ino`.
pub fn sketch_file_name(dir: &Path) -> Option<String> {
    dir.file_name()
        .map(|name| format!("{}{}", name.to_string_lossy(), SKETCH_EXTENSION))
}

pub fn validate_sketch_name(file_name: &str) -> Result<(), SketchError> {
    match file_name.strip_suffix(SKETCH_EXTENSION) {
        Some(stem) if !stem.is_empty() && !stem.contains(['/', '\\']) => Ok(()),
        _ => Err(SketchError::InvalidFileName(file_name.to_string())),
    }
}

/// Write the firmware template to `dir/file_name` and return its absolute path.
pub fn write_sketch(dir: &Path, file_name: &str) -> Result<PathBuf, SketchError> {
    validate_sketch_name(file_name)?;
    let path = dir.join(file_name);
    fs::write(&path, FIRMWARE_TEMPLATE).map_err(|e| SketchError::Io(format!("{}: {}", path.display(), e)))?;
    let path = fs::canonicalize(&path).unwrap_or(path);
    info!(target: "provisioning", "Wrote sketch {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::joints::Joint;
    use tempfile::tempdir;

    #[test]
    fn test_sketch_named_after_directory() {
        assert_eq!(sketch_file_name(Path::new("/home/op/arm_rig")), Some("arm_rig.ino".to_string()));
        assert_eq!(sketch_file_name(Path::new("/")), None);
    }

    #[test]
    fn test_validate_sketch_name() {
        assert!(validate_sketch_name("arm.ino").is_ok());
        assert_eq!(validate_sketch_name("arm.cpp"), Err(SketchError::InvalidFileName("arm.cpp".into())));
        assert_eq!(validate_sketch_name(".ino"), Err(SketchError::InvalidFileName(".ino".into())));
        assert!(validate_sketch_name("../arm.ino").is_err());
    }

    #[test]
    fn test_sketch_error_messages() {
        let err = validate_sketch_name("arm.cpp").unwrap_err();
        assert_eq!(err.to_string(), "Invalid sketch file name: arm.cpp");
        let boxed: Box<dyn std::error::Error> = Box::new(SketchError::Io("disk full".into()));
        assert_eq!(boxed.to_string(), "Failed to write sketch: disk full");
    }

    #[test]
    fn test_write_sketch_contents() {
        let dir = tempdir().unwrap();
        let path = write_sketch(dir.path(), "rig.ino").unwrap();
        assert!(path.is_absolute());
        assert_eq!(fs::read_to_string(&path).unwrap(), FIRMWARE_TEMPLATE);
        assert!(write_sketch(dir.path(), "rig.txt").is_err());
        assert!(!dir.path().join("rig.txt").exists());
    }

    #[test]
    fn test_template_matches_joint_pinout() {
        for joint in Joint::ALL {
            assert!(FIRMWARE_TEMPLATE.contains(&format!(".attach({});", joint.firmware_pin())));
            assert!(FIRMWARE_TEMPLATE.contains(&format!("case {}:", joint.index())));
        }
        assert!(FIRMWARE_TEMPLATE.contains("Serial.begin(9600);"));
    }
}
