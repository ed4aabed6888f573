/// Joint model for the four-servo arm
///
/// Joint indices are 1-based on the wire and in the firmware switch
/// (1 = column, 2 = left shoulder, 3 = right shoulder, 4 = grip).

use serde::{Deserialize, Serialize};
use std::fmt;

pub const JOINT_COUNT: usize = 4;

pub const ANGLE_MIN: u8 = 0;
pub const ANGLE_MAX: u8 = 180;
pub const SPEED_MIN: u8 = 1;
pub const SPEED_MAX: u8 = 100;

pub const DEFAULT_ANGLE: u8 = 90;
pub const DEFAULT_SPEED: u8 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Joint {
    Column,
    LeftShoulder,
    RightShoulder,
    Grip,
}

impl Joint {
    pub const ALL: [Joint; JOINT_COUNT] = [
        Joint::Column,
        Joint::LeftShoulder,
        Joint::RightShoulder,
        Joint::Grip,
    ];

    /// Map a 1-based wire index to a joint.
    pub fn from_index(index: u8) -> Option<Joint> {
        match index {
            1 => Some(Joint::Column),
            2 => Some(Joint::LeftShoulder),
            3 => Some(Joint::RightShoulder),
            4 => Some(Joint::Grip),
            _ => None,
        }
    }

    /// 1-based index used on the wire.
    pub fn index(self) -> u8 {
        match self {
            Joint::Column => 1,
            Joint::LeftShoulder => 2,
            Joint::RightShoulder => 3,
            Joint::Grip => 4,
        }
    }

    /// Position in a `[_; JOINT_COUNT]` array.
    pub fn slot(self) -> usize {
        (self.index() - 1) as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            Joint::Column => "Column",
            Joint::LeftShoulder => "Left shoulder",
            Joint::RightShoulder => "Right shoulder",
            Joint::Grip => "Grip",
        }
    }

    /// Pin the fixed firmware attaches this joint's servo to.
    pub fn firmware_pin(self) -> u8 {
        self.index() + 3
    }
}

impl fmt::Display for Joint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label(), self.index())
    }
}

pub fn angle_in_range(angle: u8) -> bool {
    (ANGLE_MIN..=ANGLE_MAX).contains(&angle)
}

pub fn speed_in_range(speed: u8) -> bool {
    (SPEED_MIN..=SPEED_MAX).contains(&speed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JointState {
    pub angle: u8,
    pub speed: u8,
}

impl Default for JointState {
    fn default() -> Self {
        Self {
            angle: DEFAULT_ANGLE,
            speed: DEFAULT_SPEED,
        }
    }
}

/// Full pose of the arm, indexed by `Joint::slot`.
pub type Pose = [JointState; JOINT_COUNT];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_round_trip_and_labels() {
        for joint in Joint::ALL {
            assert_eq!(Joint::from_index(joint.index()), Some(joint));
        }
        assert_eq!(Joint::from_index(0), None);
        assert_eq!(Joint::from_index(5), None);
        assert_eq!(Joint::Grip.slot(), 3);
        assert_eq!(Joint::LeftShoulder.label(), "Left shoulder");
    }

    #[test]
    fn test_firmware_pins_are_four_to_seven() {
        let pins: Vec<u8> = Joint::ALL.iter().map(|j| j.firmware_pin()).collect();
        assert_eq!(pins, vec![4, 5, 6, 7]);
    }

    #[test]
    fn test_ranges() {
        assert!(angle_in_range(0));
        assert!(angle_in_range(180));
        assert!(!angle_in_range(181));
        assert!(!speed_in_range(0));
        assert!(speed_in_range(1));
        assert!(speed_in_range(100));
        assert!(!speed_in_range(101));
    }
}
