/// Recorded pose sequences ("commands") and their JSON file.
///
/// File format is a flat list of records:
/// `[{"angles":[90,90,90,90],"speeds":[50,50,50,50]}, ...]`

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::joints::{angle_in_range, speed_in_range, Joint, JointState, Pose, JOINT_COUNT};

pub const DEFAULT_SEQUENCE_FILE: &str = "media/commands/commands.json";

#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("Failed to access sequence file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Sequence file {path:?} is not a valid command list: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Command {number} in {path:?} has an out-of-range angle or speed")]
    InvalidEntry { path: PathBuf, number: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceEntry {
    pub angles: [u8; JOINT_COUNT],
    pub speeds: [u8; JOINT_COUNT],
}

impl SequenceEntry {
    pub fn from_pose(pose: &Pose) -> Self {
        Self {
            angles: pose.map(|state| state.angle),
            speeds: pose.map(|state| state.speed),
        }
    }

    pub fn state(&self, joint: Joint) -> JointState {
        JointState {
            angle: self.angles[joint.slot()],
            speed: self.speeds[joint.slot()],
        }
    }

    fn is_valid(&self) -> bool {
        self.angles.iter().all(|&a| angle_in_range(a)) && self.speeds.iter().all(|&s| speed_in_range(s))
    }
}

impl fmt::Display for SequenceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "angles {:?} speeds {:?}", self.angles, self.speeds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Loaded(usize),
    /// No file at the path; the store starts empty.
    FileNotFound,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceStore {
    entries: Vec<SequenceEntry>,
}

impl SequenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<SequenceEntry>) -> Self {
        Self { entries }
    }

    /// Record a snapshot of all joints. Returns the new entry's index.
    pub fn append(&mut self, pose: &Pose) -> usize {
        self.entries.push(SequenceEntry::from_pose(pose));
        self.entries.len() - 1
    }

    /// Remove entry `index`, shifting later entries down. Out of range is a no-op.
    pub fn delete(&mut self, index: usize) -> Option<SequenceEntry> {
        if index < self.entries.len() {
            Some(self.entries.remove(index))
        } else {
            None
        }
    }

    pub fn get(&self, index: usize) -> Option<&SequenceEntry> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SequenceEntry> {
        self.entries.iter()
    }

    pub fn entries(&self) -> &[SequenceEntry] {
        &self.entries
    }

    /// List label for entry `index`, numbered from 1.
    pub fn label(&self, index: usize) -> Option<String> {
        self.get(index).map(|entry| format!("Command {}: {}", index + 1, entry))
    }

    /// Write the whole list, replacing any existing file.
    pub fn save(&self, path: &Path) -> Result<(), SequenceError> {
        let io_err = |source| SequenceError::Io { path: path.to_path_buf(), source };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string(&self.entries)
            .map_err(|source| SequenceError::Parse { path: path.to_path_buf(), source })?;
        fs::write(path, json).map_err(io_err)?;
        info!(target: "sequence", "Saved {} command(s) to {:?}", self.entries.len(), path);
        Ok(())
    }

    /// Read a command list. A missing file is not an error: it yields an empty store.
    pub fn load(path: &Path) -> Result<(Self, LoadStatus), SequenceError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(target: "sequence", "No command file at {:?}, starting empty", path);
                return Ok((Self::new(), LoadStatus::FileNotFound));
            }
            Err(source) => return Err(SequenceError::Io { path: path.to_path_buf(), source }),
        };
        let entries: Vec<SequenceEntry> = serde_json::from_str(&text)
            .map_err(|source| SequenceError::Parse { path: path.to_path_buf(), source })?;
        if let Some(bad) = entries.iter().position(|entry| !entry.is_valid()) {
            return Err(SequenceError::InvalidEntry { path: path.to_path_buf(), number: bad + 1 });
        }
        info!(target: "sequence", "Loaded {} command(s) from {:?}", entries.len(), path);
        let count = entries.len();
        Ok((Self { entries }, LoadStatus::Loaded(count)))
    }
}
