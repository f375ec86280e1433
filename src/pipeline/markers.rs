//! Human-intervention marker files under `<workspace>/.convoy/intervention/`.
//!
//! - `skip-<stage>`: force the stage to `skipped`
//! - `human-message`: pause before the next stage until the file is removed
//! - `approve-<stage>`: let a manual-gated stage proceed (consumed on read)

use std::path::PathBuf;

use crate::env::Paths;
use crate::errors::StoreError;
use crate::util::{remove_if_exists, write_atomic};

pub const HUMAN_MESSAGE: &str = "human-message";

#[derive(Debug, Clone)]
pub struct Markers {
    dir: PathBuf,
}

impl Markers {
    pub fn new(paths: &Paths) -> Self {
        Self {
            dir: paths.intervention_dir(),
        }
    }

    pub fn skip_path(&self, stage: &str) -> PathBuf {
        self.dir.join(format!("skip-{}", stage))
    }

    pub fn approve_path(&self, stage: &str) -> PathBuf {
        self.dir.join(format!("approve-{}", stage))
    }

    pub fn human_message_path(&self) -> PathBuf {
        self.dir.join(HUMAN_MESSAGE)
    }

    pub fn skip_requested(&self, stage: &str) -> bool {
        self.skip_path(stage).exists()
    }

    /// Contents of the human-message marker, if present.
    pub fn human_message(&self) -> Option<String> {
        let path = self.human_message_path();
        if !path.exists() {
            return None;
        }
        Some(
            std::fs::read_to_string(&path)
                .map(|s| s.trim().to_string())
                .unwrap_or_default(),
        )
    }

    /// True once if an approval for `stage` exists; the marker is removed.
    pub fn take_approval(&self, stage: &str) -> Result<bool, StoreError> {
        remove_if_exists(&self.approve_path(stage))
    }

    pub fn request_skip(&self, stage: &str) -> Result<(), StoreError> {
        write_atomic(&self.skip_path(stage), b"")
    }

    pub fn approve(&self, stage: &str) -> Result<(), StoreError> {
        write_atomic(&self.approve_path(stage), b"")
    }

    pub fn post_message(&self, message: &str) -> Result<(), StoreError> {
        write_atomic(&self.human_message_path(), message.as_bytes())
    }

    pub fn clear_message(&self) -> Result<bool, StoreError> {
        remove_if_exists(&self.human_message_path())
    }
}
