//! Training checkpoints.
//!
//! A [`TrainState`] is written as JSON next to a temporary file and renamed
//! into place, so a crash mid-write leaves the previous checkpoint intact.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sprout_core::{ModelTemplate, SproutError};
use sprout_net::Network;

use crate::proposer::verify_state;

/// Persisted progress of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainState {
    /// First epoch to run after restoring.
    pub epoch: usize,
    /// Template contents at save time.
    pub contents: Vec<Option<usize>>,
    /// Network parameters and null masks.
    pub network: Network,
}

fn checkpoint_error(message: impl Into<String>) -> SproutError {
    SproutError::Checkpoint {
        message: message.into(),
    }
}

impl TrainState {
    /// Writes the state to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Checkpoint`] on any I/O or encoding failure.
    pub fn save(&self, path: &Path) -> Result<(), SproutError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| checkpoint_error(format!("cannot create {}: {e}", dir.display())))?;
        }
        let json = serde_json::to_string(self)
            .map_err(|e| checkpoint_error(format!("cannot encode checkpoint: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| checkpoint_error(format!("cannot write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| checkpoint_error(format!("cannot move checkpoint to {}: {e}", path.display())))?;
        tracing::info!(path = %path.display(), epoch = self.epoch, "saved checkpoint");
        Ok(())
    }

    /// Reads a state written by [`TrainState::save`].
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Checkpoint`] if the file is missing or invalid.
    pub fn load(path: &Path) -> Result<Self, SproutError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| checkpoint_error(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| checkpoint_error(format!("invalid checkpoint {}: {e}", path.display())))
    }

    /// Applies the saved contents to `template` and returns the restored
    /// template and network.
    ///
    /// # Errors
    ///
    /// Returns [`SproutError::Checkpoint`] if the slot count or the output
    /// width changed since the checkpoint was written, or if the saved
    /// network does not match the saved contents.
    pub fn restore(&self, template: &ModelTemplate) -> Result<(ModelTemplate, Network), SproutError> {
        if self.contents.len() != template.num_layers() {
            return Err(checkpoint_error(format!(
                "checkpoint has {} slots, template {}",
                self.contents.len(),
                template.num_layers()
            )));
        }
        if self.contents.last().copied().flatten() != Some(template.output_size()) {
            return Err(checkpoint_error(format!(
                "output size changed: checkpoint {:?}, template {}",
                self.contents.last().copied().flatten(),
                template.output_size()
            )));
        }
        let mut restored = template.clone();
        for (i, &content) in self.contents.iter().enumerate() {
            restored
                .set_content(i, content)
                .map_err(|e| checkpoint_error(e.to_string()))?;
        }
        verify_state(&restored, &self.network).map_err(|e| checkpoint_error(e.to_string()))?;
        Ok((restored, self.network.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprout_core::Key;

    #[test]
    fn restore_rejects_changed_output() {
        let template = ModelTemplate::with_output(vec![4], vec![Some(2)], 2).unwrap();
        let state = TrainState {
            epoch: 3,
            contents: template.contents().to_vec(),
            network: Network::init(&template, 2, Key::new(0)).unwrap(),
        };
        let wider = ModelTemplate::with_output(vec![4], vec![Some(2)], 3).unwrap();
        assert!(matches!(state.restore(&wider), Err(SproutError::Checkpoint { .. })));
        let (t, _) = state.restore(&template).unwrap();
        assert_eq!(t, template);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = TrainState::load(Path::new("/nonexistent/sprout/ckpt.json")).unwrap_err();
        assert!(matches!(err, SproutError::Checkpoint { .. }));
    }
}
