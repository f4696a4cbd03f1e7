//! Parameter snapshots
//!
//! Trainable state is saved as a JSON snapshot: iteration number plus every
//! parameter's name and flat values. Loading tolerates a leading `module.`
//! prefix on stored names, so snapshots taken from a wrapped model restore
//! into an unwrapped one.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::Parameter;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotParam {
    pub name: String,
    pub values: Vec<f32>,
}

/// Serializable view of model parameters at one iteration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub iteration: usize,
    pub parameters: Vec<SnapshotParam>,
}

impl Snapshot {
    /// Capture every parameter
    pub fn capture(iteration: usize, params: &[Parameter]) -> Self {
        Self::capture_filtered(iteration, params, false)
    }

    /// Capture only the trainable parameters
    ///
    /// The frozen base model is reconstructible from its pretrained weights,
    /// so the default checkpoint carries only what training changed.
    pub fn capture_trainable(iteration: usize, params: &[Parameter]) -> Self {
        Self::capture_filtered(iteration, params, true)
    }

    fn capture_filtered(iteration: usize, params: &[Parameter], trainable_only: bool) -> Self {
        let parameters = params
            .iter()
            .filter(|p| !trainable_only || p.is_trainable())
            .map(|p| SnapshotParam {
                name: p.name().to_string(),
                values: p.value().to_vec(),
            })
            .collect();
        Self {
            iteration,
            parameters,
        }
    }

    /// Merge stored values into `params`, matching by name
    ///
    /// Snapshot entries with no counterpart in the live model are skipped, so
    /// a full snapshot restores into a model exposing only its trainable
    /// subset. A stored `module.` prefix (distributed wrappers) is ignored
    /// when matching. Length mismatches are a [`Error::Checkpoint`]. Returns
    /// the number of parameters restored.
    pub fn apply(&self, params: &mut [Parameter]) -> Result<usize> {
        let index: HashMap<String, usize> = params
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name().to_string(), i))
            .collect();

        let mut restored = 0;
        for sp in &self.parameters {
            let name = sp.name.strip_prefix("module.").unwrap_or(&sp.name);
            let Some(&i) = index.get(name) else {
                continue;
            };
            let p = &mut params[i];
            if sp.values.len() != p.len() {
                return Err(Error::Checkpoint(format!(
                    "parameter '{}' has {} values in snapshot, expected {}",
                    name,
                    sp.values.len(),
                    p.len()
                )));
            }
            p.value_mut()
                .iter_mut()
                .zip(&sp.values)
                .for_each(|(w, &v)| *w = v);
            restored += 1;
        }
        Ok(restored)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

/// Path of the numbered snapshot for one iteration
pub fn numbered_path(dir: &Path, iteration: usize) -> PathBuf {
    dir.join(format!("model_{iteration:07}.json"))
}

/// Path of the rolling latest snapshot
pub fn latest_path(dir: &Path) -> PathBuf {
    dir.join("model_latest.json")
}

/// Write both the numbered and the latest snapshot for this iteration
///
/// `save_all` captures frozen parameters too; the default is trainable-only.
pub fn save_checkpoint(
    dir: &Path,
    iteration: usize,
    params: &[Parameter],
    save_all: bool,
) -> Result<()> {
    let snap = if save_all {
        Snapshot::capture(iteration, params)
    } else {
        Snapshot::capture_trainable(iteration, params)
    };
    snap.save(&numbered_path(dir, iteration))?;
    snap.save(&latest_path(dir))?;
    Ok(())
}
