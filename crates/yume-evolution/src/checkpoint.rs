//! Best-controller checkpoints
//!
//! `best.ctrl` is the authoritative copy (bincode + lz4, written atomically);
//! `best.ron` is a human-readable summary written next to it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::controller::{Controller, ControllerLayout, ParameterVector};
use crate::error::{EvolutionError, Result};

pub const CHECKPOINT_VERSION: u32 = 1;

const CONTROLLER_FILE: &str = "best.ctrl";
const SUMMARY_FILE: &str = "best.ron";

/// Best-ever controller plus the progress of the run that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerCheckpoint {
    pub version: u32,
    pub env_name: String,
    pub layout: ControllerLayout,
    pub parameters: ParameterVector,
    pub best_fitness: f64,
    /// Generation in which the best controller was found
    pub best_generation: usize,
    /// Generations completed when the checkpoint was written
    pub generation: usize,
    /// RFC 3339 timestamp
    pub saved_at: String,
}

impl ControllerCheckpoint {
    pub fn new(
        env_name: impl Into<String>,
        layout: ControllerLayout,
        parameters: ParameterVector,
        best_fitness: f64,
        best_generation: usize,
        generation: usize,
    ) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            env_name: env_name.into(),
            layout,
            parameters,
            best_fitness,
            best_generation,
            generation,
            saved_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn controller(&self) -> Result<Controller> {
        Controller::new(self.layout, self.parameters.clone())
    }

    fn validate(&self, path: &Path) -> Result<()> {
        if self.version != CHECKPOINT_VERSION {
            return Err(EvolutionError::checkpoint(
                path,
                format!(
                    "unsupported version {} (expected {})",
                    self.version, CHECKPOINT_VERSION
                ),
            ));
        }
        self.layout
            .check_parameters(&self.parameters)
            .map_err(|e| EvolutionError::checkpoint(path, e))?;
        if !self.parameters.is_finite() || !self.best_fitness.is_finite() {
            return Err(EvolutionError::checkpoint(path, "contains non-finite values"));
        }
        Ok(())
    }
}

/// Summary written alongside the binary checkpoint
#[derive(Debug, Serialize)]
struct CheckpointSummary<'a> {
    env_name: &'a str,
    best_fitness: f64,
    best_generation: usize,
    generation: usize,
    parameter_count: usize,
    saved_at: &'a str,
}

pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| EvolutionError::checkpoint(&dir, format!("cannot create directory: {}", e)))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn controller_path(&self) -> PathBuf {
        self.dir.join(CONTROLLER_FILE)
    }

    /// Persist the checkpoint, replacing any previous one atomically
    pub fn save(&self, checkpoint: &ControllerCheckpoint) -> Result<()> {
        let path = self.controller_path();

        let serialized =
            bincode_next::serde::encode_to_vec(checkpoint, bincode_next::config::standard())
                .map_err(|e| EvolutionError::checkpoint(&path, format!("serialize: {:?}", e)))?;
        let compressed = lz4_flex::compress_prepend_size(&serialized);
        write_atomic(&path, &compressed)?;

        let summary = CheckpointSummary {
            env_name: &checkpoint.env_name,
            best_fitness: checkpoint.best_fitness,
            best_generation: checkpoint.best_generation,
            generation: checkpoint.generation,
            parameter_count: checkpoint.parameters.len(),
            saved_at: &checkpoint.saved_at,
        };
        let summary_path = self.dir.join(SUMMARY_FILE);
        let text = ron::ser::to_string_pretty(&summary, Default::default())
            .map_err(|e| EvolutionError::checkpoint(&summary_path, e))?;
        write_atomic(&summary_path, text.as_bytes())?;

        log::debug!(
            "Saved checkpoint to {:?} ({} bytes, best {:.3} from generation {})",
            path,
            compressed.len(),
            checkpoint.best_fitness,
            checkpoint.best_generation
        );
        Ok(())
    }

    /// Load and validate the stored checkpoint
    pub fn load(&self) -> Result<ControllerCheckpoint> {
        let path = self.controller_path();
        let compressed = std::fs::read(&path).map_err(|e| EvolutionError::checkpoint(&path, e))?;
        let serialized = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| EvolutionError::checkpoint(&path, format!("decompress: {}", e)))?;
        let (checkpoint, _): (ControllerCheckpoint, _) =
            bincode_next::serde::decode_from_slice(&serialized, bincode_next::config::standard())
                .map_err(|e| EvolutionError::checkpoint(&path, format!("deserialize: {:?}", e)))?;

        checkpoint.validate(&path)?;
        log::info!(
            "Loaded checkpoint {:?}: best {:.3} (generation {}), {} generations completed",
            path,
            checkpoint.best_fitness,
            checkpoint.best_generation,
            checkpoint.generation
        );
        Ok(checkpoint)
    }

    /// Like `load`, but `None` when no checkpoint has been written yet
    pub fn load_latest(&self) -> Result<Option<ControllerCheckpoint>> {
        if !self.controller_path().exists() {
            return Ok(None);
        }
        self.load().map(Some)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    let temp_path = path.with_file_name(name);
    std::fs::write(&temp_path, bytes).map_err(|e| EvolutionError::checkpoint(&temp_path, e))?;
    std::fs::rename(&temp_path, path).map_err(|e| EvolutionError::checkpoint(path, e))?;
    Ok(())
}
