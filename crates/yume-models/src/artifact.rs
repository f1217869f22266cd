//! Loading and saving of pretrained model artifacts
//!
//! Artifacts are plain serde structs. The file extension picks the format:
//! `.ron` for human-editable text, anything else for bincode.
//! Every load runs the artifact's own shape validation before it is handed out.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{ModelError, ModelResult};

/// A persisted model that can check its own internal consistency
pub trait Artifact: Serialize + DeserializeOwned {
    /// Short name used in log and error messages
    const KIND: &'static str;

    /// Verify that every weight buffer matches the declared dimensions
    fn validate(&self) -> ModelResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Ron,
    Bincode,
}

fn format_for(path: &Path) -> Format {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("ron") => Format::Ron,
        _ => Format::Bincode,
    }
}

fn load_error(path: &Path, reason: impl Into<String>) -> ModelError {
    ModelError::ArtifactLoad {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Load and validate an artifact
pub fn load<T: Artifact>(path: impl AsRef<Path>) -> ModelResult<T> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(load_error(path, "file does not exist"));
    }

    let bytes = std::fs::read(path).map_err(|e| load_error(path, e.to_string()))?;
    let artifact: T = match format_for(path) {
        Format::Ron => {
            let text = std::str::from_utf8(&bytes).map_err(|e| load_error(path, e.to_string()))?;
            ron::from_str(text).map_err(|e| load_error(path, format!("invalid RON: {}", e)))?
        }
        Format::Bincode => {
            let (artifact, _): (T, _) =
                bincode_next::serde::decode_from_slice(&bytes, bincode_next::config::standard())
                    .map_err(|e| load_error(path, format!("invalid bincode: {:?}", e)))?;
            artifact
        }
    };

    artifact.validate().map_err(|e| load_error(path, e.to_string()))?;
    log::info!("Loaded {} artifact from {}", T::KIND, path.display());
    Ok(artifact)
}

/// Save an artifact atomically (temp file, then rename)
pub fn save<T: Artifact>(artifact: &T, path: impl AsRef<Path>) -> ModelResult<()> {
    let path = path.as_ref();
    artifact.validate()?;

    let bytes = match format_for(path) {
        Format::Ron => ron::ser::to_string_pretty(artifact, ron::ser::PrettyConfig::default())
            .map_err(|e| ModelError::Serialization(e.to_string()))?
            .into_bytes(),
        Format::Bincode => {
            bincode_next::serde::encode_to_vec(artifact, bincode_next::config::standard())
                .map_err(|e| ModelError::Serialization(format!("{:?}", e)))?
        }
    };

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let temp_path = temp_path_for(path);
    std::fs::write(&temp_path, bytes)?;
    std::fs::rename(&temp_path, path)?;

    log::debug!("Saved {} artifact to {}", T::KIND, path.display());
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Check a buffer length, naming the field on mismatch
pub(crate) fn expect_len(what: &str, buffer: &[f32], expected: usize) -> ModelResult<()> {
    if buffer.len() != expected {
        return Err(ModelError::dimension(what, expected, buffer.len()));
    }
    if buffer.iter().any(|v| !v.is_finite()) {
        return Err(ModelError::Inference {
            model: "artifact",
            reason: format!("{} contains non-finite weights", what),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perception::LinearEncoder;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(format_for(Path::new("vae.ron")), Format::Ron);
        assert_eq!(format_for(Path::new("vae.RON")), Format::Ron);
        assert_eq!(format_for(Path::new("vae.bin")), Format::Bincode);
        assert_eq!(format_for(Path::new("vae")), Format::Bincode);
    }

    #[test]
    fn test_missing_file_is_load_error() {
        let result = load::<LinearEncoder>("/definitely/not/here.ron");
        assert!(matches!(result, Err(ModelError::ArtifactLoad { .. })));
    }

    #[test]
    fn test_corrupt_file_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.bin");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();

        let result = load::<LinearEncoder>(&path);
        assert!(matches!(result, Err(ModelError::ArtifactLoad { .. })));
    }

    #[test]
    fn test_save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("vae.bin");
        save(&LinearEncoder::random(4, 2, 1), &path).unwrap();

        assert!(path.exists());
        assert!(!dir.path().join("nested").join("vae.bin.tmp").exists());
    }
}
