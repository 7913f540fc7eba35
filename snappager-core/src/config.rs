// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! YAML configuration parser with strict schema validation.
//!
//! Validates the page server configuration before any socket is bound.
//! Any invalid field results in a HardValidationError that prevents startup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::chunk::{validate_chunk_size, ChunkStore, DirChunkStore, MIN_CHUNK_SIZE};
use crate::error::{HardValidationError, PagerError, PagerResult};

/// Upper bound on working-set insertion workers.
pub const MAX_THREADS: usize = 1024;

/// Raw chunk store section as parsed from YAML (before validation).
#[derive(Debug, Clone, Deserialize)]
pub struct RawChunkStoreConfig {
    pub root: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
}

fn default_chunk_size() -> u64 {
    MIN_CHUNK_SIZE
}

/// Raw configuration as parsed from YAML or assembled from CLI flags.
#[derive(Debug, Clone, Deserialize)]
pub struct RawPagerConfig {
    pub socket_path: String,
    pub memory_file: String,
    #[serde(default)]
    pub trace_file: Option<String>,
    #[serde(default)]
    pub working_set_file: Option<String>,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default)]
    pub lazy: bool,
    #[serde(default)]
    pub chunk_store: Option<RawChunkStoreConfig>,
}

fn default_threads() -> usize {
    8
}

/// Validated chunk store configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkStoreConfig {
    pub root: PathBuf,
    pub chunk_size: u64,
}

/// Validated page server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagerConfig {
    pub socket_path: PathBuf,
    pub memory_file: PathBuf,
    pub trace_file: Option<PathBuf>,
    pub working_set_file: Option<PathBuf>,
    pub threads: usize,
    pub lazy: bool,
    pub chunk_store: Option<ChunkStoreConfig>,
}

impl PagerConfig {
    /// Open the configured chunk store. `None` outside lazy mode.
    pub fn open_chunk_store(&self) -> PagerResult<Option<Arc<dyn ChunkStore>>> {
        if !self.lazy {
            return Ok(None);
        }
        match &self.chunk_store {
            Some(store) => {
                let store = DirChunkStore::new(&store.root, store.chunk_size)?;
                Ok(Some(Arc::new(store)))
            }
            None => Err(HardValidationError::MissingRequiredField {
                field: "chunk_store",
                context: "lazy mode".to_string(),
            }
            .into()),
        }
    }
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    /// Returns HardValidationError for any invalid fields.
    pub fn load_file(path: impl AsRef<Path>) -> PagerResult<PagerConfig> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(PagerError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| PagerError::Io {
            context: "reading config file",
            source: e,
        })?;

        Self::load_string(&content)
    }

    /// Load and validate configuration from a YAML string.
    pub fn load_string(content: &str) -> PagerResult<PagerConfig> {
        let raw: RawPagerConfig =
            serde_yaml::from_str(content).map_err(|e| PagerError::ConfigParse {
                message: format!("YAML parse error: {}", e),
            })?;

        Self::validate(raw)
    }

    /// Validate raw configuration and convert to validated types.
    pub fn validate(raw: RawPagerConfig) -> PagerResult<PagerConfig> {
        let socket_path = required_path("socket_path", &raw.socket_path)?;
        let memory_file = required_path("memory_file", &raw.memory_file)?;
        let trace_file = optional_path("trace_file", raw.trace_file.as_deref())?;
        let working_set_file = optional_path("working_set_file", raw.working_set_file.as_deref())?;

        if raw.threads == 0 || raw.threads > MAX_THREADS {
            return Err(HardValidationError::InvalidFieldValue {
                field: "threads",
                value: raw.threads.to_string(),
                reason: format!("Must be between 1 and {}", MAX_THREADS),
            }
            .into());
        }

        let chunk_store = raw
            .chunk_store
            .map(Self::validate_chunk_store)
            .transpose()?;

        if raw.lazy && chunk_store.is_none() {
            return Err(HardValidationError::MissingRequiredField {
                field: "chunk_store",
                context: "lazy mode".to_string(),
            }
            .into());
        }

        Ok(PagerConfig {
            socket_path,
            memory_file,
            trace_file,
            working_set_file,
            threads: raw.threads,
            lazy: raw.lazy,
            chunk_store,
        })
    }

    fn validate_chunk_store(raw: RawChunkStoreConfig) -> PagerResult<ChunkStoreConfig> {
        let root = required_path("chunk_store.root", &raw.root)?;

        validate_chunk_size(raw.chunk_size).map_err(|e| HardValidationError::InvalidFieldValue {
            field: "chunk_store.chunk_size",
            value: raw.chunk_size.to_string(),
            reason: e.to_string(),
        })?;

        Ok(ChunkStoreConfig {
            root,
            chunk_size: raw.chunk_size,
        })
    }
}

fn required_path(field: &'static str, value: &str) -> Result<PathBuf, HardValidationError> {
    if value.trim().is_empty() {
        return Err(HardValidationError::InvalidFieldValue {
            field,
            value: value.to_string(),
            reason: "Path cannot be empty".to_string(),
        });
    }
    Ok(PathBuf::from(value))
}

fn optional_path(
    field: &'static str,
    value: Option<&str>,
) -> Result<Option<PathBuf>, HardValidationError> {
    value.map(|value| required_path(field, value)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_CONFIG: &str = r#"
socket_path: /run/vm1/uffd.sock
memory_file: /snapshots/vm1/mem
trace_file: /snapshots/vm1/trace.csv
working_set_file: /snapshots/vm1/ws.csv
threads: 16
"#;

    #[test]
    fn test_valid_config() {
        let config = ConfigLoader::load_string(VALID_CONFIG).unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/run/vm1/uffd.sock"));
        assert_eq!(config.threads, 16);
        assert_eq!(
            config.working_set_file,
            Some(PathBuf::from("/snapshots/vm1/ws.csv"))
        );
        assert!(!config.lazy);
        assert!(config.open_chunk_store().unwrap().is_none());
    }

    #[test]
    fn test_defaults_applied() {
        let yaml = r#"
socket_path: /run/uffd.sock
memory_file: /mem
"#;
        let config = ConfigLoader::load_string(yaml).unwrap();
        assert_eq!(config.threads, 8);
        assert!(!config.lazy);
        assert!(config.trace_file.is_none());
        assert!(config.chunk_store.is_none());
    }

    #[test]
    fn test_zero_threads_rejected() {
        let yaml = r#"
socket_path: /run/uffd.sock
memory_file: /mem
threads: 0
"#;
        let result = ConfigLoader::load_string(yaml);
        assert!(matches!(
            result,
            Err(PagerError::HardValidation(
                HardValidationError::InvalidFieldValue { field: "threads", .. }
            ))
        ));
    }

    #[test]
    fn test_empty_socket_path_rejected() {
        let yaml = r#"
socket_path: ""
memory_file: /mem
"#;
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_lazy_requires_chunk_store() {
        let yaml = r#"
socket_path: /run/uffd.sock
memory_file: /recipe
lazy: true
"#;
        let result = ConfigLoader::load_string(yaml);
        assert!(matches!(
            result,
            Err(PagerError::HardValidation(
                HardValidationError::MissingRequiredField { field: "chunk_store", .. }
            ))
        ));
    }

    #[test]
    fn test_lazy_with_chunk_store() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            "socket_path: /run/uffd.sock\nmemory_file: /recipe\nlazy: true\nchunk_store:\n  root: {}\n  chunk_size: 65536\n",
            dir.path().display()
        );
        let config = ConfigLoader::load_string(&yaml).unwrap();
        let store = config.open_chunk_store().unwrap().unwrap();
        assert_eq!(store.chunk_size(), 65536);
    }

    #[test]
    fn test_invalid_chunk_size() {
        let yaml = r#"
socket_path: /run/uffd.sock
memory_file: /recipe
lazy: true
chunk_store:
  root: /var/cache/chunks
  chunk_size: 5000
"#;
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigLoader::load_file("/nonexistent/snappager.yaml");
        assert!(matches!(result, Err(PagerError::ConfigNotFound { .. })));
    }

    #[test]
    fn test_malformed_yaml() {
        let result = ConfigLoader::load_string("socket_path: [unclosed");
        assert!(matches!(result, Err(PagerError::ConfigParse { .. })));
    }
}
