use crate::codec::DataType;
use crate::metadata::{Subset, Threads};
use crate::spatial::Bounds;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;

/// Flat or split thread specification: `"threads": 8` or
/// `"threads": {"work": 2, "clip": 6}`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThreadSpec {
    Total(usize),
    Split { work: usize, clip: usize },
}

impl ThreadSpec {
    pub fn resolve(self) -> Threads {
        match self {
            ThreadSpec::Total(total) => Threads::from_total(total),
            ThreadSpec::Split { work, clip } => Threads {
                work: work.max(1),
                clip: clip.max(1),
            },
        }
    }
}

/// Everything a build run accepts, deserializable from a JSON config file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub input: Vec<String>,
    pub output: String,
    pub tmp: Option<String>,
    /// Reader pipeline template; stage 0 is the reader.
    pub pipeline: Vec<Value>,
    /// Explicit cubic root bounds; computed from the inputs when absent.
    pub bounds: Option<Bounds>,
    pub scale: Option<[f64; 3]>,
    pub offset: Option<[f64; 3]>,
    pub srs: Option<String>,
    pub subset: Option<Subset>,
    pub threads: Option<ThreadSpec>,
    pub limit: u64,
    pub progress_interval: u64,
    pub force: bool,
    /// Gather full per-dimension statistics during analysis.
    pub deep: bool,
    pub span: u64,
    pub min_node_size: u64,
    pub max_node_size: u64,
    pub data_type: DataType,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            input: Vec::new(),
            output: String::new(),
            tmp: None,
            pipeline: Vec::new(),
            bounds: None,
            scale: None,
            offset: None,
            srs: None,
            subset: None,
            threads: None,
            limit: 0,
            progress_interval: 10,
            force: false,
            deep: false,
            span: 256,
            min_node_size: 4_096,
            max_node_size: 16_384,
            data_type: DataType::Binary,
        }
    }
}

impl BuildConfig {
    pub fn from_json(text: &str) -> io::Result<BuildConfig> {
        let config: BuildConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> io::Result<()> {
        if self.output.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no output path configured",
            ));
        }
        if !self.span.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("span must be a power of two, got {}", self.span),
            ));
        }
        if self.min_node_size == 0 || self.min_node_size > self.max_node_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "node sizes must satisfy 0 < min <= max, got {}..{}",
                    self.min_node_size, self.max_node_size
                ),
            ));
        }
        if let Some(subset) = &self.subset {
            subset.validate()?;
        }
        Ok(())
    }

    pub fn threads(&self) -> Threads {
        match self.threads {
            Some(spec) => spec.resolve(),
            None => Threads::from_total(
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = BuildConfig::default();
        assert_eq!(config.span, 256);
        assert_eq!(config.min_node_size, 4_096);
        assert_eq!(config.max_node_size, 16_384);
        assert_eq!(config.data_type, DataType::Binary);
        assert_eq!(config.limit, 0);
    }

    #[test]
    fn parses_flat_and_split_threads() {
        let flat: BuildConfig =
            serde_json::from_str(r#"{"output": "/out", "threads": 9}"#).unwrap();
        assert_eq!(flat.threads(), Threads { work: 3, clip: 6 });

        let split: BuildConfig =
            serde_json::from_str(r#"{"output": "/out", "threads": {"work": 2, "clip": 5}}"#)
                .unwrap();
        assert_eq!(split.threads(), Threads { work: 2, clip: 5 });
    }

    #[test]
    fn validation_catches_bad_settings() {
        let mut config = BuildConfig {
            output: "/out".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        config.span = 100;
        assert!(config.validate().is_err());
        config.span = 128;

        config.min_node_size = 0;
        assert!(config.validate().is_err());
        config.min_node_size = config.max_node_size + 1;
        assert!(config.validate().is_err());

        config.min_node_size = 64;
        config.subset = Some(Subset { id: 9, of: 4 });
        assert!(config.validate().is_err());
    }
}
