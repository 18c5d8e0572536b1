//! Capture configuration, loaded from YAML and overridden by CLI flags

use crate::ebpf::attach::{validate_precedence, AttachMode};
use crate::pipeline::{DecodeErrorPolicy, PipelineSettings};
use crate::{Result, XdpcapError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;
use xdpcap_common::names;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Compiled eBPF object holding the program and the event map
    pub object: PathBuf,
    pub program: String,
    pub map: String,
    pub interface: String,
    pub attach_mode: AttachMode,
    /// Modes tried, in order, when `attach_mode` is `auto`
    pub auto_precedence: Vec<AttachMode>,
    /// Per-CPU perf buffer size in bytes (defaults to the page size)
    pub buffer_size: Option<usize>,
    pub decode_errors: DecodeErrorPolicy,
    /// Lift RLIMIT_MEMLOCK before loading, needed on kernels before 5.11
    pub raise_memlock: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            object: PathBuf::from("elfs/send.o"),
            program: names::PROGRAM.to_string(),
            map: names::MAP.to_string(),
            interface: "eth0".to_string(),
            attach_mode: AttachMode::Generic,
            auto_precedence: AttachMode::DEFAULT_PRECEDENCE.to_vec(),
            buffer_size: None,
            decode_errors: DecodeErrorPolicy::Fatal,
            raise_memlock: true,
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Reading config file {}", path.display());

        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| XdpcapError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.program.is_empty() {
            return Err(XdpcapError::Config("program name is empty".to_string()));
        }
        if self.map.is_empty() {
            return Err(XdpcapError::Config("map name is empty".to_string()));
        }
        if self.interface.is_empty() {
            return Err(XdpcapError::Config("interface name is empty".to_string()));
        }
        if self.buffer_size == Some(0) {
            return Err(XdpcapError::Config("buffer_size must be positive".to_string()));
        }
        validate_precedence(&self.auto_precedence)
            .map_err(|e| XdpcapError::Config(e.to_string()))?;
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| XdpcapError::Config(e.to_string()))
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            program: self.program.clone(),
            map: self.map.clone(),
            interface: self.interface.clone(),
            attach_mode: self.attach_mode,
            buffer_size: self.buffer_size,
            decode_errors: self.decode_errors,
        }
    }
}
