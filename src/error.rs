use crate::ebpf::attach::AttachError;
use crate::ebpf::events::DecodeError;
use crate::ebpf::loader::LoadError;
use crate::ebpf::reader::{OpenError, ReadError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum XdpcapError {
    #[error("Failed to load eBPF object: {0}")]
    Load(#[from] LoadError),

    #[error("missing program {0}")]
    MissingProgram(String),

    #[error("missing map {0}")]
    MissingMap(String),

    #[error("Failed to attach XDP program: {0}")]
    Attach(#[from] AttachError),

    #[error("Failed to open event reader: {0}")]
    Open(#[from] OpenError),

    #[error("Failed to read event: {0}")]
    Read(#[from] ReadError),

    #[error("Malformed event: {0}")]
    Decode(#[from] DecodeError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, XdpcapError>;
