//! Stream packets captured by an XDP program to userspace.
//!
//! The [`pipeline::Pipeline`] loads a compiled eBPF object, attaches its
//! XDP program to an interface, and yields one [`PacketEvent`] per perf
//! sample the program emits.

pub mod cli;
pub mod config;
pub mod ebpf;
pub mod error;
pub mod pipeline;

pub use ebpf::events::PacketEvent;
pub use error::{Result, XdpcapError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
