pub mod commands;

use crate::config::Config;
use crate::ebpf::attach::AttachMode;
use crate::pipeline::DecodeErrorPolicy;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "xdpcap")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Stream packets captured by an XDP program to userspace", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, global = true, help = "YAML configuration file")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Attach the XDP program and print captured packets")]
    Capture(CaptureArgs),
    #[command(about = "Print the effective configuration")]
    ShowConfig(CaptureArgs),
}

#[derive(clap::Args, Debug, Default, Clone)]
pub struct CaptureArgs {
    #[arg(short, long, help = "Network interface to attach to")]
    pub interface: Option<String>,

    #[arg(short, long, help = "Compiled eBPF object file")]
    pub object: Option<PathBuf>,

    #[arg(long, help = "Program name inside the object")]
    pub program: Option<String>,

    #[arg(long, help = "Event map name inside the object")]
    pub map: Option<String>,

    #[arg(short, long, help = "Attach mode (auto, hw, drv, skb)")]
    pub mode: Option<AttachMode>,

    #[arg(long, help = "Per-CPU perf buffer size in bytes")]
    pub buffer_size: Option<usize>,

    #[arg(long, help = "Drop malformed samples instead of stopping")]
    pub skip_malformed: bool,

    #[arg(long, help = "Leave RLIMIT_MEMLOCK untouched")]
    pub keep_memlock: bool,

    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text, help = "Output format")]
    pub format: OutputFormat,
}

#[derive(ValueEnum, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl CaptureArgs {
    /// Apply the flags that were given on top of `config`.
    pub fn apply(&self, config: &mut Config) {
        if let Some(interface) = &self.interface {
            config.interface = interface.clone();
        }
        if let Some(object) = &self.object {
            config.object = object.clone();
        }
        if let Some(program) = &self.program {
            config.program = program.clone();
        }
        if let Some(map) = &self.map {
            config.map = map.clone();
        }
        if let Some(mode) = self.mode {
            config.attach_mode = mode;
        }
        if let Some(size) = self.buffer_size {
            config.buffer_size = Some(size);
        }
        if self.skip_malformed {
            config.decode_errors = DecodeErrorPolicy::Skip;
        }
        if self.keep_memlock {
            config.raise_memlock = false;
        }
    }
}
