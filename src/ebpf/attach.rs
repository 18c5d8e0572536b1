//! Binding XDP programs to network interfaces

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttachError {
    #[error("interface {0} not found")]
    InterfaceNotFound(String),

    #[error("program {0} is not a loaded XDP program")]
    NotXdp(String),

    #[error("kernel rejected {mode} attachment on {interface}: {reason}")]
    Rejected {
        interface: String,
        mode: AttachMode,
        reason: String,
    },

    #[error("no program attached to {0}")]
    NotAttached(String),

    #[error("invalid attach mode precedence: {0}")]
    InvalidPrecedence(String),
}

/// How the program is hooked into the interface's receive path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttachMode {
    /// Try each mode of the configured precedence list in turn
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "hw", alias = "offload")]
    HardwareOffload,
    #[serde(rename = "drv", alias = "native")]
    DriverNative,
    /// Kernel-generic (SKB) mode. Works on any interface.
    #[serde(rename = "skb", alias = "generic")]
    Generic,
}

impl AttachMode {
    pub const DEFAULT_PRECEDENCE: [AttachMode; 3] = [
        AttachMode::HardwareOffload,
        AttachMode::DriverNative,
        AttachMode::Generic,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            AttachMode::Auto => "auto",
            AttachMode::HardwareOffload => "hw",
            AttachMode::DriverNative => "drv",
            AttachMode::Generic => "skb",
        }
    }

    /// Concrete modes to try, in order, for this request
    pub fn candidates(self, precedence: &[AttachMode]) -> Vec<AttachMode> {
        match self {
            AttachMode::Auto => precedence.to_vec(),
            mode => vec![mode],
        }
    }
}

impl Default for AttachMode {
    fn default() -> Self {
        AttachMode::Generic
    }
}

impl fmt::Display for AttachMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AttachMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(AttachMode::Auto),
            "hw" | "offload" => Ok(AttachMode::HardwareOffload),
            "drv" | "native" => Ok(AttachMode::DriverNative),
            "skb" | "generic" => Ok(AttachMode::Generic),
            other => Err(format!(
                "unknown attach mode '{}' (expected auto, hw, drv or skb)",
                other
            )),
        }
    }
}

/// Check an `Auto` precedence list: non-empty, concrete modes only, no repeats.
pub fn validate_precedence(precedence: &[AttachMode]) -> Result<(), AttachError> {
    if precedence.is_empty() {
        return Err(AttachError::InvalidPrecedence("list is empty".to_string()));
    }
    for (i, mode) in precedence.iter().enumerate() {
        if *mode == AttachMode::Auto {
            return Err(AttachError::InvalidPrecedence(
                "auto cannot appear in its own precedence list".to_string(),
            ));
        }
        if precedence[..i].contains(mode) {
            return Err(AttachError::InvalidPrecedence(format!("{} listed twice", mode)));
        }
    }
    Ok(())
}

/// Attachment of a program to one interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentState {
    Unattached,
    Attached(AttachMode),
}

#[cfg(target_os = "linux")]
pub use kernel::{resolve_interface, XdpAttacher};

#[cfg(target_os = "linux")]
mod kernel {
    use super::{validate_precedence, AttachError, AttachMode, AttachmentState};
    use crate::ebpf::loader::AyaProgram;
    use crate::ebpf::InterfaceAttacher;
    use aya::programs::xdp::XdpLinkId;
    use aya::programs::XdpFlags;
    use std::collections::HashMap;
    use std::ffi::CString;
    use tracing::{debug, info, warn};

    /// Resolve an interface name to its index
    pub fn resolve_interface(name: &str) -> Result<u32, AttachError> {
        let c_name =
            CString::new(name).map_err(|_| AttachError::InterfaceNotFound(name.to_string()))?;
        // SAFETY: c_name is a valid NUL-terminated string for the duration of the call
        let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if index == 0 {
            return Err(AttachError::InterfaceNotFound(name.to_string()));
        }
        Ok(index)
    }

    fn flags(mode: AttachMode) -> XdpFlags {
        match mode {
            AttachMode::HardwareOffload => XdpFlags::HW_MODE,
            AttachMode::DriverNative => XdpFlags::DRV_MODE,
            AttachMode::Generic => XdpFlags::SKB_MODE,
            AttachMode::Auto => XdpFlags::default(),
        }
    }

    struct Binding {
        program: AyaProgram,
        link: XdpLinkId,
        mode: AttachMode,
    }

    /// Owns every program this process has attached, keyed by interface
    pub struct XdpAttacher {
        precedence: Vec<AttachMode>,
        bindings: HashMap<String, Binding>,
    }

    impl XdpAttacher {
        pub fn new(precedence: Vec<AttachMode>) -> Result<Self, AttachError> {
            validate_precedence(&precedence)?;
            Ok(Self {
                precedence,
                bindings: HashMap::new(),
            })
        }
    }

    impl InterfaceAttacher for XdpAttacher {
        type Program = AyaProgram;

        fn attach(
            &mut self,
            interface: &str,
            program: AyaProgram,
            mode: AttachMode,
        ) -> Result<AttachMode, AttachError> {
            let if_index = resolve_interface(interface)?;

            if self.bindings.contains_key(interface) {
                info!("Replacing program already attached to {}", interface);
                if let Err(e) = self.detach(interface) {
                    warn!("Failed to detach previous program from {}: {}", interface, e);
                }
            }

            let mut last_error = None;
            for candidate in mode.candidates(&self.precedence) {
                debug!(
                    "Attaching {} to {} (ifindex {}) in {} mode",
                    program.name(),
                    interface,
                    if_index,
                    candidate
                );
                let attempt =
                    program.with_xdp(|xdp| xdp.attach_to_if_index(if_index, flags(candidate)));
                let attempt = match attempt {
                    Ok(attempt) => attempt,
                    Err(e) => {
                        program.release();
                        return Err(e);
                    }
                };
                match attempt {
                    Ok(link) => {
                        info!(
                            "XDP program {} attached to {} in {} mode",
                            program.name(),
                            interface,
                            candidate
                        );
                        self.bindings.insert(
                            interface.to_string(),
                            Binding {
                                program,
                                link,
                                mode: candidate,
                            },
                        );
                        return Ok(candidate);
                    }
                    Err(e) => {
                        warn!("{} mode rejected on {}: {}", candidate, interface, e);
                        last_error = Some(AttachError::Rejected {
                            interface: interface.to_string(),
                            mode: candidate,
                            reason: e.to_string(),
                        });
                    }
                }
            }

            program.release();
            Err(last_error.unwrap_or_else(|| AttachError::Rejected {
                interface: interface.to_string(),
                mode,
                reason: "no attach mode to try".to_string(),
            }))
        }

        fn detach(&mut self, interface: &str) -> Result<(), AttachError> {
            let Some(binding) = self.bindings.remove(interface) else {
                return Err(AttachError::NotAttached(interface.to_string()));
            };

            let link = binding.link;
            let result = binding
                .program
                .with_xdp(|xdp| xdp.detach(link))
                .and_then(|detached| {
                    detached.map_err(|e| AttachError::Rejected {
                        interface: interface.to_string(),
                        mode: binding.mode,
                        reason: e.to_string(),
                    })
                });

            // Dropping the program tears the link down even if the explicit
            // detach failed.
            binding.program.release();
            if result.is_ok() {
                info!("XDP program detached from {}", interface);
            }
            result
        }

        fn state(&self, interface: &str) -> AttachmentState {
            self.bindings
                .get(interface)
                .map_or(AttachmentState::Unattached, |b| {
                    AttachmentState::Attached(b.mode)
                })
        }
    }

    impl Drop for XdpAttacher {
        fn drop(&mut self) {
            let interfaces: Vec<String> = self.bindings.keys().cloned().collect();
            for interface in interfaces {
                if let Err(e) = self.detach(&interface) {
                    warn!("Failed to detach from {} on drop: {}", interface, e);
                }
            }
        }
    }

}
