//! In-memory backend for driving the pipeline without a kernel.
//!
//! The "object file" is a manifest of `program:<name>` and `map:<name>`
//! lines. Readers are the crate's own channel, fed by the test through
//! [`FakeBackend::sender`].

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use xdpcap::ebpf::attach::{AttachError, AttachMode, AttachmentState};
use xdpcap::ebpf::loader::{FilterArtifact, LoadError, TakenNames};
use xdpcap::ebpf::reader::{channel, OpenError, RingReader, RingSender};
use xdpcap::ebpf::{Backend, InterfaceAttacher, ObjectCollection};
use xdpcap::pipeline::{DecodeErrorPolicy, PipelineSettings};

pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn manifest(lines: &[&str]) -> FilterArtifact {
    FilterArtifact::from_bytes("manifest", lines.join("\n").into_bytes())
}

pub fn default_artifact() -> FilterArtifact {
    manifest(&["program:xdp_send_prog", "map:my_map"])
}

pub fn settings(interface: &str) -> PipelineSettings {
    PipelineSettings {
        program: "xdp_send_prog".to_string(),
        map: "my_map".to_string(),
        interface: interface.to_string(),
        attach_mode: AttachMode::Generic,
        buffer_size: None,
        decode_errors: DecodeErrorPolicy::Fatal,
    }
}

/// Encode a sample the way the XDP program lays it out
pub fn sample(cookie: u16, payload: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(4 + payload.len());
    raw.extend_from_slice(&cookie.to_le_bytes());
    raw.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    raw.extend_from_slice(payload);
    raw
}

#[derive(Debug, PartialEq, Eq)]
pub struct FakeMap(pub String);

#[derive(Debug, PartialEq, Eq)]
pub struct FakeProgram(pub String);

/// Names listed in the manifest stay resident, like programs in a real
/// object; `TakenNames` alone decides whether they can be handed out again.
pub struct FakeCollection {
    maps: HashSet<String>,
    programs: HashSet<String>,
    taken_maps: TakenNames,
    taken_programs: TakenNames,
}

impl ObjectCollection for FakeCollection {
    type Map = FakeMap;
    type Program = FakeProgram;

    fn take_map(&mut self, name: &str) -> Option<FakeMap> {
        let maps = &self.maps;
        self.taken_maps
            .take_once(name, |n| maps.contains(n).then(|| FakeMap(n.to_string())))
    }

    fn take_program(&mut self, name: &str) -> Option<FakeProgram> {
        let programs = &self.programs;
        self.taken_programs
            .take_once(name, |n| programs.contains(n).then(|| FakeProgram(n.to_string())))
    }
}

pub fn load_manifest(artifact: &FilterArtifact) -> Result<FakeCollection, LoadError> {
    let text = std::str::from_utf8(artifact.bytes())
        .map_err(|e| LoadError::Parse(e.to_string()))?;

    let mut collection = FakeCollection {
        maps: HashSet::new(),
        programs: HashSet::new(),
        taken_maps: TakenNames::new(),
        taken_programs: TakenNames::new(),
    };
    for line in text.lines().filter(|l| !l.is_empty()) {
        match line.split_once(':') {
            Some(("program", name)) => collection.programs.insert(name.to_string()),
            Some(("map", name)) => collection.maps.insert(name.to_string()),
            _ => return Err(LoadError::Parse(format!("bad manifest line {:?}", line))),
        };
    }
    Ok(collection)
}

pub struct FakeAttacher {
    interfaces: Vec<String>,
    rejected: Vec<AttachMode>,
    precedence: Vec<AttachMode>,
    bindings: HashMap<String, (FakeProgram, AttachMode)>,
    log: CallLog,
}

impl InterfaceAttacher for FakeAttacher {
    type Program = FakeProgram;

    fn attach(
        &mut self,
        interface: &str,
        program: FakeProgram,
        mode: AttachMode,
    ) -> Result<AttachMode, AttachError> {
        if !self.interfaces.iter().any(|i| i == interface) {
            return Err(AttachError::InterfaceNotFound(interface.to_string()));
        }
        if self.bindings.contains_key(interface) {
            self.detach(interface)?;
        }

        let mut last = None;
        for candidate in mode.candidates(&self.precedence) {
            self.log
                .lock()
                .unwrap()
                .push(format!("attach {} {} {}", program.0, interface, candidate));
            if self.rejected.contains(&candidate) {
                last = Some(AttachError::Rejected {
                    interface: interface.to_string(),
                    mode: candidate,
                    reason: "not supported".to_string(),
                });
                continue;
            }
            self.bindings
                .insert(interface.to_string(), (program, candidate));
            return Ok(candidate);
        }
        Err(last.expect("at least one candidate"))
    }

    fn detach(&mut self, interface: &str) -> Result<(), AttachError> {
        match self.bindings.remove(interface) {
            Some((program, _)) => {
                self.log
                    .lock()
                    .unwrap()
                    .push(format!("detach {} {}", program.0, interface));
                Ok(())
            }
            None => Err(AttachError::NotAttached(interface.to_string())),
        }
    }

    fn state(&self, interface: &str) -> AttachmentState {
        self.bindings
            .get(interface)
            .map_or(AttachmentState::Unattached, |(_, mode)| {
                AttachmentState::Attached(*mode)
            })
    }
}

pub struct FakeBackend {
    pub interfaces: Vec<String>,
    pub rejected: Vec<AttachMode>,
    pub precedence: Vec<AttachMode>,
    pub log: CallLog,
    sender: Option<RingSender>,
}

impl FakeBackend {
    pub fn with_interfaces(interfaces: &[&str]) -> Self {
        Self {
            interfaces: interfaces.iter().map(|i| i.to_string()).collect(),
            rejected: Vec::new(),
            precedence: AttachMode::DEFAULT_PRECEDENCE.to_vec(),
            log: CallLog::default(),
            sender: None,
        }
    }

    /// Producer side of the last reader opened
    pub fn sender(&self) -> RingSender {
        self.sender.clone().expect("no reader opened")
    }

    pub fn opened_reader(&self) -> bool {
        self.sender.is_some()
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl Backend for FakeBackend {
    type Collection = FakeCollection;
    type Attacher = FakeAttacher;
    type Reader = RingReader;

    fn load(&mut self, artifact: &FilterArtifact) -> Result<FakeCollection, LoadError> {
        self.log.lock().unwrap().push("load".to_string());
        load_manifest(artifact)
    }

    fn attacher(&mut self) -> Result<FakeAttacher, AttachError> {
        Ok(FakeAttacher {
            interfaces: self.interfaces.clone(),
            rejected: self.rejected.clone(),
            precedence: self.precedence.clone(),
            bindings: HashMap::new(),
            log: self.log.clone(),
        })
    }

    fn open_reader(
        &mut self,
        map_name: &str,
        map: FakeMap,
        buffer_size: usize,
    ) -> Result<RingReader, OpenError> {
        assert_eq!(map.0, map_name);
        if buffer_size == 0 {
            return Err(OpenError::InvalidBufferSize(buffer_size));
        }
        self.log
            .lock()
            .unwrap()
            .push(format!("open {} {}", map_name, buffer_size));
        let (sender, reader) = channel(64);
        self.sender = Some(sender);
        Ok(reader)
    }
}
