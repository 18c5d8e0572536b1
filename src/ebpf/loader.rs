//! Reading the compiled object and instantiating it in the kernel

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("cannot read object file {}: {source}", path.display())]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid eBPF object: {0}")]
    Parse(String),

    #[error("kernel rejected program {name}: {reason}")]
    Program { name: String, reason: String },
}

/// The compiled object, read once at startup and consumed by the loader
#[derive(Clone)]
pub struct FilterArtifact {
    source: String,
    bytes: Vec<u8>,
}

impl FilterArtifact {
    pub fn read(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        debug!("Reading eBPF object: {}", path.display());

        let bytes = std::fs::read(path).map_err(|source| LoadError::Artifact {
            path: path.to_path_buf(),
            source,
        })?;

        info!("Read eBPF object {} ({} bytes)", path.display(), bytes.len());
        Ok(Self {
            source: path.display().to_string(),
            bytes,
        })
    }

    pub fn from_bytes(source: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            source: source.into(),
            bytes,
        }
    }

    /// Where the bytes came from, for log messages
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for FilterArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterArtifact")
            .field("source", &self.source)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Names a collection has already handed out.
///
/// A name is only recorded once its item was actually produced, so asking
/// for something the object does not contain leaves the name free.
#[derive(Debug, Default)]
pub struct TakenNames(HashSet<String>);

impl TakenNames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce `name` through `take`, unless it was handed out before.
    pub fn take_once<T>(&mut self, name: &str, take: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        if self.0.contains(name) {
            return None;
        }
        let item = take(name)?;
        self.0.insert(name.to_string());
        Some(item)
    }

    pub fn is_taken(&self, name: &str) -> bool {
        self.0.contains(name)
    }
}

#[cfg(target_os = "linux")]
pub use kernel::{AyaCollection, AyaProgram};

#[cfg(target_os = "linux")]
mod kernel {
    use super::{FilterArtifact, LoadError, TakenNames};
    use crate::ebpf::attach::AttachError;
    use crate::ebpf::ObjectCollection;
    use aya::maps::Map;
    use aya::programs::{Program, Xdp};
    use aya::Ebpf;
    use aya_log::EbpfLogger;
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
    use tracing::{debug, info, warn};

    type SharedObject = Arc<Mutex<Ebpf>>;

    fn lock(bpf: &Mutex<Ebpf>) -> MutexGuard<'_, Ebpf> {
        bpf.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every map and program of one object, resident in the kernel.
    ///
    /// Maps leave the object when taken. Programs stay inside it and share
    /// ownership with the collection, so taking one program never hides the
    /// remaining maps or programs.
    pub struct AyaCollection {
        bpf: SharedObject,
        maps: TakenNames,
        programs: TakenNames,
    }

    impl AyaCollection {
        /// Parse the object and load all of its XDP programs.
        ///
        /// Nothing survives a failure: dropping the partially loaded
        /// [`Ebpf`] closes every map and program descriptor created so far.
        pub fn load(artifact: &FilterArtifact) -> Result<Self, LoadError> {
            info!("Loading eBPF object from {}", artifact.source());

            let mut bpf = Ebpf::load(artifact.bytes()).map_err(|e| LoadError::Parse(e.to_string()))?;

            for (name, program) in bpf.programs_mut() {
                match program {
                    Program::Xdp(xdp) => {
                        xdp.load().map_err(|e| LoadError::Program {
                            name: name.to_string(),
                            reason: e.to_string(),
                        })?;
                        debug!("Loaded XDP program {}", name);
                    }
                    _ => warn!("Skipping non-XDP program {}", name),
                }
            }

            if let Err(e) = EbpfLogger::init(&mut bpf) {
                debug!("eBPF logger not available for this object: {}", e);
            }

            let maps: Vec<_> = bpf.maps().map(|(name, _)| name.to_string()).collect();
            let programs: Vec<_> = bpf.programs().map(|(name, _)| name.to_string()).collect();
            info!("Loaded object: programs={:?} maps={:?}", programs, maps);

            Ok(Self {
                bpf: Arc::new(Mutex::new(bpf)),
                maps: TakenNames::new(),
                programs: TakenNames::new(),
            })
        }
    }

    impl ObjectCollection for AyaCollection {
        type Map = Map;
        type Program = AyaProgram;

        fn take_map(&mut self, name: &str) -> Option<Map> {
            let bpf = &self.bpf;
            self.maps.take_once(name, |name| lock(bpf).take_map(name))
        }

        fn take_program(&mut self, name: &str) -> Option<AyaProgram> {
            let bpf = &self.bpf;
            self.programs.take_once(name, |name| {
                lock(bpf).program(name)?;
                Some(AyaProgram {
                    name: name.to_string(),
                    bpf: Arc::clone(bpf),
                })
            })
        }
    }

    /// A loaded XDP program, plus the object state it depends on
    pub struct AyaProgram {
        name: String,
        bpf: SharedObject,
    }

    impl AyaProgram {
        pub fn name(&self) -> &str {
            &self.name
        }

        /// Run `f` against the program while holding the object.
        pub fn with_xdp<R>(&self, f: impl FnOnce(&mut Xdp) -> R) -> Result<R, AttachError> {
            let mut bpf = lock(&self.bpf);
            let program = bpf
                .program_mut(&self.name)
                .ok_or_else(|| AttachError::NotXdp(self.name.clone()))?;
            let xdp = <&mut Xdp>::try_from(program)
                .map_err(|_| AttachError::NotXdp(self.name.clone()))?;
            Ok(f(xdp))
        }

        /// Unload the program. The object itself goes away with its last
        /// owner.
        pub fn release(self) {
            debug!("Releasing program {}", self.name);
            match self.with_xdp(|xdp| xdp.unload()) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Program {} already unloaded: {}", self.name, e),
                Err(e) => debug!("Cannot unload {}: {}", self.name, e),
            }
        }
    }
}
