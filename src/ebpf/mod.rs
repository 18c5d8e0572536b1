pub mod attach;
pub mod events;
pub mod loader;
#[cfg(target_os = "linux")]
pub mod maps;
pub mod reader;

use attach::{AttachError, AttachMode, AttachmentState};
use loader::{FilterArtifact, LoadError};
use reader::{EventSource, OpenError};

/// Named kernel objects produced by loading an artifact.
///
/// Each name can be taken once; a second take returns `None`.
pub trait ObjectCollection {
    type Map: Send + 'static;
    type Program: Send + 'static;

    fn take_map(&mut self, name: &str) -> Option<Self::Map>;

    fn take_program(&mut self, name: &str) -> Option<Self::Program>;
}

/// Binds programs to interfaces. Owns every program it has attached.
pub trait InterfaceAttacher {
    type Program;

    /// Attach `program` to `interface`, replacing any binding this attacher
    /// already holds there. Returns the mode the kernel accepted.
    fn attach(
        &mut self,
        interface: &str,
        program: Self::Program,
        mode: AttachMode,
    ) -> Result<AttachMode, AttachError>;

    /// Detach and release the program bound to `interface`.
    fn detach(&mut self, interface: &str) -> Result<(), AttachError>;

    fn state(&self, interface: &str) -> AttachmentState;
}

/// Everything the ingestion pipeline needs from the kernel side
pub trait Backend {
    type Collection: ObjectCollection;
    type Attacher: InterfaceAttacher<Program = <Self::Collection as ObjectCollection>::Program>;
    type Reader: EventSource;

    fn load(&mut self, artifact: &FilterArtifact) -> Result<Self::Collection, LoadError>;

    fn attacher(&mut self) -> Result<Self::Attacher, AttachError>;

    /// Open a reader on `map` with per-CPU buffers of `buffer_size` bytes.
    fn open_reader(
        &mut self,
        map_name: &str,
        map: <Self::Collection as ObjectCollection>::Map,
        buffer_size: usize,
    ) -> Result<Self::Reader, OpenError>;

    /// Platform memory page size, the default reader buffer size
    fn page_size(&self) -> usize {
        4096
    }
}

#[cfg(target_os = "linux")]
pub use kernel::AyaBackend;

#[cfg(target_os = "linux")]
mod kernel {
    use super::attach::{AttachError, AttachMode, XdpAttacher};
    use super::loader::{AyaCollection, FilterArtifact, LoadError};
    use super::maps;
    use super::reader::{OpenError, RingReader};
    use super::Backend;
    use aya::maps::Map;

    /// Kernel backend built on aya
    pub struct AyaBackend {
        precedence: Vec<AttachMode>,
    }

    impl AyaBackend {
        /// `precedence` is the order tried for [`AttachMode::Auto`]
        pub fn new(precedence: Vec<AttachMode>) -> Self {
            Self { precedence }
        }
    }

    impl Default for AyaBackend {
        fn default() -> Self {
            Self::new(AttachMode::DEFAULT_PRECEDENCE.to_vec())
        }
    }

    impl Backend for AyaBackend {
        type Collection = AyaCollection;
        type Attacher = XdpAttacher;
        type Reader = RingReader;

        fn load(&mut self, artifact: &FilterArtifact) -> Result<AyaCollection, LoadError> {
            AyaCollection::load(artifact)
        }

        fn attacher(&mut self) -> Result<XdpAttacher, AttachError> {
            XdpAttacher::new(self.precedence.clone())
        }

        fn open_reader(
            &mut self,
            map_name: &str,
            map: Map,
            buffer_size: usize,
        ) -> Result<RingReader, OpenError> {
            maps::open_perf_reader(map_name, map, buffer_size)
        }

        fn page_size(&self) -> usize {
            maps::platform_page_size()
        }
    }
}
