//! Ingestion loop: load, attach, then stream decoded packet events
//!
//! ```text
//! Init -> Loading -> Attaching -> Streaming -> ShuttingDown -> Terminated
//! ```
//!
//! Setup failures abort before `Streaming` and release whatever was already
//! acquired. While streaming, one read is in flight at a time and events are
//! handed out in the order the reader produced them.

use crate::ebpf::attach::{AttachMode, AttachmentState};
use crate::ebpf::events::{decode_bytes, PacketEvent};
use crate::ebpf::loader::FilterArtifact;
use crate::ebpf::reader::{CloseHandle, EventSource, ReadError};
use crate::ebpf::{Backend, InterfaceAttacher, ObjectCollection};
use crate::{Result, XdpcapError};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Init,
    Loading,
    Attaching,
    Streaming,
    ShuttingDown,
    Terminated,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Init => "init",
            PipelineState::Loading => "loading",
            PipelineState::Attaching => "attaching",
            PipelineState::Streaming => "streaming",
            PipelineState::ShuttingDown => "shutting-down",
            PipelineState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// What to do with a sample that fails to decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeErrorPolicy {
    /// End the stream with the error
    #[default]
    Fatal,
    /// Log, count and keep reading
    Skip,
}

/// Names and knobs for one capture session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub program: String,
    pub map: String,
    pub interface: String,
    pub attach_mode: AttachMode,
    /// Per-CPU buffer size in bytes; `None` uses the platform page size
    pub buffer_size: Option<usize>,
    pub decode_errors: DecodeErrorPolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    /// Events decoded and handed to the caller
    pub events: u64,
    /// Empty samples skipped
    pub idle: u64,
    /// Malformed samples dropped under [`DecodeErrorPolicy::Skip`]
    pub skipped: u64,
}

pub struct Pipeline<B: Backend> {
    state: PipelineState,
    interface: String,
    mode: AttachMode,
    attacher: B::Attacher,
    reader: Option<B::Reader>,
    cancel: CancellationToken,
    policy: DecodeErrorPolicy,
    stats: PipelineStats,
}

impl<B: Backend> Pipeline<B> {
    /// Load `artifact`, open the event reader, attach the program and enter
    /// `Streaming`.
    ///
    /// The artifact is consumed; nothing holds on to its bytes afterwards.
    pub fn start(
        backend: &mut B,
        artifact: FilterArtifact,
        settings: &PipelineSettings,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let mut state = PipelineState::Init;
        enter(&mut state, PipelineState::Loading);

        let (mut reader, program) = match load(backend, artifact, settings) {
            Ok(loaded) => loaded,
            Err(e) => return Err(abort(state, e)),
        };

        enter(&mut state, PipelineState::Attaching);
        let mut attacher = match backend.attacher() {
            Ok(attacher) => attacher,
            Err(e) => {
                reader.close();
                return Err(abort(state, e.into()));
            }
        };
        let mode = match attacher.attach(&settings.interface, program, settings.attach_mode) {
            Ok(mode) => mode,
            Err(e) => {
                reader.close();
                return Err(abort(state, e.into()));
            }
        };

        enter(&mut state, PipelineState::Streaming);
        info!(
            "Streaming packets from {} ({} mode)",
            settings.interface, mode
        );

        Ok(Self {
            state,
            interface: settings.interface.clone(),
            mode,
            attacher,
            reader: Some(reader),
            cancel,
            policy: settings.decode_errors,
            stats: PipelineStats::default(),
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Mode the kernel accepted for the attachment
    pub fn attach_mode(&self) -> AttachMode {
        self.mode
    }

    pub fn attachment(&self) -> AttachmentState {
        self.attacher.state(&self.interface)
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Handle that closes the reader, interrupting a read in flight.
    /// `None` once the pipeline has shut down.
    pub fn close_handle(&self) -> Option<CloseHandle> {
        self.reader.as_ref().map(|reader| reader.close_handle())
    }

    /// Next decoded event, `Ok(None)` once the pipeline has terminated.
    ///
    /// Any error returned here is terminal: the pipeline has already shut
    /// down when the caller sees it.
    pub async fn next_event(&mut self) -> Result<Option<PacketEvent>> {
        loop {
            if self.state != PipelineState::Streaming {
                return Ok(None);
            }
            if self.cancel.is_cancelled() {
                info!("Cancellation requested");
                self.shutdown();
                return Ok(None);
            }

            let Some(reader) = self.reader.as_mut() else {
                self.shutdown();
                return Ok(None);
            };

            let read = reader.read().await;
            let raw = match read {
                Ok(raw) => raw,
                Err(ReadError::Closed) => {
                    info!("Event reader closed");
                    self.shutdown();
                    return Ok(None);
                }
                Err(e) => {
                    self.shutdown();
                    return Err(e.into());
                }
            };

            if raw.is_empty() {
                self.stats.idle += 1;
                continue;
            }

            match decode_bytes(&raw) {
                Ok(event) => {
                    self.stats.events += 1;
                    return Ok(Some(event));
                }
                Err(e) => match self.policy {
                    DecodeErrorPolicy::Fatal => {
                        self.shutdown();
                        return Err(e.into());
                    }
                    DecodeErrorPolicy::Skip => {
                        warn!("Skipping malformed sample ({} bytes): {}", raw.len(), e);
                        self.stats.skipped += 1;
                    }
                },
            }
        }
    }

    /// Deliver every event to `sink` until the stream ends.
    pub async fn run<F>(&mut self, mut sink: F) -> Result<PipelineStats>
    where
        F: FnMut(PacketEvent),
    {
        while let Some(event) = self.next_event().await? {
            sink(event);
        }
        Ok(self.stats)
    }

    /// The pipeline as a stream; it ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<PacketEvent>> {
        futures::stream::unfold(Some(self), |pipeline| async move {
            let mut pipeline = pipeline?;
            match pipeline.next_event().await {
                Ok(Some(event)) => Some((Ok(event), Some(pipeline))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    /// Detach the program and close the reader. Idempotent.
    ///
    /// Cleanup failures are logged and never replace the reason the
    /// pipeline stopped.
    pub fn shutdown(&mut self) {
        if matches!(
            self.state,
            PipelineState::ShuttingDown | PipelineState::Terminated
        ) {
            return;
        }
        enter(&mut self.state, PipelineState::ShuttingDown);

        if let AttachmentState::Attached(_) = self.attacher.state(&self.interface) {
            if let Err(e) = self.attacher.detach(&self.interface) {
                warn!("Failed to detach from {}: {}", self.interface, e);
            }
        }
        if let Some(mut reader) = self.reader.take() {
            reader.close();
        }

        enter(&mut self.state, PipelineState::Terminated);
        info!(
            "Pipeline stopped: {} events, {} idle, {} skipped",
            self.stats.events, self.stats.idle, self.stats.skipped
        );
    }
}

impl<B: Backend> Drop for Pipeline<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

type Loaded<B> = (
    <B as Backend>::Reader,
    <<B as Backend>::Collection as ObjectCollection>::Program,
);

fn load<B: Backend>(
    backend: &mut B,
    artifact: FilterArtifact,
    settings: &PipelineSettings,
) -> Result<Loaded<B>> {
    let mut collection = backend.load(&artifact)?;
    drop(artifact);

    let map = collection
        .take_map(&settings.map)
        .ok_or_else(|| XdpcapError::MissingMap(settings.map.clone()))?;

    let buffer_size = settings.buffer_size.unwrap_or_else(|| backend.page_size());
    let mut reader = backend.open_reader(&settings.map, map, buffer_size)?;

    match collection.take_program(&settings.program) {
        Some(program) => Ok((reader, program)),
        None => {
            reader.close();
            Err(XdpcapError::MissingProgram(settings.program.clone()))
        }
    }
}

fn enter(state: &mut PipelineState, next: PipelineState) {
    debug!("Pipeline {} -> {}", state, next);
    *state = next;
}

fn abort(mut state: PipelineState, err: XdpcapError) -> XdpcapError {
    warn!("Pipeline setup failed while {}: {}", state, err);
    enter(&mut state, PipelineState::Terminated);
    err
}
