//! Perf event array reader backed by aya

use super::reader::{channel, OpenError, ReadError, RingReader, RingSender, DEFAULT_CHANNEL_CAPACITY};
use aya::maps::perf::{AsyncPerfEventArray, AsyncPerfEventArrayBuffer};
use aya::maps::{Map, MapData};
use aya::util::online_cpus;
use bytes::BytesMut;
use tracing::{debug, info, warn};
use xdpcap_common::{HEADER_LEN, SAMPLE_SIZE};

/// Samples drained from a CPU buffer per wakeup
const READ_BATCH: usize = 16;

/// Initial capacity of each read buffer: one full sample. aya grows a
/// buffer on read when a record is larger.
const SAMPLE_CAPACITY: usize = HEADER_LEN + SAMPLE_SIZE;

/// Page size reported by the platform
pub fn platform_page_size() -> usize {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

/// Number of data pages per CPU buffer for a requested byte size.
///
/// The kernel requires a power of two; anything below one page rounds up.
pub fn pages_for(buffer_size: usize, page_size: usize) -> usize {
    buffer_size.div_ceil(page_size).max(1).next_power_of_two()
}

/// Open one perf buffer per online CPU on `map` and merge them into a
/// single [`RingReader`].
pub fn open_perf_reader(name: &str, map: Map, buffer_size: usize) -> Result<RingReader, OpenError> {
    if buffer_size == 0 {
        return Err(OpenError::InvalidBufferSize(buffer_size));
    }

    let mut perf_array: AsyncPerfEventArray<MapData> =
        AsyncPerfEventArray::try_from(map).map_err(|e| OpenError::WrongMapType {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

    let page_count = pages_for(buffer_size, platform_page_size());
    let cpus = online_cpus().map_err(|(msg, err)| OpenError::OnlineCpus(format!("{}: {}", msg, err)))?;

    let (sender, mut reader) = channel(DEFAULT_CHANNEL_CAPACITY);
    for cpu in cpus {
        let buffer = perf_array
            .open(cpu, Some(page_count))
            .map_err(|e| OpenError::PerfBuffer {
                cpu,
                reason: e.to_string(),
            })?;
        reader.adopt(tokio::spawn(forward_cpu(cpu, buffer, sender.clone())));
    }

    info!(
        "Opened perf reader on {} ({} page(s) per CPU)",
        name, page_count
    );
    Ok(reader)
}

/// Drain one CPU's perf buffer into the shared channel until the reader
/// closes or the buffer fails.
async fn forward_cpu(
    cpu: u32,
    mut buffer: AsyncPerfEventArrayBuffer<MapData>,
    sender: RingSender,
) {
    let closer = sender.close_handle();
    let mut buffers = (0..READ_BATCH)
        .map(|_| BytesMut::with_capacity(SAMPLE_CAPACITY))
        .collect::<Vec<_>>();

    loop {
        let events = tokio::select! {
            biased;
            _ = closer.closed() => break,
            events = buffer.read_events(&mut buffers) => events,
        };

        let events = match events {
            Ok(events) => events,
            Err(e) => {
                sender.fail(ReadError::Buffer(format!("cpu {}: {}", cpu, e))).await;
                break;
            }
        };

        if events.lost > 0 {
            warn!("CPU {}: kernel dropped {} sample(s)", cpu, events.lost);
        }

        for buf in buffers.iter_mut().take(events.read) {
            if !sender.send(buf.split().freeze()).await {
                debug!("CPU {}: reader gone, stopping", cpu);
                return;
            }
        }
    }
    debug!("CPU {}: perf forwarder stopped", cpu);
}
