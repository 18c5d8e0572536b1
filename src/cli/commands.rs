use crate::cli::{CaptureArgs, Commands, OutputFormat};
use crate::config::Config;
use crate::ebpf::events::PacketEvent;
use crate::ebpf::reader::CloseHandle;
use crate::Result;
use std::future::Future;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn handle_command(command: Commands, config_path: Option<&Path>) -> anyhow::Result<()> {
    match command {
        Commands::Capture(args) => {
            let config = effective_config(config_path, &args)?;
            handle_capture(config, args.format).await
        }
        Commands::ShowConfig(args) => {
            let config = effective_config(config_path, &args)?;
            print!("{}", config.to_yaml()?);
            Ok(())
        }
    }
}

/// Config file (or defaults) with command-line overrides applied
pub fn effective_config(config_path: Option<&Path>, args: &CaptureArgs) -> Result<Config> {
    let mut config = match config_path {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    args.apply(&mut config);
    config.validate()?;
    Ok(config)
}

pub fn format_event(event: &PacketEvent, format: OutputFormat) -> String {
    match format {
        OutputFormat::Text => format!(
            "cookie={:#06x} len={} payload={:?}",
            event.cookie,
            event.packet_length,
            event.payload.as_ref()
        ),
        OutputFormat::Json => serde_json::to_string(event)
            .unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e)),
    }
}

/// Stop the capture once `signal` fires. If listening for the signal
/// fails, the capture keeps running.
pub async fn stop_on_signal<S>(signal: S, cancel: CancellationToken, closer: CloseHandle)
where
    S: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        warn!("Failed to listen for Ctrl-C, capture continues: {}", e);
        return;
    }
    info!("Shutdown signal received");
    cancel.cancel();
    closer.close();
}

#[cfg(target_os = "linux")]
async fn handle_capture(config: Config, format: OutputFormat) -> anyhow::Result<()> {
    use crate::ebpf::loader::FilterArtifact;
    use crate::ebpf::AyaBackend;
    use crate::pipeline::Pipeline;
    use anyhow::Context;

    if config.raise_memlock {
        raise_memlock_limit();
    }

    let artifact = FilterArtifact::read(&config.object).context("Failed to read eBPF object")?;
    let mut backend = AyaBackend::new(config.auto_precedence.clone());
    let cancel = CancellationToken::new();
    let mut pipeline = Pipeline::start(
        &mut backend,
        artifact,
        &config.pipeline_settings(),
        cancel.clone(),
    )
    .with_context(|| format!("Failed to start capture on {}", config.interface))?;

    if let Some(closer) = pipeline.close_handle() {
        tokio::spawn(stop_on_signal(tokio::signal::ctrl_c(), cancel, closer));
    }

    info!("Capturing on {}. Press Ctrl-C to exit.", config.interface);
    let stats = pipeline
        .run(|event| println!("{}", format_event(&event, format)))
        .await
        .context("Capture stopped")?;

    info!("Captured {} packet(s)", stats.events);
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn handle_capture(_config: Config, _format: OutputFormat) -> anyhow::Result<()> {
    anyhow::bail!("capturing requires Linux to run eBPF programs")
}

/// Lift the locked-memory limit so map allocations are not refused on
/// kernels without memcg-based accounting.
#[cfg(target_os = "linux")]
fn raise_memlock_limit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    // SAFETY: rlim is a valid rlimit for the duration of the call
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        tracing::warn!(
            "Failed to remove RLIMIT_MEMLOCK: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::io::Write;

    fn sample_event() -> PacketEvent {
        PacketEvent {
            cookie: 0xdead,
            packet_length: 3,
            payload: Bytes::from_static(&[1, 2, 3]),
        }
    }

    #[test]
    fn test_format_text() {
        assert_eq!(
            format_event(&sample_event(), OutputFormat::Text),
            "cookie=0xdead len=3 payload=[1, 2, 3]"
        );
    }

    #[test]
    fn test_format_json() {
        let line = format_event(&sample_event(), OutputFormat::Json);
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();

        assert_eq!(value["cookie"], 0xdead);
        assert_eq!(value["packet_length"], 3);
        assert_eq!(value["payload"], serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn test_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "interface: veth0\nmap: events").unwrap();

        let args = CaptureArgs {
            interface: Some("lo".to_string()),
            ..CaptureArgs::default()
        };
        let config = effective_config(Some(file.path()), &args).unwrap();

        assert_eq!(config.interface, "lo");
        assert_eq!(config.map, "events");
    }

    fn close_handle() -> (crate::ebpf::reader::RingReader, CloseHandle) {
        use crate::ebpf::reader::{channel, EventSource};

        let (_sender, reader) = channel(1);
        let closer = reader.close_handle();
        (reader, closer)
    }

    #[tokio::test]
    async fn test_signal_stops_capture() {
        let (_reader, closer) = close_handle();
        let cancel = CancellationToken::new();

        stop_on_signal(async { Ok(()) }, cancel.clone(), closer.clone()).await;

        assert!(cancel.is_cancelled());
        assert!(closer.is_closed());
    }

    #[tokio::test]
    async fn test_failed_signal_listener_keeps_capturing() {
        let (_reader, closer) = close_handle();
        let cancel = CancellationToken::new();

        let signal = async { Err(std::io::Error::other("no signal driver")) };
        stop_on_signal(signal, cancel.clone(), closer.clone()).await;

        assert!(!cancel.is_cancelled());
        assert!(!closer.is_closed());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_capture_error_carries_context() {
        let args = CaptureArgs {
            object: Some("/nonexistent/elfs/send.o".into()),
            keep_memlock: true,
            ..CaptureArgs::default()
        };

        let err = handle_command(Commands::Capture(args), None).await.unwrap_err();
        let message = format!("{:#}", err);

        assert!(message.starts_with("Failed to read eBPF object: "));
        assert!(message.contains("/nonexistent/elfs/send.o"));
        assert!(err.downcast_ref::<crate::ebpf::loader::LoadError>().is_some());
    }
}
