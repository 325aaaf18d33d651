//! fentry agent: stream `security_file_fcntl` callers until SIGINT/SIGTERM

use crate::config::FcntlConfig;
use crate::ebpf::attach::attach_fentry;
use crate::ebpf::loader::ProbeLoader;
use crate::ebpf::maps::{init_state, KernelStateMap};
use crate::ebpf::ringbuf::{consume, EventConsumer, RingBufSource};
use crate::lifecycle::{cancel_shutdown, wait_for_signal, Lifecycle};
use crate::{HooktailError, Result};
use tracing::info;

pub async fn run(loader: &ProbeLoader, config: &FcntlConfig) -> Result<()> {
    let mut probe = loader.load(&config.object)?;
    probe.init_logger();

    // Sentinel first: the probe must never observe an unwritten state map.
    let (mut state, pinned) =
        KernelStateMap::open_pinned(probe.take_map(&config.state_map)?, &config.pin_path)?;
    init_state(&mut state)?;

    let attachment = attach_fentry(&mut probe, &config.program, &config.hook)?;

    let source = RingBufSource::new(probe.take_map(&config.events_map)?)?;
    let (mut consumer, closer) = EventConsumer::new(source);

    let lifecycle = Lifecycle::new();
    let shutdown = tokio::spawn(lifecycle.clone().shutdown_on(
        wait_for_signal(),
        closer,
        Some(pinned),
    ));

    info!("Listening on fentry/{}. Press Ctrl+C to exit.", attachment.hook());

    let mut stdout = std::io::stdout().lock();
    let summary = match consume(&mut consumer, config.output, &mut stdout).await {
        Ok(summary) => summary,
        Err(e) => {
            // The pin is released before the process exits.
            cancel_shutdown(shutdown).await;
            return Err(e.into());
        }
    };
    info!(
        "Printed {} events ({} malformed, {} read errors)",
        summary.printed, summary.decode_errors, summary.read_errors
    );

    shutdown
        .await
        .map_err(|e| HooktailError::IoError(std::io::Error::other(e)))??;

    attachment.detach();
    drop(consumer);
    drop(state);
    probe.unload();
    lifecycle.terminate()?;
    Ok(())
}
