//! Init-guard agent: run the guard program twice while tailing the trace log,
//! then fire the periodic callback until the linger window closes

use crate::config::GuardConfig;
use crate::ebpf::attach::{exercise_init_guard, run_callbacks, TestRunProgram};
use crate::ebpf::loader::ProbeLoader;
use crate::ebpf::maps::{init_state, KernelStateMap, StateMap};
use crate::lifecycle::Lifecycle;
use crate::trace_log::TraceLog;
use crate::Result;
use hooktail_common::STATE_KEY;
use tracing::info;

pub async fn run(loader: &ProbeLoader, config: &GuardConfig) -> Result<()> {
    let mut probe = loader.load(&config.object)?;

    let mut state = KernelStateMap::open(probe.take_map(&config.state_map)?)?;
    init_state(&mut state)?;

    let mut program = TestRunProgram::load(&mut probe, &config.program)?;
    let mut callback = TestRunProgram::load(&mut probe, &config.callback_program)?;

    let trace = TraceLog::new(&config.trace_path, &config.trace_pipe_path);
    let mut stdout = tokio::io::stdout();
    trace.dump_current(&mut stdout).await?;
    let tail = trace.spawn_tail(stdout)?;

    let lifecycle = Lifecycle::new();
    let outcomes = exercise_init_guard(&mut program, config.runs, config.flush_delay).await?;
    info!("Program return values: {:?}", outcomes);

    info!(
        "Waiting {:?} for trace output, firing {} every {:?}...",
        config.linger, config.callback_program, config.callback_interval
    );
    let fired = run_callbacks(&mut callback, config.callback_interval, config.linger).await?;

    let value = state.lookup(STATE_KEY)?;
    info!(
        "Fired {} callbacks; state reports {} callbacks, {} guard runs",
        fired, value.callbacks, value.hits
    );

    lifecycle.begin_shutdown()?;
    tail.close().await?;

    drop(callback);
    drop(program);
    drop(state);
    probe.unload();
    lifecycle.terminate()?;
    Ok(())
}
