//! Binding programs to hook points, or invoking them directly
//!
//! Attachments are owned values: dropping one detaches the program, so the
//! agent holds it for its whole lifetime and drops it before the object.

use crate::{HooktailError, Result};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// A program that can be run on demand and reports its return value
pub trait ProgramRunner {
    fn run(&mut self) -> Result<u32>;
}

/// Run the init-guard program `runs` times
///
/// After a non-zero return the caller's trace output may still be in
/// flight, so wait `flush_delay` before continuing.
pub async fn exercise_init_guard<R>(
    runner: &mut R,
    runs: u32,
    flush_delay: Duration,
) -> Result<Vec<u32>>
where
    R: ProgramRunner + ?Sized,
{
    let mut outcomes = Vec::with_capacity(runs as usize);

    for run in 1..=runs {
        let retval = runner.run()?;
        info!("Run {}/{}: program returned {}", run, runs, retval);

        if retval != 0 {
            warn!("Program returned {}, waiting for trace output", retval);
            tokio::time::sleep(flush_delay).await;
        }
        outcomes.push(retval);
    }

    Ok(outcomes)
}

/// Fire the periodic callback program every `period` for `duration`
///
/// The first firing happens one period after the call, like a timer armed
/// now. A late tick pushes the schedule back instead of bursting. Non-zero
/// returns are logged and the schedule continues; a failed run is fatal.
/// Returns the number of firings.
pub async fn run_callbacks<R>(runner: &mut R, period: Duration, duration: Duration) -> Result<u64>
where
    R: ProgramRunner + ?Sized,
{
    if period.is_zero() {
        return Err(HooktailError::ConfigError(
            "callback interval must be greater than zero".to_string(),
        ));
    }

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);

    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut fired = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = &mut deadline => break,
            _ = interval.tick() => {
                let retval = runner.run()?;
                fired += 1;
                if retval != 0 {
                    warn!("Callback {} returned {}", fired, retval);
                } else {
                    debug!("Callback {} fired", fired);
                }
            }
        }
    }

    Ok(fired)
}

#[cfg(target_os = "linux")]
pub use kernel::{attach_fentry, Attachment, TestRunProgram};

#[cfg(target_os = "linux")]
mod kernel {
    use super::ProgramRunner;
    use crate::ebpf::loader::LoadedProbe;
    use crate::{HooktailError, Result};
    use aya::programs::fentry::FEntryLink;
    use aya::programs::{FEntry, ProgramFd, Xdp};
    use aya::Btf;
    use std::os::fd::{AsFd, AsRawFd};
    use tracing::{debug, info};

    /// Live fentry attachment; detaches on drop
    pub struct Attachment {
        hook: String,
        _link: FEntryLink,
    }

    impl Attachment {
        pub fn hook(&self) -> &str {
            &self.hook
        }

        pub fn detach(self) {
            info!("Detaching from {}", self.hook);
            drop(self);
        }
    }

    /// Load `program` against kernel BTF and attach it at the entry of `hook`
    pub fn attach_fentry(probe: &mut LoadedProbe, program: &str, hook: &str) -> Result<Attachment> {
        info!("Attaching {} to fentry/{}...", program, hook);

        let btf = Btf::from_sys_fs()
            .map_err(|e| HooktailError::AttachFailed(format!("kernel BTF unavailable: {}", e)))?;

        let fentry: &mut FEntry = probe
            .bpf_mut()
            .program_mut(program)
            .ok_or_else(|| {
                HooktailError::AttachFailed(format!("{} program not found in eBPF object", program))
            })?
            .try_into()
            .map_err(|e| HooktailError::AttachFailed(format!("{}: {}", program, e)))?;

        fentry
            .load(hook, &btf)
            .map_err(|e| HooktailError::ProgramLoadFailed(format!("{}: {}", program, e)))?;

        let link_id = fentry
            .attach()
            .map_err(|e| HooktailError::AttachFailed(format!("fentry/{}: {}", hook, e)))?;
        let link = fentry
            .take_link(link_id)
            .map_err(|e| HooktailError::AttachFailed(format!("fentry/{}: {}", hook, e)))?;

        info!("{} attached to fentry/{}", program, hook);
        Ok(Attachment {
            hook: hook.to_string(),
            _link: link,
        })
    }

    const BPF_PROG_TEST_RUN: libc::c_long = 10;

    /// Smallest frame XDP test runs accept is an Ethernet header
    const DUMMY_FRAME_LEN: usize = 64;

    /// `test` member of `union bpf_attr`
    #[repr(C)]
    #[derive(Default)]
    struct TestRunAttr {
        prog_fd: u32,
        retval: u32,
        data_size_in: u32,
        data_size_out: u32,
        data_in: u64,
        data_out: u64,
        repeat: u32,
        duration: u32,
        ctx_size_in: u32,
        ctx_size_out: u32,
        ctx_in: u64,
        ctx_out: u64,
        flags: u32,
        cpu: u32,
        batch_size: u32,
    }

    /// A loaded, unattached program run through BPF_PROG_TEST_RUN
    pub struct TestRunProgram {
        name: String,
        fd: ProgramFd,
    }

    impl TestRunProgram {
        pub fn load(probe: &mut LoadedProbe, program: &str) -> Result<Self> {
            let xdp: &mut Xdp = probe
                .bpf_mut()
                .program_mut(program)
                .ok_or_else(|| {
                    HooktailError::AttachFailed(format!(
                        "{} program not found in eBPF object",
                        program
                    ))
                })?
                .try_into()
                .map_err(|e| HooktailError::AttachFailed(format!("{}: {}", program, e)))?;

            xdp.load()
                .map_err(|e| HooktailError::ProgramLoadFailed(format!("{}: {}", program, e)))?;

            let fd = xdp
                .fd()
                .and_then(|fd| fd.try_clone().map_err(Into::into))
                .map_err(|e| HooktailError::AttachFailed(format!("{}: {}", program, e)))?;

            debug!("{} loaded for direct invocation", program);
            Ok(Self {
                name: program.to_string(),
                fd,
            })
        }
    }

    impl ProgramRunner for TestRunProgram {
        fn run(&mut self) -> Result<u32> {
            let frame = [0u8; DUMMY_FRAME_LEN];
            let mut attr = TestRunAttr {
                prog_fd: self.fd.as_fd().as_raw_fd() as u32,
                data_size_in: frame.len() as u32,
                data_in: frame.as_ptr() as u64,
                repeat: 1,
                ..Default::default()
            };

            // SAFETY: attr is a valid bpf_attr prefix and frame outlives the call.
            let ret = unsafe {
                libc::syscall(
                    libc::SYS_bpf,
                    BPF_PROG_TEST_RUN,
                    &mut attr as *mut TestRunAttr,
                    std::mem::size_of::<TestRunAttr>(),
                )
            };
            if ret < 0 {
                return Err(HooktailError::ProgramRunFailed(format!(
                    "{}: {}",
                    self.name,
                    std::io::Error::last_os_error()
                )));
            }

            Ok(attr.retval)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebpf::maps::{init_state, MemoryStateMap, StateMap};
    use hooktail_common::{StateValue, GUARD_EINVAL, STATE_KEY};

    /// Mirrors guard_probe's `init_guard` against an in-memory state map
    struct GuardProgram {
        map: MemoryStateMap,
        log: Vec<&'static str>,
    }

    impl GuardProgram {
        fn new() -> Self {
            let mut map = MemoryStateMap::with_max_entries(1);
            init_state(&mut map).unwrap();
            Self {
                map,
                log: Vec::new(),
            }
        }
    }

    impl ProgramRunner for GuardProgram {
        fn run(&mut self) -> Result<u32> {
            let mut value = self.map.lookup(STATE_KEY)?;
            value.hits += 1;
            let retval = match value.initialized {
                0 => {
                    value.initialized = 1;
                    self.log.push("info: timer initialized");
                    0
                }
                1 => {
                    self.log.push("info: timer already initialized");
                    0
                }
                _ => {
                    self.log.push("error: timer_init");
                    GUARD_EINVAL
                }
            };
            self.map.upsert(STATE_KEY, value)?;
            Ok(retval)
        }
    }

    /// Mirrors `guard_tick` over the same state as a [`GuardProgram`]
    struct TickProgram<'a>(&'a mut GuardProgram);

    impl ProgramRunner for TickProgram<'_> {
        fn run(&mut self) -> Result<u32> {
            let mut value = self.0.map.lookup(STATE_KEY)?;
            if value.initialized != 1 {
                self.0.log.push("error: timer_callback: timer not initialized");
                return Ok(1);
            }
            value.callbacks += 1;
            self.0.log.push("timer_callback");
            self.0.map.upsert(STATE_KEY, value)?;
            Ok(0)
        }
    }

    struct Failing;

    impl ProgramRunner for Failing {
        fn run(&mut self) -> Result<u32> {
            Err(HooktailError::ProgramRunFailed("EPERM".to_string()))
        }
    }

    struct Returns(u32);

    impl ProgramRunner for Returns {
        fn run(&mut self) -> Result<u32> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn test_second_run_sees_initialized_flag() {
        let mut program = GuardProgram::new();

        let outcomes = exercise_init_guard(&mut program, 2, Duration::from_millis(1))
            .await
            .unwrap();

        assert_eq!(outcomes, vec![0, 0]);
        assert_eq!(
            program.log,
            vec!["info: timer initialized", "info: timer already initialized"]
        );
        assert_eq!(
            program.map.lookup(STATE_KEY).unwrap(),
            StateValue {
                initialized: 1,
                hits: 2,
                callbacks: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_reinitializing_resets_guard() {
        let mut program = GuardProgram::new();

        exercise_init_guard(&mut program, 1, Duration::ZERO)
            .await
            .unwrap();
        init_state(&mut program.map).unwrap();
        exercise_init_guard(&mut program, 1, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(program.log, vec!["info: timer initialized"; 2]);
    }

    #[tokio::test]
    async fn test_corrupt_state_returns_einval_and_waits() {
        let mut program = GuardProgram::new();
        program
            .map
            .upsert(
                STATE_KEY,
                StateValue {
                    initialized: 7,
                    ..StateValue::UNINITIALIZED
                },
            )
            .unwrap();

        let started = std::time::Instant::now();
        let outcomes = exercise_init_guard(&mut program, 2, Duration::from_millis(10))
            .await
            .unwrap();

        assert_eq!(outcomes, vec![GUARD_EINVAL, GUARD_EINVAL]);
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(program.map.lookup(STATE_KEY).unwrap().hits, 2);
    }

    #[tokio::test]
    async fn test_callbacks_fire_after_guard_is_armed() {
        let mut program = GuardProgram::new();
        exercise_init_guard(&mut program, 2, Duration::ZERO)
            .await
            .unwrap();

        let fired = run_callbacks(
            &mut TickProgram(&mut program),
            Duration::from_millis(10),
            Duration::from_millis(200),
        )
        .await
        .unwrap();

        assert!((1..=20).contains(&fired), "fired {} times", fired);
        let value = program.map.lookup(STATE_KEY).unwrap();
        assert_eq!(value.callbacks, fired);
        assert_eq!(value.hits, 2);
        assert_eq!(
            program.log.iter().filter(|l| **l == "timer_callback").count() as u64,
            fired
        );
    }

    #[tokio::test]
    async fn test_callbacks_before_arming_report_errors_and_continue() {
        let mut program = GuardProgram::new();

        let fired = run_callbacks(
            &mut TickProgram(&mut program),
            Duration::from_millis(10),
            Duration::from_millis(100),
        )
        .await
        .unwrap();

        assert!(fired >= 1);
        assert_eq!(program.map.lookup(STATE_KEY).unwrap().callbacks, 0);
        assert!(program
            .log
            .iter()
            .all(|l| *l == "error: timer_callback: timer not initialized"));
    }

    #[tokio::test]
    async fn test_no_callback_within_first_period() {
        let mut program = GuardProgram::new();
        exercise_init_guard(&mut program, 1, Duration::ZERO)
            .await
            .unwrap();

        let fired = run_callbacks(
            &mut TickProgram(&mut program),
            Duration::from_secs(60),
            Duration::from_millis(20),
        )
        .await
        .unwrap();
        assert_eq!(fired, 0);
    }

    #[tokio::test]
    async fn test_zero_callback_interval_rejected() {
        let result = run_callbacks(&mut Returns(0), Duration::ZERO, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(HooktailError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_callback_run_failure_is_fatal() {
        let result = run_callbacks(
            &mut Failing,
            Duration::from_millis(5),
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(HooktailError::ProgramRunFailed(_))));
    }

    #[tokio::test]
    async fn test_non_zero_return_waits_and_continues() {
        let started = std::time::Instant::now();
        let outcomes = exercise_init_guard(&mut Returns(1), 2, Duration::from_millis(10))
            .await
            .unwrap();

        assert_eq!(outcomes, vec![1, 1]);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_run_failure_is_fatal() {
        let result = exercise_init_guard(&mut Failing, 2, Duration::ZERO).await;
        assert!(matches!(result, Err(HooktailError::ProgramRunFailed(_))));
    }
}
