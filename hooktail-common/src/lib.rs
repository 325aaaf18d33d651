//! Shared types between eBPF (kernel) and userspace
//!
//! Everything here is `#[repr(C)]` and `no_std` compatible so the probes and
//! the agent agree on the byte layout of ring buffer records and map values.

#![cfg_attr(not(feature = "userspace"), no_std)]

/// Length of the task command name (`TASK_COMM_LEN`)
pub const COMM_LEN: usize = 16;

/// Key of the single entry in the `STATE` array map
pub const STATE_KEY: u32 = 0;

/// Name of the ring buffer map carrying [`FcntlEvent`] records
pub const EVENTS_MAP: &str = "EVENTS";

/// Name of the single-entry state map
pub const STATE_MAP: &str = "STATE";

/// Event emitted on every `security_file_fcntl` entry
///
/// Layout (24 bytes total, little-endian on bpfel):
/// - comm: NUL-padded task name
/// - pid: kernel thread id (lower half of `bpf_get_current_pid_tgid`)
/// - tgid: thread group id (upper half)
#[repr(C)]
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "userspace", derive(PartialEq, Eq))]
pub struct FcntlEvent {
    pub comm: [u8; COMM_LEN],
    pub pid: u32,
    pub tgid: u32,
}

/// Value stored in the state map
///
/// `initialized` is written as zero by userspace before any probe runs; the
/// first probe invocation flips it to one. Any other value is corrupt.
/// `callbacks` counts periodic callback firings once the guard is armed.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "userspace", derive(PartialEq, Eq))]
pub struct StateValue {
    pub initialized: u64,
    pub hits: u64,
    pub callbacks: u64,
}

impl StateValue {
    pub const UNINITIALIZED: StateValue = StateValue {
        initialized: 0,
        hits: 0,
        callbacks: 0,
    };

    pub const fn is_initialized(&self) -> bool {
        self.initialized != 0
    }
}

/// `EINVAL`, returned by the init guard when `initialized` holds neither 0 nor 1
pub const GUARD_EINVAL: u32 = 22;

#[cfg(feature = "userspace")]
const _: () = {
    assert!(
        core::mem::size_of::<FcntlEvent>() == 24,
        "FcntlEvent must be exactly 24 bytes"
    );
    assert!(
        core::mem::align_of::<FcntlEvent>() == 4,
        "FcntlEvent must be 4-byte aligned"
    );
};

#[cfg(feature = "userspace")]
const _: () = {
    assert!(
        core::mem::size_of::<StateValue>() == 24,
        "StateValue must be exactly 24 bytes"
    );
};
