//! fentry probe on `security_file_fcntl`
//!
//! Every fcntl(2) that reaches the LSM hook produces one [`FcntlEvent`] in
//! the `EVENTS` ring buffer. The first invocation after userspace wrote the
//! sentinel also flips the state map's `initialized` flag.
//!
//! Note: This binary must be built for the bpfel-unknown-none target.

#![no_std]
#![no_main]

use aya_ebpf::{
    helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid},
    macros::{fentry, map},
    maps::{Array, RingBuf},
    programs::FEntryContext,
};
use aya_log_ebpf::info;
use hooktail_common::{FcntlEvent, StateValue, COMM_LEN, STATE_KEY};

/// 256KB holds roughly 10K events before the kernel starts dropping.
const RING_BUF_SIZE: u32 = 256 * 1024;

#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(RING_BUF_SIZE, 0);

#[map]
static STATE: Array<StateValue> = Array::with_max_entries(1, 0);

#[fentry(function = "security_file_fcntl")]
pub fn security_file_fcntl(ctx: FEntryContext) -> u32 {
    match try_security_file_fcntl(&ctx) {
        Ok(ret) => ret,
        Err(ret) => ret,
    }
}

fn try_security_file_fcntl(ctx: &FEntryContext) -> Result<u32, u32> {
    let state = STATE.get_ptr_mut(STATE_KEY).ok_or(1u32)?;

    // SAFETY: the pointer comes from a successful map lookup and stays valid
    // for the duration of the program.
    unsafe {
        if (*state).initialized == 0 {
            (*state).initialized = 1;
            info!(ctx, "state initialized");
        }
        (*state).hits += 1;
    }

    let pid_tgid = bpf_get_current_pid_tgid();
    let comm = bpf_get_current_comm().unwrap_or([0u8; COMM_LEN]);

    if let Some(mut entry) = EVENTS.reserve::<FcntlEvent>(0) {
        entry.write(FcntlEvent {
            comm,
            pid: pid_tgid as u32,
            tgid: (pid_tgid >> 32) as u32,
        });
        entry.submit(0);
    }

    Ok(0)
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
