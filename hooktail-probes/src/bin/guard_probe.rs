//! Init-guard probe, invoked directly through BPF_PROG_TEST_RUN
//!
//! The programs never see real traffic: userspace runs them with a dummy
//! frame. `init_guard` arms the state on the first run and reports "already
//! initialized" on every later run. `guard_tick` is the periodic callback:
//! userspace fires it once per interval and it counts and reports each
//! firing. Output goes to the kernel trace log (bpf_printk) which userspace
//! tails.

#![no_std]
#![no_main]

use aya_ebpf::{bpf_printk, macros::map, macros::xdp, maps::Array, programs::XdpContext};
use hooktail_common::{StateValue, GUARD_EINVAL, STATE_KEY};

#[map]
static STATE: Array<StateValue> = Array::with_max_entries(1, 0);

#[xdp]
pub fn init_guard(_ctx: XdpContext) -> u32 {
    let Some(state) = STATE.get_ptr_mut(STATE_KEY) else {
        unsafe { bpf_printk!(b"error: no map value") };
        return 1;
    };

    // SAFETY: pointer from a successful lookup, valid for this invocation.
    unsafe {
        (*state).hits += 1;
        match (*state).initialized {
            0 => {}
            1 => {
                bpf_printk!(b"info: timer already initialized");
                return 0;
            }
            other => {
                bpf_printk!(b"error: timer_init: initialized=%llu", other);
                return GUARD_EINVAL;
            }
        }
        (*state).initialized = 1;
        bpf_printk!(b"info: timer initialized");
    }

    0
}

#[xdp]
pub fn guard_tick(_ctx: XdpContext) -> u32 {
    let Some(state) = STATE.get_ptr_mut(STATE_KEY) else {
        unsafe { bpf_printk!(b"error: no map value") };
        return 1;
    };

    // SAFETY: as above.
    unsafe {
        if (*state).initialized != 1 {
            bpf_printk!(b"error: timer_callback: timer not initialized");
            return 1;
        }
        let called = (*state).callbacks;
        (*state).callbacks = called + 1;
        bpf_printk!(b"timer_callback: %llu", called);
    }

    0
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
