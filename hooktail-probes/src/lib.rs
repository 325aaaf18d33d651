//! eBPF probes for hooktail
//!
//! - `fcntl_probe`: fentry on `security_file_fcntl`, streams the calling
//!   task over a ring buffer
//! - `guard_probe`: directly invoked program exercising the state map's
//!   init guard, reports through the kernel trace log
//!
//! eBPF probe implementations are in src/bin/

#![cfg_attr(not(test), no_std)]

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
