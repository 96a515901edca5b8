//! Single-shot guest shutdown (spec §9 design note: shutdown happens at
//! most once per guest). Acks the host over C2, gives it a short window to
//! ack the ack, then runs a time-bounded cleanup and reboots unconditionally
//! regardless of how far cleanup got.

use nix::mount::{umount2, MntFlags};
use nix::sys::reboot::{reboot, RebootMode};
use nix::unistd::sync;
use runq_core::cfg::CLEANUP_WATCHDOG;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

static SHUTDOWN_STARTED: AtomicBool = AtomicBool::new(false);

const JOURNALED_FSTYPES: &[&str] = &["ext2", "ext3", "ext4", "xfs", "btrfs"];
const MAX_UNMOUNT_PASSES: u32 = 10;

/// Claims the single shutdown slot. Returns `false` if shutdown has
/// already started elsewhere, so callers never run the sequence twice.
pub fn begin() -> bool {
    SHUTDOWN_STARTED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

/// Maps an entrypoint exit to the byte reported on C2's shutdown ack:
/// systemd remaps `SIGINT` to `0` and anything else to `1`; otherwise the
/// Bash convention of `128 + signal` applies (a normal exit reports its own
/// status and never reaches this function).
pub fn exit_code_for_shutdown(systemd: bool, signal: Option<i32>) -> i32 {
    match (systemd, signal) {
        (true, Some(libc::SIGINT)) => 0,
        (true, Some(_)) => 1,
        (true, None) => 0,
        (false, Some(sig)) => 128 + sig,
        (false, None) => 0,
    }
}

/// Picks the reboot syscall mode from the reported ack byte: in systemd
/// mode, `0` (SIGINT) powers off and anything else reboots; outside
/// systemd mode the guest VM always powers off.
pub fn reboot_mode_for(systemd: bool, ack_code: i32) -> RebootMode {
    if systemd && ack_code != 0 {
        RebootMode::RB_AUTOBOOT
    } else {
        RebootMode::RB_POWER_OFF
    }
}

/// Runs the bounded cleanup sequence, then reboots unconditionally. Never
/// returns.
pub async fn run(mode: RebootMode) -> ! {
    let cleanup = tokio::time::timeout(CLEANUP_WATCHDOG, cleanup());
    if cleanup.await.is_err() {
        tracing::warn!("cleanup exceeded watchdog, rebooting anyway");
    }
    let _ = reboot(mode);
    // reboot(2) does not return on success; if we get here it failed.
    std::process::exit(1);
}

async fn cleanup() {
    disable_printk();
    kill_all();
    sync();
    for pass in 0..MAX_UNMOUNT_PASSES {
        let remaining = unmount_pass();
        if remaining == 0 {
            break;
        }
        tracing::debug!(pass, remaining, "unmount pass left mounts behind");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    sync();
}

fn disable_printk() {
    let _ = std::fs::write("/proc/sys/kernel/printk", "0\n");
}

fn kill_all() {
    unsafe {
        libc::kill(-1, libc::SIGKILL);
    }
}

/// One reverse-order pass over `/proc/mounts`, unmounting journaled
/// filesystems. Returns how many mount points were attempted but failed.
fn unmount_pass() -> usize {
    let Ok(contents) = std::fs::read_to_string("/proc/mounts") else {
        return 0;
    };
    let mut targets: Vec<(&str, &str)> = contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _source = fields.next()?;
            let target = fields.next()?;
            let fstype = fields.next()?;
            JOURNALED_FSTYPES.contains(&fstype).then_some((target, fstype))
        })
        .collect();
    targets.reverse();

    let mut failures = 0;
    for (target, _) in targets {
        if umount2(target, MntFlags::MNT_DETACH).is_err() {
            failures += 1;
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_claims_once() {
        assert!(begin());
        assert!(!begin());
    }

    #[test]
    fn test_exit_code_systemd_sigint_is_zero() {
        assert_eq!(exit_code_for_shutdown(true, Some(libc::SIGINT)), 0);
    }

    #[test]
    fn test_exit_code_systemd_other_signal_is_one() {
        assert_eq!(exit_code_for_shutdown(true, Some(libc::SIGTERM)), 1);
    }

    #[test]
    fn test_exit_code_non_systemd_bash_convention() {
        assert_eq!(exit_code_for_shutdown(false, Some(libc::SIGTERM)), 128 + libc::SIGTERM);
    }

    #[test]
    fn test_exit_code_non_systemd_no_signal_is_zero() {
        assert_eq!(exit_code_for_shutdown(false, None), 0);
    }

    #[test]
    fn test_reboot_mode_systemd_sigint_powers_off() {
        assert_eq!(reboot_mode_for(true, 0), RebootMode::RB_POWER_OFF);
    }

    #[test]
    fn test_reboot_mode_systemd_other_reboots() {
        assert_eq!(reboot_mode_for(true, 1), RebootMode::RB_AUTOBOOT);
    }

    #[test]
    fn test_reboot_mode_non_systemd_always_powers_off() {
        assert_eq!(reboot_mode_for(false, 1), RebootMode::RB_POWER_OFF);
    }
}
