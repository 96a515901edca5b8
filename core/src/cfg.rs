//! Fixed constants shared by the host proxy and the guest init.
//!
//! These values are not configurable; they are part of the protocol the two
//! supervisors agree on ahead of time.

use std::collections::HashMap;
use std::time::Duration;

/// Minimum guest memory, in MiB.
pub const MIN_MEM_MIB: u32 = 64;

/// Default kernel command line appended to the hypervisor's `-append`.
pub const KERNEL_PARAMETERS: &str = "console=ttyS0 panic=1 module.sig_enforce=1 loglevel=3";

/// Path, inside the sandboxed rootfs, where the entrypoint's environment is
/// written when `runqenv` is requested.
pub const ENVFILE: &str = "/.runqenv";

/// Interval between non-blocking reaper sweeps in the guest init.
pub const REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Descriptor handshake timeout base, in seconds; the full timeout is
/// `DESCRIPTOR_ACK_TIMEOUT_BASE_SECS + mem_mib / DESCRIPTOR_ACK_TIMEOUT_MEM_DIVISOR`.
pub const DESCRIPTOR_ACK_TIMEOUT_BASE_SECS: u64 = 10;
pub const DESCRIPTOR_ACK_TIMEOUT_MEM_DIVISOR: u32 = 2048;

/// Ack timeout for protocol turns other than the initial handshake.
pub const ACK_TIMEOUT: Duration = Duration::from_millis(100);

/// Bound on the final cleanup sequence before the reboot syscall fires
/// unconditionally.
pub const CLEANUP_WATCHDOG: Duration = Duration::from_secs(10);

/// Window to claim a vsock JobID before it is dropped from the registry.
pub const JOB_CLAIM_WINDOW: Duration = Duration::from_secs(1);

/// Window to wait for the `Done` ack after a vsock job's exit code is
/// written to the control connection.
pub const JOB_DONE_ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// Deadline for the virtio-serial port to appear under
/// `/sys/class/virtio-ports`.
pub const VIRTIO_PORT_POLL_TIMEOUT: Duration = Duration::from_secs(1);
pub const VIRTIO_PORT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Signals the host proxy forwards to the guest over C2.
pub const SIGNALS: &[i32] = &[
    libc::SIGHUP,
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGTERM,
    libc::SIGUSR1,
    libc::SIGUSR2,
    libc::SIGCONT,
    libc::SIGSTOP,
];

/// Default sysctls applied before the descriptor's own sysctl map.
pub fn sysctl_default() -> HashMap<&'static str, &'static str> {
    HashMap::from([
        ("fs.file-max", "9223372036854775807"),
        ("kernel.panic_on_oops", "1"),
        ("net.ipv6.conf.all.disable_ipv6", "1"),
        ("net.ipv6.conf.default.disable_ipv6", "1"),
        ("vm.overcommit_memory", "0"),
        ("vm.panic_on_oom", "0"),
    ])
}

/// Mandatory sysctls applied after the descriptor's own sysctl map,
/// overriding anything the user supplied.
pub fn sysctl_override() -> HashMap<&'static str, &'static str> {
    HashMap::from([("kernel.kexec_load_disabled", "1")])
}

/// Default rlimits, expressed as (soft, hard), merged underneath whatever
/// the descriptor's entrypoint supplies.
pub fn default_rlimits() -> HashMap<&'static str, (u64, u64)> {
    HashMap::from([
        ("RLIMIT_NOFILE", (65536, 65536)),
        ("RLIMIT_NPROC", (u64::MAX, u64::MAX)),
        ("RLIMIT_SIGPENDING", (65536, 65536)),
    ])
}

/// OCI rlimit name -> POSIX resource constant, used to validate and apply
/// the entrypoint's `rlimits` map.
pub fn rlimits_map() -> HashMap<&'static str, nix::sys::resource::Resource> {
    use nix::sys::resource::Resource::*;
    HashMap::from([
        ("RLIMIT_CPU", RLIMIT_CPU),
        ("RLIMIT_FSIZE", RLIMIT_FSIZE),
        ("RLIMIT_DATA", RLIMIT_DATA),
        ("RLIMIT_STACK", RLIMIT_STACK),
        ("RLIMIT_CORE", RLIMIT_CORE),
        ("RLIMIT_RSS", RLIMIT_RSS),
        ("RLIMIT_NPROC", RLIMIT_NPROC),
        ("RLIMIT_NOFILE", RLIMIT_NOFILE),
        ("RLIMIT_MEMLOCK", RLIMIT_MEMLOCK),
        ("RLIMIT_AS", RLIMIT_AS),
        ("RLIMIT_LOCKS", RLIMIT_LOCKS),
        ("RLIMIT_SIGPENDING", RLIMIT_SIGPENDING),
        ("RLIMIT_MSGQUEUE", RLIMIT_MSGQUEUE),
        ("RLIMIT_NICE", RLIMIT_NICE),
        ("RLIMIT_RTPRIO", RLIMIT_RTPRIO),
        ("RLIMIT_RTTIME", RLIMIT_RTTIME),
    ])
}

/// Paths masked inside the sandbox child (bind `/dev/null` over files;
/// tmpfs-ro over directories).
pub const MASKED_PATHS: &[&str] = &[
    "/proc/kcore",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/proc/scsi",
    "/sys/firmware",
];

/// Paths recursively bind-mounted and remounted read-only inside the
/// sandbox child.
pub const READONLY_PATHS: &[&str] = &["/proc/bus", "/proc/sysrq-trigger"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysctl_default_matches_original() {
        let m = sysctl_default();
        assert_eq!(m.get("kernel.panic_on_oops"), Some(&"1"));
        assert_eq!(m.len(), 6);
    }

    #[test]
    fn test_sysctl_override_is_minimal() {
        let m = sysctl_override();
        assert_eq!(m.get("kernel.kexec_load_disabled"), Some(&"1"));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_default_rlimits_contains_nofile() {
        let m = default_rlimits();
        assert_eq!(m.get("RLIMIT_NOFILE"), Some(&(65536, 65536)));
    }

    #[test]
    fn test_rlimits_map_has_sixteen_entries() {
        assert_eq!(rlimits_map().len(), 16);
    }

    #[test]
    fn test_masked_and_readonly_paths_nonempty() {
        assert!(MASKED_PATHS.contains(&"/sys/firmware"));
        assert!(READONLY_PATHS.contains(&"/proc/sysrq-trigger"));
    }

    #[test]
    fn test_descriptor_ack_timeout_formula() {
        let mem_mib = 4096u32;
        let timeout =
            DESCRIPTOR_ACK_TIMEOUT_BASE_SECS + (mem_mib / DESCRIPTOR_ACK_TIMEOUT_MEM_DIVISOR) as u64;
        assert_eq!(timeout, 12);
    }
}
