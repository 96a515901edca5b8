//! The VM descriptor: the single structured datum describing everything
//! needed to boot the guest and run the user process (spec §3).
//!
//! Ported field-for-field from the original implementation's `pkg/vm/types.go`.
//! Every type here round-trips through [`crate::codec`]; `Data` is the root.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Disk backing format, discovered by [`crate::descriptor::Disk`] detection
/// logic living in `runq-runtime` (kept out of this crate so the pure
/// schema has no filesystem-probing dependency).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskType {
    Unknown,
    BlockDevice,
    Qcow2Image,
    RawFile,
}

/// Soft/hard rlimit pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rlimit {
    pub soft: u64,
    pub hard: u64,
}

/// The five capability sets applied to the sandbox child. All five are
/// descriptor-driven (see DESIGN.md's open-question resolution).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppCapabilities {
    pub ambient: Vec<String>,
    pub bounding: Vec<String>,
    pub effective: Vec<String>,
    pub inheritable: Vec<String>,
    pub permitted: Vec<String>,
}

impl AppCapabilities {
    /// True if `CAP_SYS_ADMIN` is present in the effective set — the
    /// condition that (together with `no_new_privileges`) decides the
    /// seccomp/capability-drop ordering in the sandbox child (spec §4.4.1
    /// step 9).
    pub fn has_sysadmin_effective(&self) -> bool {
        self.effective.iter().any(|c| c == "CAP_SYS_ADMIN")
    }
}

/// One guest network interface, matched to a descriptor record by MAC
/// address rather than by interface enumeration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    pub mac_address: String,
    pub mtu: u32,
    pub addrs: Vec<String>,
    pub gateway: Option<String>,
    pub tap_device: String,
}

/// One storage disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    pub id: String,
    pub path: String,
    pub cache: String,
    pub dir: Option<String>,
    pub fstype: Option<String>,
    pub mount: bool,
    pub serial: String,
    pub disk_type: DiskType,
    /// `+`-separated mount options from `RUNQ_DISK`/`RUNQ_MOUNT` (spec §6.5).
    pub options: Vec<String>,
}

/// An extra mount applied inside the guest after the shared root is
/// mounted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub id: String,
    pub source: String,
    pub target: String,
    pub fstype: String,
    pub flags: u64,
    pub data: String,
}

/// Target user/group identity for the entrypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub uid: u32,
    pub gid: u32,
}

/// Certificate material for the vsock daemon's mutually-authenticated TLS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificates {
    pub ca_cert: Vec<u8>,
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

/// DNS configuration resolved by the host proxy and applied by the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dns {
    pub server: Vec<String>,
    pub options: Vec<String>,
    pub search: Vec<String>,
}

/// The entrypoint descriptor: everything the sandbox child needs to apply
/// final privilege reductions and exec the user command (spec §4.4.1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entrypoint {
    pub user: User,
    pub additional_gids: Vec<u32>,
    pub args: Vec<String>,
    pub capabilities: AppCapabilities,
    pub cwd: String,
    /// Bind-mount path for `docker-init`, empty if not requested.
    pub docker_init: String,
    /// Sorted `NAME=value` pairs; `HOME` is derived from the resolved UID.
    pub env: Vec<String>,
    pub no_new_privileges: bool,
    pub rlimits: HashMap<String, Rlimit>,
    /// Opaque encoded blob of the OCI seccomp document; empty means no
    /// filter is installed (`--security-opt seccomp=unconfined`).
    pub seccomp: Vec<u8>,
    pub systemd: bool,
    pub terminal: bool,
    /// If set, entrypoint env is written to `/.runqenv` after chroot.
    pub runqenv: bool,
}

/// The vsock daemon's sub-descriptor, present iff vsock is enabled.
/// `entrypoint_pid` is filled in by C4 once the sandbox child's PID is
/// known — the one field the descriptor is mutated after transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vsockd {
    pub certificates: Certificates,
    pub entrypoint_pid: Option<u32>,
    pub entrypoint_env: Vec<String>,
    pub cid: u32,
}

/// The root descriptor, produced once by the outer runtime and decoded
/// twice: once in C3, once in C4 after transport over C2.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Data {
    pub container_id: String,
    pub git_commit: String,
    pub cpu: u32,
    pub cpu_args: String,
    pub mem_mib: u32,
    pub nested_vm: bool,
    pub hostname: String,
    pub sysctl: HashMap<String, String>,
    pub disks: Vec<Disk>,
    pub root_disk_id: Option<String>,
    pub networks: Vec<Network>,
    pub dns: Dns,
    pub mounts: Vec<Mount>,
    pub masked_paths: Vec<String>,
    pub readonly_paths: Vec<String>,
    pub entrypoint: Entrypoint,
    pub vsockd: Option<Vsockd>,
    pub ap_device: Option<String>,
    pub no_exec: bool,
}

impl Data {
    /// 32-bit vsock context ID, derived from the first 8 hex chars of the
    /// container ID. Reserved values `{0,1,2,2^32-1}` are excluded.
    pub fn context_id(&self) -> crate::Result<u32> {
        let prefix: String = self.container_id.chars().take(8).collect();
        if prefix.len() < 8 || !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(crate::RunqError::Configuration(format!(
                "container id {:?} too short or non-hex for a context id",
                self.container_id
            )));
        }
        let cid = u32::from_str_radix(&prefix, 16).map_err(|e| {
            crate::RunqError::Configuration(format!("invalid context id prefix: {e}"))
        })?;
        if cid < 3 || cid == u32::MAX {
            return Err(crate::RunqError::Configuration(format!(
                "context id {cid} is reserved"
            )));
        }
        Ok(cid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data() -> Data {
        Data {
            container_id: "deadbeefcafebabe0011223344556677".into(),
            git_commit: "abc123".into(),
            cpu: 2,
            cpu_args: "host".into(),
            mem_mib: 1024,
            nested_vm: false,
            hostname: "box".into(),
            sysctl: HashMap::new(),
            disks: vec![],
            root_disk_id: None,
            networks: vec![],
            dns: Dns::default(),
            mounts: vec![],
            masked_paths: vec![],
            readonly_paths: vec![],
            entrypoint: Entrypoint {
                user: User { uid: 0, gid: 0 },
                additional_gids: vec![],
                args: vec!["/bin/sh".into()],
                capabilities: AppCapabilities::default(),
                cwd: "/".into(),
                docker_init: String::new(),
                env: vec!["PATH=/usr/bin".into()],
                no_new_privileges: false,
                rlimits: HashMap::new(),
                seccomp: vec![],
                systemd: false,
                terminal: false,
                runqenv: false,
            },
            vsockd: None,
            ap_device: None,
            no_exec: false,
        }
    }

    #[test]
    fn test_context_id_from_hex_prefix() {
        let d = sample_data();
        assert_eq!(d.context_id().unwrap(), 0xdeadbeef);
    }

    #[test]
    fn test_context_id_rejects_reserved() {
        let mut d = sample_data();
        d.container_id = "00000002aaaaaaaaaaaaaaaaaaaaaaaa".into();
        assert!(d.context_id().is_err());
    }

    #[test]
    fn test_context_id_rejects_short_id() {
        let mut d = sample_data();
        d.container_id = "abc".into();
        assert!(d.context_id().is_err());
    }

    #[test]
    fn test_has_sysadmin_effective() {
        let mut caps = AppCapabilities::default();
        assert!(!caps.has_sysadmin_effective());
        caps.effective.push("CAP_SYS_ADMIN".into());
        assert!(caps.has_sysadmin_effective());
    }
}
