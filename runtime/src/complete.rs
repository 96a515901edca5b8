//! Resolves the host proxy's `RUNQ_*` environment overrides against a
//! decoded descriptor (spec §6.2), mirroring the original's
//! `completeVmdata()`. Env is consumed once, then the caller is expected to
//! clear it.

use crate::env::{parse_runq_disk, parse_runq_mount, valid_uuid, EmbeddedDiskSpec};
use rand::Rng;
use runq_core::descriptor::{Data, Disk, DiskType};
use runq_core::{Result, RunqError};

const TRUTHY: &[&str] = &["1", "on", "yes", "true"];

fn is_truthy(v: &str) -> bool {
    TRUTHY.contains(&v.to_ascii_lowercase().as_str())
}

/// Applies `RUNQ_CPU`/`RUNQ_MEM`/`RUNQ_DNS*`/`RUNQ_NOEXEC`/`RUNQ_RUNQENV`/
/// `RUNQ_SYSTEMD`/`RUNQ_CPUARGS`/`RUNQ_ROOTDISK`/`RUNQ_DISK`/`RUNQ_MOUNT`/
/// `RUNQ_APUUID` overrides onto a decoded descriptor, reading from the
/// process environment via the supplied lookup function (injected so tests
/// don't need to mutate real env vars). Syntax errors in `RUNQ_DISK`/
/// `RUNQ_MOUNT`/`RUNQ_APUUID` are fatal at proxy startup (spec §6.5).
pub fn apply_env_overrides<F: Fn(&str) -> Option<String>>(data: &mut Data, get: F) -> Result<()> {
    if let Some(v) = get("RUNQ_CPU") {
        if let Ok(n) = v.parse() {
            data.cpu = n;
        }
    }
    if let Some(v) = get("RUNQ_MEM") {
        if let Ok(n) = v.parse() {
            data.mem_mib = n;
        }
    }
    if let Some(v) = get("RUNQ_CPUARGS") {
        data.cpu_args = v;
    }
    if let Some(v) = get("RUNQ_DNS") {
        data.dns.server = v.split(',').map(String::from).collect();
    }
    if let Some(v) = get("RUNQ_DNS_OPTS") {
        data.dns.options = v.split(',').map(String::from).collect();
    }
    if let Some(v) = get("RUNQ_DNS_SEARCH") {
        data.dns.search = v.split(',').map(String::from).collect();
    }
    if let Some(v) = get("RUNQ_NOEXEC") {
        data.no_exec = is_truthy(&v);
    }
    if let Some(v) = get("RUNQ_RUNQENV") {
        data.entrypoint.runqenv = is_truthy(&v);
    }
    if let Some(v) = get("RUNQ_SYSTEMD") {
        data.entrypoint.systemd = is_truthy(&v);
    }
    if let Some(v) = get("RUNQ_ROOTDISK") {
        data.root_disk_id = Some(v);
    }
    if let Some(v) = get("RUNQ_DISK") {
        for spec in parse_runq_disk(&v)? {
            data.disks.push(embedded_disk_to_disk(spec));
        }
    }
    if let Some(v) = get("RUNQ_MOUNT") {
        for spec in parse_runq_mount(&v)? {
            let disk = data
                .disks
                .iter_mut()
                .find(|d| d.id == spec.id)
                .ok_or_else(|| RunqError::Configuration(format!("RUNQ_MOUNT references unknown disk id: {:?}", spec.id)))?;
            disk.mount = true;
            disk.options = spec.options;
        }
    }
    if let Some(v) = get("RUNQ_APUUID") {
        if !valid_uuid(&v) {
            return Err(RunqError::Configuration(format!("invalid RUNQ_APUUID: {v:?}")));
        }
        data.ap_device = Some(v);
    }
    Ok(())
}

/// Reads `RUNQ_ROOTDISK_EXCLUDE`'s comma-separated paths, appended to the
/// fixed rsync exclusion set when populating a root disk (spec §4.3 step 3).
/// Host-local; not part of the transported descriptor.
pub fn rootdisk_excludes<F: Fn(&str) -> Option<String>>(get: F) -> Vec<String> {
    get("RUNQ_ROOTDISK_EXCLUDE")
        .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect())
        .unwrap_or_default()
}

/// Generates a 12-character random serial the way the original's
/// `util.RandStr(12)` does, distinguishing embedded disks at the block
/// device layer.
fn random_serial() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..12).map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char).collect()
}

/// Materializes an `EmbeddedDiskSpec` parsed from `RUNQ_DISK` into a
/// descriptor [`Disk`] record. `disk_type` is left `Unknown`; the host
/// proxy's own disk-type sniffing pass fills it in once the backing file
/// exists, the same as for any other disk.
fn embedded_disk_to_disk(spec: EmbeddedDiskSpec) -> Disk {
    let path = spec
        .img
        .clone()
        .unwrap_or_else(|| format!("{}/{}.img", spec.dir.as_deref().unwrap_or("/var/lib/runq/disks"), spec.id));
    Disk {
        id: spec.id,
        path,
        cache: spec.cache,
        dir: spec.dir,
        fstype: spec.fstype,
        mount: spec.mount,
        serial: random_serial(),
        disk_type: DiskType::Unknown,
        options: spec.options,
    }
}

/// Derives `HOME` for the resolved UID the way the original's
/// `util.UserHome()` does: `/root` for UID 0, `/home/<uid>` otherwise
/// (the guest has no real user database to consult at descriptor-build
/// time).
pub fn derive_home(uid: u32) -> String {
    if uid == 0 {
        "/root".to_string()
    } else {
        format!("/home/{uid}")
    }
}

/// Builds the entrypoint's sorted env list from the host's current
/// environment (skipping any pre-existing `HOME=`) plus the derived
/// `HOME`, matching `completeVmdata()`'s `os.Environ()` pass.
pub fn build_entrypoint_env(host_env: impl Iterator<Item = (String, String)>, uid: u32) -> Vec<String> {
    let mut env: Vec<String> = host_env
        .filter(|(k, _)| k != "HOME")
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    env.push(format!("HOME={}", derive_home(uid)));
    env.sort();
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use runq_core::descriptor::*;
    use std::collections::HashMap;

    fn sample_data() -> Data {
        Data {
            container_id: "deadbeefcafebabe0011223344556677".into(),
            git_commit: "abc".into(),
            cpu: 1,
            cpu_args: "host".into(),
            mem_mib: 512,
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
                env: vec![],
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
    fn test_apply_env_overrides() {
        let mut data = sample_data();
        let env: HashMap<&str, &str> = HashMap::from([
            ("RUNQ_CPU", "4"),
            ("RUNQ_MEM", "2048"),
            ("RUNQ_DNS", "8.8.8.8,1.1.1.1"),
            ("RUNQ_NOEXEC", "true"),
        ]);
        apply_env_overrides(&mut data, |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(data.cpu, 4);
        assert_eq!(data.mem_mib, 2048);
        assert_eq!(data.dns.server, vec!["8.8.8.8", "1.1.1.1"]);
        assert!(data.no_exec);
    }

    #[test]
    fn test_apply_env_overrides_leaves_unset_fields_untouched() {
        let mut data = sample_data();
        apply_env_overrides(&mut data, |_| None).unwrap();
        assert_eq!(data.cpu, 1);
        assert_eq!(data.mem_mib, 512);
    }

    #[test]
    fn test_apply_env_overrides_materializes_runq_disk() {
        let mut data = sample_data();
        let env: HashMap<&str, &str> = HashMap::from([("RUNQ_DISK", "id=data,dir=/data,size=1G,mount=1")]);
        apply_env_overrides(&mut data, |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(data.disks.len(), 1);
        assert_eq!(data.disks[0].id, "data");
        assert_eq!(data.disks[0].path, "/data/data.img");
        assert!(data.disks[0].mount);
        assert_eq!(data.disks[0].serial.len(), 12);
    }

    #[test]
    fn test_apply_env_overrides_runq_mount_sets_options_on_existing_disk() {
        let mut data = sample_data();
        data.disks.push(Disk {
            id: "ext".into(),
            path: "/dev/sdb".into(),
            cache: "none".into(),
            dir: None,
            fstype: None,
            mount: false,
            serial: "abc".into(),
            disk_type: DiskType::BlockDevice,
            options: vec![],
        });
        let env: HashMap<&str, &str> = HashMap::from([("RUNQ_MOUNT", "id=ext,options=noatime+ro")]);
        apply_env_overrides(&mut data, |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert!(data.disks[0].mount);
        assert_eq!(data.disks[0].options, vec!["noatime", "ro"]);
    }

    #[test]
    fn test_apply_env_overrides_runq_mount_unknown_disk_id_is_error() {
        let mut data = sample_data();
        let env: HashMap<&str, &str> = HashMap::from([("RUNQ_MOUNT", "id=missing,options=ro")]);
        assert!(apply_env_overrides(&mut data, |k| env.get(k).map(|v| v.to_string())).is_err());
    }

    #[test]
    fn test_apply_env_overrides_runq_apuuid_valid_and_invalid() {
        let mut data = sample_data();
        let env: HashMap<&str, &str> = HashMap::from([("RUNQ_APUUID", "550e8400-e29b-41d4-a716-446655440000")]);
        apply_env_overrides(&mut data, |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(data.ap_device.as_deref(), Some("550e8400-e29b-41d4-a716-446655440000"));

        let mut data = sample_data();
        let env: HashMap<&str, &str> = HashMap::from([("RUNQ_APUUID", "not-a-uuid")]);
        assert!(apply_env_overrides(&mut data, |k| env.get(k).map(|v| v.to_string())).is_err());
    }

    #[test]
    fn test_rootdisk_excludes_parses_comma_list() {
        let env: HashMap<&str, &str> = HashMap::from([("RUNQ_ROOTDISK_EXCLUDE", "/tmp, /var/cache")]);
        let excludes = rootdisk_excludes(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(excludes, vec!["/tmp".to_string(), "/var/cache".to_string()]);
    }

    #[test]
    fn test_rootdisk_excludes_empty_when_unset() {
        assert!(rootdisk_excludes(|_| None).is_empty());
    }

    #[test]
    fn test_derive_home() {
        assert_eq!(derive_home(0), "/root");
        assert_eq!(derive_home(1000), "/home/1000");
    }

    #[test]
    fn test_build_entrypoint_env_sorted_and_home_derived() {
        let env = build_entrypoint_env(
            vec![("PATH".to_string(), "/usr/bin".to_string()), ("HOME".to_string(), "/old".to_string())]
                .into_iter(),
            1000,
        );
        assert_eq!(env, vec!["HOME=/home/1000".to_string(), "PATH=/usr/bin".to_string()]);
    }
}
