//! Root filesystem mounting, descriptor-driven extra mounts, sysctls,
//! hostname, and disk discovery (spec §4.4 steps 6, 7, 9).

use nix::mount::{mount, MsFlags};
use runq_core::descriptor::{Data, Disk};
use runq_core::{Result, RunqError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const ROOTFS_MOUNT_TAG: &str = "rootfs";
const SHARE_MOUNT_TAG: &str = "share";

/// Mounts the 9p "rootfs" share directly at `/rootfs`, or — if a root disk
/// is configured — the root-disk block device at `/rootfs` plus the
/// "share" 9p mount at `/rootfs/lib/modules`. Always leaves
/// `/lib/modules -> /rootfs/lib/modules`.
pub fn mount_root(data: &Data) -> Result<()> {
    std::fs::create_dir_all("/rootfs").ok();

    match &data.root_disk_id {
        None => {
            mount_9p(ROOTFS_MOUNT_TAG, "/rootfs")?;
        }
        Some(root_disk_id) => {
            let dev = find_disk_by_serial(root_disk_id)?;
            mount(
                Some(dev.as_path()),
                "/rootfs",
                Some("ext4"),
                MsFlags::empty(),
                None::<&str>,
            )
            .map_err(|e| RunqError::Boot(format!("mount root disk {dev:?} failed: {e}")))?;
            std::fs::create_dir_all("/rootfs/lib/modules").ok();
            mount_9p(SHARE_MOUNT_TAG, "/rootfs/lib/modules")?;
        }
    }

    let _ = std::fs::remove_file("/lib/modules");
    std::os::unix::fs::symlink("/rootfs/lib/modules", "/lib/modules")
        .or_else(|e| if e.kind() == std::io::ErrorKind::AlreadyExists { Ok(()) } else { Err(e) })
        .map_err(|e| RunqError::Boot(format!("symlink /lib/modules failed: {e}")))?;

    Ok(())
}

fn mount_9p(tag: &str, target: &str) -> Result<()> {
    mount(
        Some(tag),
        target,
        Some("9p"),
        MsFlags::empty(),
        Some("trans=virtio,version=9p2000.L"),
    )
    .map_err(|e| RunqError::Boot(format!("9p mount {tag} at {target} failed: {e}")))
}

/// Applies every descriptor mount under `/rootfs/...`.
pub fn apply_extra_mounts(data: &Data) -> Result<()> {
    for m in &data.mounts {
        let target = format!("/rootfs{}", m.target);
        std::fs::create_dir_all(&target).ok();
        let flags = MsFlags::from_bits_truncate(m.flags);
        mount(
            Some(m.source.as_str()),
            target.as_str(),
            Some(m.fstype.as_str()),
            flags,
            Some(m.data.as_str()),
        )
        .map_err(|e| RunqError::Boot(format!("mount {} -> {target} failed: {e}", m.source)))?;
    }
    Ok(())
}

/// Layers default, descriptor, then override sysctls, returning the final
/// merged map applied in that precedence order (later layers win).
pub fn merge_sysctls(descriptor_sysctl: &HashMap<String, String>) -> HashMap<String, String> {
    let mut merged: HashMap<String, String> = runq_core::cfg::sysctl_default()
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    merged.extend(descriptor_sysctl.clone());
    merged.extend(
        runq_core::cfg::sysctl_override()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string())),
    );
    merged
}

/// Writes each sysctl via `/proc/sys/<dotted.path.as.slashes>`.
pub fn apply_sysctls(sysctls: &HashMap<String, String>) -> Result<()> {
    for (key, value) in sysctls {
        let path = format!("/proc/sys/{}", key.replace('.', "/"));
        if let Err(e) = std::fs::write(&path, value) {
            tracing::warn!(sysctl = %key, error = %e, "failed to apply sysctl");
        }
    }
    Ok(())
}

pub fn set_hostname(hostname: &str) -> Result<()> {
    nix::unistd::sethostname(hostname).map_err(|e| RunqError::Boot(format!("sethostname failed: {e}")))
}

/// Finds a disk's block device under `/sys/block/*/serial`, matching the
/// descriptor's `serial` field exactly.
pub fn find_disk_by_serial(serial: &str) -> Result<PathBuf> {
    find_disk_by_serial_in(serial, "/sys/block")
}

fn find_disk_by_serial_in(serial: &str, sys_block_dir: &str) -> Result<PathBuf> {
    let entries = std::fs::read_dir(sys_block_dir)
        .map_err(|e| RunqError::Boot(format!("read_dir {sys_block_dir} failed: {e}")))?;
    for entry in entries.flatten() {
        let serial_path = entry.path().join("serial");
        if let Ok(contents) = std::fs::read_to_string(&serial_path) {
            if contents.trim() == serial {
                let name = entry.file_name();
                return Ok(PathBuf::from("/dev").join(name));
            }
        }
    }
    Err(RunqError::Boot(format!("no block device with serial {serial:?}")))
}

/// For every descriptor disk: find it by serial, symlink it under
/// `/dev/disk/by-runq-id/<id>`, and — if requested — mount it.
pub fn setup_disks(disks: &[Disk]) -> Result<()> {
    std::fs::create_dir_all("/dev/disk/by-runq-id").ok();
    for disk in disks {
        let dev = find_disk_by_serial(&disk.serial)?;
        let link = PathBuf::from("/dev/disk/by-runq-id").join(&disk.id);
        let _ = std::fs::remove_file(&link);
        std::os::unix::fs::symlink(&dev, &link)
            .map_err(|e| RunqError::Boot(format!("symlink {link:?} failed: {e}")))?;

        if disk.mount {
            let dir = disk.dir.as_deref().unwrap_or("/");
            let target = format!("/rootfs{dir}");
            std::fs::create_dir_all(&target).ok();
            let fstype = disk.fstype.as_deref();
            let options = (!disk.options.is_empty()).then(|| disk.options.join(","));
            mount(
                Some(dev.as_path()),
                target.as_str(),
                fstype,
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
                options.as_deref(),
            )
            .map_err(|e| RunqError::Boot(format!("mount disk {} at {target} failed: {e}", disk.id)))?;
        }
    }
    Ok(())
}

#[allow(dead_code)]
fn assert_is_dir(p: &Path) -> bool {
    p.is_dir()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_merge_sysctls_override_wins_over_descriptor() {
        let mut descriptor = HashMap::new();
        descriptor.insert("kernel.kexec_load_disabled".to_string(), "0".to_string());
        let merged = merge_sysctls(&descriptor);
        assert_eq!(merged.get("kernel.kexec_load_disabled"), Some(&"1".to_string()));
    }

    #[test]
    fn test_merge_sysctls_descriptor_wins_over_default() {
        let mut descriptor = HashMap::new();
        descriptor.insert("vm.overcommit_memory".to_string(), "2".to_string());
        let merged = merge_sysctls(&descriptor);
        assert_eq!(merged.get("vm.overcommit_memory"), Some(&"2".to_string()));
    }

    #[test]
    fn test_find_disk_by_serial_in_matches_exact() {
        let dir = tempfile::tempdir().unwrap();
        let vda = dir.path().join("vda");
        std::fs::create_dir_all(&vda).unwrap();
        std::fs::write(vda.join("serial"), "abcdef123456\n").unwrap();

        let found = find_disk_by_serial_in("abcdef123456", dir.path().to_str().unwrap()).unwrap();
        assert_eq!(found, PathBuf::from("/dev/vda"));
    }

    #[test]
    fn test_find_disk_by_serial_in_no_match_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = find_disk_by_serial_in("missing", dir.path().to_str().unwrap());
        assert!(err.is_err());
    }
}
