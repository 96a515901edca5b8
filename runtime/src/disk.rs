//! Disk-type detection and disk descriptor validation (spec §4.3 step 2,
//! §6.5's `RUNQ_DISK` keys).

use runq_core::descriptor::DiskType;
use runq_core::{Result, RunqError};
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

/// qcow2 magic bytes, per the QEMU image format header.
const QCOW2_MAGIC: [u8; 4] = [0x51, 0x46, 0x49, 0xFB];

/// Regex-equivalent validation for disk and RUNQ_DISK `id` values:
/// `^[A-Za-z0-9_-]{1,36}$`.
pub fn valid_disk_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 36
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// The four accepted cache modes for a backing disk.
pub fn valid_cache_mode(mode: &str) -> bool {
    matches!(mode, "none" | "writeback" | "writethrough" | "unsafe")
}

/// Sniffs a backing file's disk type: block-device mode, a 4-byte qcow2
/// magic, or raw file.
pub fn detect_disk_type(path: &Path) -> Result<DiskType> {
    let metadata = std::fs::symlink_metadata(path)
        .map_err(|e| RunqError::Configuration(format!("stat {path:?} failed: {e}")))?;

    if metadata.file_type().is_block_device() {
        return Ok(DiskType::BlockDevice);
    }
    if !metadata.is_file() {
        return Ok(DiskType::Unknown);
    }
    if metadata.len() < 4 {
        return Ok(DiskType::RawFile);
    }

    let mut file = File::open(path)
        .map_err(|e| RunqError::Configuration(format!("open {path:?} failed: {e}")))?;
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)
        .map_err(|e| RunqError::Configuration(format!("read {path:?} failed: {e}")))?;

    if magic == QCOW2_MAGIC {
        Ok(DiskType::Qcow2Image)
    } else {
        Ok(DiskType::RawFile)
    }
}

/// Validates that disk IDs and serials are each unique within a descriptor
/// (spec §3 Invariants).
pub fn validate_unique(disks: &[runq_core::descriptor::Disk]) -> Result<()> {
    let mut ids = std::collections::HashSet::new();
    let mut serials = std::collections::HashSet::new();
    for disk in disks {
        if !valid_disk_id(&disk.id) {
            return Err(RunqError::Configuration(format!(
                "invalid disk id: {:?}",
                disk.id
            )));
        }
        if !valid_cache_mode(&disk.cache) {
            return Err(RunqError::Configuration(format!(
                "invalid cache mode: {:?}",
                disk.cache
            )));
        }
        if !ids.insert(disk.id.clone()) {
            return Err(RunqError::Configuration(format!(
                "duplicate disk ID: {}",
                disk.id
            )));
        }
        if !serials.insert(disk.serial.clone()) {
            return Err(RunqError::Configuration(format!(
                "duplicate disk serial: {}",
                disk.serial
            )));
        }
    }
    Ok(())
}

/// Accepts both `/dev/disk/<id>` (primary) and the deprecated
/// `/dev/runq/<id>` prefix, logging a warning for the latter
/// (SPEC_FULL.md supplement 3).
pub fn normalize_disk_path_prefix(path: &str) -> &str {
    if let Some(rest) = path.strip_prefix("/dev/runq/") {
        tracing::warn!("disk path prefix /dev/runq/ is deprecated, use /dev/disk/");
        rest
    } else if let Some(rest) = path.strip_prefix("/dev/disk/") {
        rest
    } else {
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_valid_disk_id() {
        assert!(valid_disk_id("disk-1"));
        assert!(valid_disk_id("a"));
        assert!(!valid_disk_id(""));
        assert!(!valid_disk_id(&"x".repeat(37)));
        assert!(!valid_disk_id("bad id"));
        assert!(!valid_disk_id("bad/id"));
    }

    #[test]
    fn test_valid_cache_mode() {
        assert!(valid_cache_mode("none"));
        assert!(valid_cache_mode("writeback"));
        assert!(valid_cache_mode("writethrough"));
        assert!(valid_cache_mode("unsafe"));
        assert!(!valid_cache_mode("bogus"));
    }

    #[test]
    fn test_detect_disk_type_qcow2() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&QCOW2_MAGIC).unwrap();
        f.write_all(&[0u8; 100]).unwrap();
        assert_eq!(detect_disk_type(f.path()).unwrap(), DiskType::Qcow2Image);
    }

    #[test]
    fn test_detect_disk_type_raw_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0u8; 512]).unwrap();
        assert_eq!(detect_disk_type(f.path()).unwrap(), DiskType::RawFile);
    }

    #[test]
    fn test_detect_disk_type_too_small_is_raw() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[1, 2]).unwrap();
        assert_eq!(detect_disk_type(f.path()).unwrap(), DiskType::RawFile);
    }

    fn sample_disk(id: &str, serial: &str) -> runq_core::descriptor::Disk {
        runq_core::descriptor::Disk {
            id: id.into(),
            path: "/tmp/x".into(),
            cache: "none".into(),
            dir: None,
            fstype: None,
            mount: false,
            serial: serial.into(),
            disk_type: DiskType::RawFile,
            options: vec![],
        }
    }

    #[test]
    fn test_validate_unique_rejects_duplicate_ids() {
        let disks = vec![sample_disk("a", "111111111111"), sample_disk("a", "222222222222")];
        let err = validate_unique(&disks).unwrap_err();
        assert!(err.to_string().contains("duplicate disk ID"));
    }

    #[test]
    fn test_validate_unique_rejects_duplicate_serials() {
        let disks = vec![sample_disk("a", "111111111111"), sample_disk("b", "111111111111")];
        let err = validate_unique(&disks).unwrap_err();
        assert!(err.to_string().contains("duplicate disk serial"));
    }

    #[test]
    fn test_validate_unique_accepts_distinct() {
        let disks = vec![sample_disk("a", "111111111111"), sample_disk("b", "222222222222")];
        assert!(validate_unique(&disks).is_ok());
    }

    #[test]
    fn test_normalize_disk_path_prefix() {
        assert_eq!(normalize_disk_path_prefix("/dev/disk/foo"), "foo");
        assert_eq!(normalize_disk_path_prefix("/dev/runq/foo"), "foo");
        assert_eq!(normalize_disk_path_prefix("foo"), "foo");
    }
}
