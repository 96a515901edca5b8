//! Environment-variable mini-DSLs consumed by the host proxy (spec §6.2,
//! §6.5), plus humanised byte-size parsing used by `RUNQ_DISK`'s `size=`
//! key.

use crate::disk::{valid_cache_mode, valid_disk_id};
use runq_core::{Result, RunqError};

/// Minimum size for an embedded disk created from `RUNQ_DISK`, in bytes.
pub const MIN_EMBEDDED_DISK_SIZE: u64 = 16 * 1024 * 1024;

/// One record parsed out of `RUNQ_DISK`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedDiskSpec {
    pub id: String,
    pub dir: Option<String>,
    pub size: Option<u64>,
    pub cache: String,
    pub fstype: Option<String>,
    pub img: Option<String>,
    pub label: Option<String>,
    pub options: Vec<String>,
    pub mount: bool,
}

impl Default for EmbeddedDiskSpec {
    fn default() -> Self {
        EmbeddedDiskSpec {
            id: String::new(),
            dir: None,
            size: None,
            cache: "none".to_string(),
            fstype: None,
            img: None,
            label: None,
            options: vec![],
            mount: false,
        }
    }
}

/// Parses a humanised byte size, e.g. `1G`, `512M`, `4096`.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(RunqError::Configuration("empty size".into()));
    }
    let (digits, mult): (&str, u64) = if let Some(d) = s.strip_suffix(['G', 'g']) {
        (d, 1024 * 1024 * 1024)
    } else if let Some(d) = s.strip_suffix(['M', 'm']) {
        (d, 1024 * 1024)
    } else if let Some(d) = s.strip_suffix(['K', 'k']) {
        (d, 1024)
    } else {
        (s, 1)
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| RunqError::Configuration(format!("invalid size: {s:?}")))?;
    Ok(n * mult)
}

fn truthy(s: &str) -> bool {
    matches!(s.to_ascii_lowercase().as_str(), "1" | "on" | "yes" | "true")
}

/// Parses a single `key=value,key=value` record into an [`EmbeddedDiskSpec`].
fn parse_disk_record(record: &str) -> Result<EmbeddedDiskSpec> {
    let mut spec = EmbeddedDiskSpec::default();
    for pair in record.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| RunqError::Configuration(format!("malformed RUNQ_DISK entry: {pair:?}")))?;
        match key {
            "id" => spec.id = value.to_string(),
            "dir" => spec.dir = Some(value.to_string()),
            "size" => spec.size = Some(parse_size(value)?),
            "cache" => spec.cache = value.to_string(),
            "fstype" => spec.fstype = Some(value.to_string()),
            "img" => spec.img = Some(value.to_string()),
            "label" => spec.label = Some(value.to_string()),
            "options" => spec.options = value.split('+').map(String::from).collect(),
            "mount" => spec.mount = truthy(value),
            other => {
                return Err(RunqError::Configuration(format!(
                    "unknown RUNQ_DISK key: {other:?}"
                )))
            }
        }
    }

    if !valid_disk_id(&spec.id) {
        return Err(RunqError::Configuration(format!(
            "invalid disk id in RUNQ_DISK: {:?}",
            spec.id
        )));
    }
    if !valid_cache_mode(&spec.cache) {
        return Err(RunqError::Configuration(format!(
            "invalid cache mode in RUNQ_DISK: {:?}",
            spec.cache
        )));
    }
    if !matches!(spec.fstype.as_deref(), None | Some("ext2") | Some("ext4")) {
        return Err(RunqError::Configuration(format!(
            "invalid fstype in RUNQ_DISK: {:?}",
            spec.fstype
        )));
    }
    if let Some(img) = &spec.img {
        if !(img.ends_with(".img") || img.ends_with(".qcow") || img.ends_with(".qcow2") || img.ends_with(".raw"))
        {
            return Err(RunqError::Configuration(format!(
                "invalid img suffix in RUNQ_DISK: {img:?}"
            )));
        }
    }
    if let Some(label) = &spec.label {
        if label.len() > 16 {
            return Err(RunqError::Configuration(format!(
                "disk label too long (max 16): {label:?}"
            )));
        }
    }
    if let Some(size) = spec.size {
        if size < MIN_EMBEDDED_DISK_SIZE {
            return Err(RunqError::Configuration(format!(
                "embedded disk size {size} below minimum {MIN_EMBEDDED_DISK_SIZE}"
            )));
        }
    }

    Ok(spec)
}

/// Parses `RUNQ_DISK`: semicolon-separated records of comma-separated
/// `key=value` pairs.
pub fn parse_runq_disk(value: &str) -> Result<Vec<EmbeddedDiskSpec>> {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_disk_record)
        .collect()
}

/// One record parsed out of `RUNQ_MOUNT`: `id=<id>,options=opt1+opt2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptionsSpec {
    pub id: String,
    pub options: Vec<String>,
}

/// Parses `RUNQ_MOUNT`.
pub fn parse_runq_mount(value: &str) -> Result<Vec<MountOptionsSpec>> {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|record| {
            let mut id = None;
            let mut options = Vec::new();
            for pair in record.split(',') {
                let (key, v) = pair.split_once('=').ok_or_else(|| {
                    RunqError::Configuration(format!("malformed RUNQ_MOUNT entry: {pair:?}"))
                })?;
                match key {
                    "id" => id = Some(v.to_string()),
                    "options" => options = v.split('+').map(String::from).collect(),
                    other => {
                        return Err(RunqError::Configuration(format!(
                            "unknown RUNQ_MOUNT key: {other:?}"
                        )))
                    }
                }
            }
            let id = id.ok_or_else(|| RunqError::Configuration("RUNQ_MOUNT entry missing id".into()))?;
            if !valid_disk_id(&id) {
                return Err(RunqError::Configuration(format!("invalid id in RUNQ_MOUNT: {id:?}")));
            }
            Ok(MountOptionsSpec { id, options })
        })
        .collect()
}

/// Validates an RFC-4122 UUID string (`RUNQ_APUUID`), without pulling in a
/// dedicated UUID crate — this is the only place the workspace needs one.
pub fn valid_uuid(s: &str) -> bool {
    let parts: Vec<&str> = s.split('-').collect();
    if parts.len() != 5 {
        return false;
    }
    let expected_lens = [8, 4, 4, 4, 12];
    parts
        .iter()
        .zip(expected_lens)
        .all(|(p, len)| p.len() == len && p.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_variants() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("1K").unwrap(), 1024);
        assert_eq!(parse_size("1M").unwrap(), 1024 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert!(parse_size("abc").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn test_parse_runq_disk_single_record() {
        let specs = parse_runq_disk("id=data,dir=/data,size=1G,cache=none,fstype=ext4,mount=1").unwrap();
        assert_eq!(specs.len(), 1);
        let s = &specs[0];
        assert_eq!(s.id, "data");
        assert_eq!(s.dir.as_deref(), Some("/data"));
        assert_eq!(s.size, Some(1024 * 1024 * 1024));
        assert_eq!(s.fstype.as_deref(), Some("ext4"));
        assert!(s.mount);
    }

    #[test]
    fn test_parse_runq_disk_multiple_records() {
        let specs = parse_runq_disk("id=a,size=1G;id=b,size=1G").unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].id, "a");
        assert_eq!(specs[1].id, "b");
    }

    #[test]
    fn test_parse_runq_disk_rejects_bad_id() {
        assert!(parse_runq_disk("id=bad id,size=1G").is_err());
    }

    #[test]
    fn test_parse_runq_disk_rejects_unknown_key() {
        assert!(parse_runq_disk("id=a,bogus=1").is_err());
    }

    #[test]
    fn test_parse_runq_disk_rejects_too_small() {
        assert!(parse_runq_disk("id=a,size=1K").is_err());
    }

    #[test]
    fn test_parse_runq_disk_rejects_bad_img_suffix() {
        assert!(parse_runq_disk("id=a,size=1G,img=foo.txt").is_err());
    }

    #[test]
    fn test_parse_runq_mount() {
        let specs = parse_runq_mount("id=data,options=noatime+ro").unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].id, "data");
        assert_eq!(specs[0].options, vec!["noatime", "ro"]);
    }

    #[test]
    fn test_parse_runq_mount_requires_id() {
        assert!(parse_runq_mount("options=ro").is_err());
    }

    #[test]
    fn test_valid_uuid() {
        assert!(valid_uuid("550e8400-e29b-41d4-a716-446655440000"));
        assert!(!valid_uuid("not-a-uuid"));
        assert!(!valid_uuid("550e8400e29b41d4a716446655440000"));
    }
}
