//! cgroup v1 hierarchy setup inside the sandbox child (spec §4.4.1 step 5).
//!
//! `cpu`/`cpuacct` and `net_cls`/`net_prio` are special-cased: each pair
//! shares one `cpu,cpuacct` (or `net_cls,net_prio`) mount with a symlink
//! for the other name, matching the classic cgroupfs-mount convention.

use nix::mount::{mount, MsFlags};
use runq_core::{Result, RunqError};
use std::collections::HashSet;

/// One enabled subsystem parsed from `/proc/cgroups` (`name hierarchy
/// count enabled`, tab-separated, `#`-prefixed header).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subsystem {
    pub name: String,
    pub hierarchy: u32,
    pub enabled: bool,
}

pub fn parse_proc_cgroups(contents: &str) -> Vec<Subsystem> {
    contents
        .lines()
        .filter(|l| !l.starts_with('#') && !l.trim().is_empty())
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?.to_string();
            let hierarchy: u32 = fields.next()?.parse().ok()?;
            let _count: u32 = fields.next()?.parse().ok()?;
            let enabled = fields.next()? == "1";
            Some(Subsystem { name, hierarchy, enabled })
        })
        .collect()
}

/// One planned cgroup mount: the `data=` mount-option name and every
/// subsystem alias that should point at it (via `mount data=<name>` plus
/// symlinks for the merged partners).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupMount {
    pub mount_name: String,
    pub aliases: Vec<String>,
}

const MERGE_GROUPS: &[(&str, &str)] = &[("cpu", "cpuacct"), ("net_cls", "net_prio")];

/// Builds the mount plan from the enabled subsystem list, applying the
/// cpu/cpuacct and net_cls/net_prio merges.
pub fn plan_mounts(subsystems: &[Subsystem]) -> Vec<CgroupMount> {
    let enabled: HashSet<&str> = subsystems
        .iter()
        .filter(|s| s.enabled)
        .map(|s| s.name.as_str())
        .collect();

    let mut merged_away: HashSet<&str> = HashSet::new();
    let mut mounts = Vec::new();

    for (a, b) in MERGE_GROUPS {
        if enabled.contains(a) && enabled.contains(b) {
            mounts.push(CgroupMount {
                mount_name: format!("{a},{b}"),
                aliases: vec![a.to_string(), b.to_string()],
            });
            merged_away.insert(a);
            merged_away.insert(b);
        }
    }

    for s in subsystems.iter().filter(|s| s.enabled) {
        if merged_away.contains(s.name.as_str()) {
            continue;
        }
        mounts.push(CgroupMount {
            mount_name: s.name.clone(),
            aliases: vec![s.name.clone()],
        });
    }

    mounts
}

/// Mounts a tmpfs at `/sys/fs/cgroup`, then each planned cgroup mount
/// underneath, with symlinks for merged aliases.
pub fn setup(subsystems: &[Subsystem]) -> Result<()> {
    std::fs::create_dir_all("/sys/fs/cgroup").ok();
    mount(
        Some("tmpfs"),
        "/sys/fs/cgroup",
        Some("tmpfs"),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(|e| RunqError::Boot(format!("mount tmpfs at /sys/fs/cgroup failed: {e}")))?;

    for planned in plan_mounts(subsystems) {
        let target = format!("/sys/fs/cgroup/{}", planned.mount_name);
        std::fs::create_dir_all(&target).ok();
        mount(
            Some("cgroup"),
            target.as_str(),
            Some("cgroup"),
            MsFlags::empty(),
            Some(planned.mount_name.as_str()),
        )
        .map_err(|e| RunqError::Boot(format!("mount cgroup {target} failed: {e}")))?;

        for alias in &planned.aliases {
            if *alias == planned.mount_name {
                continue;
            }
            let link = format!("/sys/fs/cgroup/{alias}");
            let _ = std::fs::remove_file(&link);
            std::os::unix::fs::symlink(&target, &link)
                .map_err(|e| RunqError::Boot(format!("symlink {link} failed: {e}")))?;
        }
    }
    Ok(())
}
