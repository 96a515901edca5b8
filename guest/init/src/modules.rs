//! Kernel module loading (spec §4.4 steps 2 and 5), plus the `/sbin/modprobe`
//! re-exec dispatch (SPEC_FULL.md supplement 1): the kernel itself shells
//! out to `modprobe` for on-demand module loads (e.g. filesystem drivers
//! at mount time), so this binary answers to that name too.

use crate::kernel_conf::{self, ModuleEntry};
use kmod::Context;
use runq_core::{Result, RunqError};

/// Loads every `base`-kind entry from `/kernel.conf`.
pub fn load_base_modules(entries: &[ModuleEntry]) -> Result<()> {
    load_kind(entries, "base")
}

/// Loads the s390x machine-generation module set, selected by `/proc/sysinfo`.
pub fn load_s390x_modules(entries: &[ModuleEntry], sysinfo: &str) -> Result<()> {
    let kind = s390x_module_kind(sysinfo);
    load_kind(entries, kind)
}

/// Loads the vsock module set unless the descriptor disables vsock.
pub fn load_vsock_modules(entries: &[ModuleEntry], vsock_enabled: bool) -> Result<()> {
    if !vsock_enabled {
        return Ok(());
    }
    load_kind(entries, "vsock")
}

fn load_kind(entries: &[ModuleEntry], kind: &str) -> Result<()> {
    let ctx = Context::new().map_err(|e| RunqError::Boot(format!("kmod context: {e}")))?;
    for entry in kernel_conf::of_kind(entries, kind) {
        tracing::debug!(path = %entry.path, "loading kernel module");
        let module = ctx
            .module_new_from_path(&entry.path)
            .map_err(|e| RunqError::Boot(format!("module {} lookup failed: {e}", entry.path)))?;
        module
            .insert_module(entry.params.join(" ").as_str(), |_| 0)
            .map_err(|e| RunqError::Boot(format!("module {} load failed: {e}", entry.path)))?;
    }
    Ok(())
}

/// Picks the s390x module-set kind out of `/proc/sysinfo`'s `Type:` line —
/// `z13` machines get the `s390x_z13` set, everything newer gets
/// `s390x_z14plus`.
fn s390x_module_kind(sysinfo: &str) -> &'static str {
    let machine_type = sysinfo
        .lines()
        .find_map(|l| l.strip_prefix("Type:"))
        .map(str::trim)
        .unwrap_or("");
    match machine_type {
        "2964" | "2965" => "s390x_z13",
        _ => "s390x_z14plus",
    }
}

/// Entry point when this binary is invoked (via argv[0] or a re-exec) as
/// `/sbin/modprobe <module-name>`: the kernel's in-VM `request_module()`
/// upcall expects this to load the module and exit 0/1.
pub fn run_as_modprobe(module_name: &str) -> i32 {
    match Context::new().and_then(|ctx| {
        let m = ctx.module_new_from_lookup(module_name)?;
        m.into_iter().next().map(|m| m.insert_module("", |_| 0)).transpose()
    }) {
        Ok(_) => 0,
        Err(e) => {
            tracing::warn!(module = %module_name, error = %e, "modprobe dispatch failed");
            1
        }
    }
}
