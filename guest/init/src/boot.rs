//! Bootstrap mounts, C2 channel discovery, and the descriptor handshake
//! (spec §4.4 steps 1, 3, 4).

use nix::mount::{mount, MsFlags};
use runq_core::descriptor::Data;
use runq_core::msg::Msgtype;
use runq_core::{Result, RunqError};
use std::path::PathBuf;
use std::time::Instant;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Mounts `/proc`, `/dev`, `/sys`, `/dev/pts` with the fixed flags and data
/// from spec §6.3.
pub fn bootstrap_mounts() -> Result<()> {
    let entries: &[(&str, &str, MsFlags, Option<&str>)] = &[
        ("proc", "/proc", MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV, None),
        (
            "devtmpfs",
            "/dev",
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            Some("mode=0755"),
        ),
        ("sysfs", "/sys", MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV, None),
        (
            "devpts",
            "/dev/pts",
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            Some("newinstance,gid=5,mode=0620,ptmxmode=000"),
        ),
    ];

    for (fstype, target, flags, data) in entries {
        std::fs::create_dir_all(target).ok();
        mount(Some(*fstype), *target, Some(*fstype), *flags, *data)
            .map_err(|e| RunqError::Boot(format!("mount {target} failed: {e}")))?;
    }
    Ok(())
}

/// Polls `/sys/class/virtio-ports` up to `timeout` for exactly one port and
/// opens its device node for read-write.
pub async fn open_channel_port(timeout: std::time::Duration) -> Result<File> {
    let start = Instant::now();
    loop {
        let ports = list_virtio_ports("/sys/class/virtio-ports")?;
        match ports.len() {
            1 => {
                let name = ports[0]
                    .file_name()
                    .ok_or_else(|| RunqError::Boot("malformed virtio-port entry".into()))?;
                let dev = PathBuf::from("/dev").join(name);
                return File::options()
                    .read(true)
                    .write(true)
                    .open(&dev)
                    .await
                    .map_err(|e| RunqError::Boot(format!("open {dev:?} failed: {e}")));
            }
            0 if start.elapsed() < timeout => {
                tokio::time::sleep(runq_core::cfg::VIRTIO_PORT_POLL_INTERVAL).await;
            }
            n => {
                return Err(RunqError::Boot(format!(
                    "expected exactly one virtio-serial port, found {n}"
                )));
            }
        }
    }
}

fn list_virtio_ports(class_dir: &str) -> Result<Vec<PathBuf>> {
    if !std::path::Path::new(class_dir).exists() {
        return Ok(Vec::new());
    }
    let mut ports = Vec::new();
    for entry in std::fs::read_dir(class_dir).map_err(|e| RunqError::Boot(e.to_string()))? {
        let entry = entry.map_err(|e| RunqError::Boot(e.to_string()))?;
        ports.push(entry.path());
    }
    Ok(ports)
}

/// Receives and acks the boot `Vmdata` message, verifying the descriptor's
/// `git-commit` against the compiled-in guest fingerprint. Any other first
/// message, or a mismatched commit, is fatal.
pub async fn receive_descriptor(port: &mut File, guest_git_commit: &str) -> Result<Data> {
    let msg = runq_transport::channel::read_message(port)
        .await
        .map_err(|e| RunqError::Protocol(e.to_string()))?;
    if msg.typ != Msgtype::Vmdata {
        return Err(RunqError::Protocol(format!(
            "expected Vmdata as first message, got {:?}",
            msg.typ
        )));
    }

    let data: Data = runq_core::codec::decode(&msg.data)?;

    if data.git_commit != guest_git_commit {
        port.write_all(&[1]).await.ok();
        return Err(RunqError::BinaryMismatch {
            host: data.git_commit.clone(),
            guest: guest_git_commit.to_string(),
        });
    }

    port.write_all(&[0])
        .await
        .map_err(|e| RunqError::Protocol(format!("ack write failed: {e}")))?;
    Ok(data)
}
