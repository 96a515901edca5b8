//! Host proxy (C3): the sole process inside the host-visible container
//! namespace until the hypervisor starts, and its supervisor afterward.
//!
//! Sequence: parse argv, decode and validate the descriptor, pivot into
//! the hypervisor's root, open the C2 listening socket, spawn the
//! hypervisor, deliver the descriptor and wait for its boot ack, then
//! forward signals and reap the hypervisor's exit status (spec §4.3).

use clap::Parser;
use nix::mount::{mount, MsFlags};
use nix::unistd::{getpid, Pid};
use runq_core::descriptor::Data;
use runq_core::msg::Msg;
use runq_runtime::hypervisor::{build_argv, Arch, HypervisorConfig};
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream as TokioUnixStream;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

const GIT_COMMIT: &str = env!("CARGO_PKG_VERSION");
const CHANNEL_SOCKET_PATH: &str = "/run/runq.sock";
const ROOTFS_SHARE_TAG: &str = "rootfs";

/// Fixed exclusions applied when syncing the container rootfs into a root
/// disk image (SPEC_FULL.md supplement 2).
const ROOTDISK_SYNC_EXCLUDES: &[&str] = &["/dev", "/lib/modules", "/lost+found", "/proc", "/qemu", "/sys"];

#[derive(Parser, Debug)]
#[command(name = "runq-shim", disable_help_flag = true)]
struct Args {
    #[arg(long = "version")]
    version: bool,

    #[arg(long = "name")]
    name: Option<String>,

    /// The base64-gzip-encoded descriptor, the last positional argument.
    descriptor: Option<String>,
}

#[tokio::main]
async fn main() {
    runq_core::log::init();
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e}");
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> runq_core::Result<i32> {
    let args = Args::parse();

    if args.version {
        println!("runq-shim {} ({GIT_COMMIT})", runq_core::VERSION);
        return Ok(0);
    }

    if getpid() != Pid::from_raw(1) {
        return Err(runq_core::RunqError::Configuration(
            "runq-shim must run as PID 1".into(),
        ));
    }

    let encoded = args
        .descriptor
        .ok_or_else(|| runq_core::RunqError::Configuration("missing descriptor argument".into()))?;

    let mut data: Data = runq_core::codec::decode_gzip_base64(&encoded)?;

    if data.git_commit != GIT_COMMIT {
        return Err(runq_core::RunqError::BinaryMismatch {
            host: GIT_COMMIT.to_string(),
            guest: data.git_commit.clone(),
        });
    }

    runq_runtime::complete::apply_env_overrides(&mut data, |k| std::env::var(k).ok())?;
    runq_runtime::disk::validate_unique(&data.disks)?;
    for disk in &mut data.disks {
        if let Ok(detected) = runq_runtime::disk::detect_disk_type(Path::new(&disk.path)) {
            disk.disk_type = detected;
        }
    }
    let rootdisk_excludes = runq_runtime::complete::rootdisk_excludes(|k| std::env::var(k).ok());
    data.entrypoint.env = runq_runtime::complete::build_entrypoint_env(std::env::vars(), data.entrypoint.user.uid);
    clear_runq_env();

    pivot_and_share_root(&data, &rootdisk_excludes)?;

    let listener = open_channel(CHANNEL_SOCKET_PATH)?;

    let argv = build_argv(&HypervisorConfig {
        arch: current_arch(),
        data: &data,
        channel_socket_path: CHANNEL_SOCKET_PATH,
        share_dir: "/rootfs",
        share_mount_tag: ROOTFS_SHARE_TAG,
        tap_count: data.networks.len(),
        multidevs_remap: std::env::var("RUNQ_9P_MULTIDEVS_REMAP")
            .map(|v| v == "1")
            .unwrap_or(false),
    });

    tracing::info!(?argv, "spawning hypervisor");
    let mut child = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .spawn()
        .map_err(|e| runq_core::RunqError::HypervisorFailure(format!("spawn failed: {e}")))?;

    let mut conn = accept_channel_or_die(&listener, &mut child).await?;

    let payload = runq_core::codec::encode(&data)?;
    runq_transport::channel::write_message(&mut conn, &Msg::vmdata(payload))
        .await
        .map_err(|e| runq_core::RunqError::Protocol(e.to_string()))?;

    wait_for_boot_ack(&mut conn, &mut child, data.mem_mib).await?;

    remount_root_noexec();

    let (mut read_half, mut write_half) = conn.into_split();
    let (tx, mut rx) = mpsc::channel::<i32>(16);
    spawn_signal_watchers(tx);
    let forward_task = tokio::spawn(async move {
        while let Some(signum) = rx.recv().await {
            if runq_transport::channel::write_message(&mut write_half, &Msg::signal(signum))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let ack_code = read_exit_ack(&mut read_half).await;

    let status = child
        .wait()
        .await
        .map_err(|e| runq_core::RunqError::HypervisorFailure(e.to_string()))?;
    forward_task.abort();

    tracing::info!(?status, hypervisor_exit_code = exit_code_for_status(status), ack_code, "hypervisor exited");
    Ok(ack_code)
}

/// Reads the guest's single final ack byte off C2 within
/// `runq_core::cfg::ACK_TIMEOUT` and reports it as the process exit code
/// (spec §4.3 step 9); a missing byte (timeout or EOF) reports exit code 1.
async fn read_exit_ack<R: tokio::io::AsyncRead + Unpin>(conn: &mut R) -> i32 {
    use tokio::io::AsyncReadExt;
    let mut byte = [0u8; 1];
    match tokio::time::timeout(runq_core::cfg::ACK_TIMEOUT, conn.read_exact(&mut byte)).await {
        Ok(Ok(_)) => byte[0] as i32,
        _ => 1,
    }
}

fn exit_code_for_status(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.code().unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

fn clear_runq_env() {
    let keys: Vec<String> = std::env::vars()
        .map(|(k, _)| k)
        .filter(|k| k.starts_with("RUNQ_"))
        .collect();
    for k in keys {
        std::env::remove_var(k);
    }
}

fn current_arch() -> Arch {
    if cfg!(target_arch = "s390x") {
        Arch::S390x
    } else {
        Arch::Amd64
    }
}

/// Move-mounts `/dev`, `/proc`, `/sys` into the hypervisor's root directory
/// and pivots there; the container's original rootfs ends up shared with
/// the guest at `/rootfs`. If a root disk is configured, syncs the
/// container filesystem into it via `rsync` (an external collaborator)
/// first, applying the fixed exclusion set plus any caller-supplied
/// `extra_excludes` (`RUNQ_ROOTDISK_EXCLUDE`, spec §4.3 step 3); otherwise
/// `/rootfs` is shared as-is. `/lib/modules` is bound in read-only so the
/// guest can pick up host-matching modules.
fn pivot_and_share_root(data: &Data, extra_excludes: &[String]) -> runq_core::Result<()> {
    std::fs::create_dir_all("/qemu/rootfs").ok();
    for fs in ["/dev", "/proc", "/sys"] {
        let target = format!("/qemu{fs}");
        std::fs::create_dir_all(&target).ok();
        mount(Some(fs), target.as_str(), None::<&str>, MsFlags::MS_MOVE, None::<&str>)
            .map_err(|e| runq_core::RunqError::Boot(format!("move-mount {fs} failed: {e}")))?;
    }

    if let Some(root_disk_id) = &data.root_disk_id {
        tracing::info!(disk = %root_disk_id, "syncing container rootfs into root disk");
        let mut cmd = std::process::Command::new("rsync");
        cmd.arg("-a").arg("--delete");
        for excl in ROOTDISK_SYNC_EXCLUDES {
            cmd.arg("--exclude").arg(excl);
        }
        for excl in extra_excludes {
            cmd.arg("--exclude").arg(excl);
        }
        cmd.arg("/").arg("/qemu/rootfs/");
        let status = cmd
            .status()
            .map_err(|e| runq_core::RunqError::Boot(format!("rsync spawn failed: {e}")))?;
        if !status.success() {
            return Err(runq_core::RunqError::Boot(format!("rsync exited with {status}")));
        }
    }

    nix::unistd::chdir("/qemu").map_err(|e| runq_core::RunqError::Boot(e.to_string()))?;
    nix::unistd::pivot_root(".", "rootfs")
        .map_err(|e| runq_core::RunqError::Boot(format!("pivot_root failed: {e}")))?;

    std::fs::create_dir_all("/share/lib/modules").ok();
    mount(
        Some("/lib/modules"),
        "/share/lib/modules",
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .ok();

    Ok(())
}

/// Opens the Unix-domain socket the hypervisor's virtio-serial chardev
/// connects through.
fn open_channel(path: &str) -> runq_core::Result<StdUnixListener> {
    let _ = std::fs::remove_file(path);
    StdUnixListener::bind(path).map_err(|e| runq_core::RunqError::Boot(format!("bind {path} failed: {e}")))
}

/// Accepts the hypervisor's channel connection, racing it against an early
/// hypervisor exit so a crash-on-start doesn't hang forever.
async fn accept_channel_or_die(
    listener: &StdUnixListener,
    child: &mut Child,
) -> runq_core::Result<TokioUnixStream> {
    listener
        .set_nonblocking(true)
        .map_err(|e| runq_core::RunqError::Boot(e.to_string()))?;
    let tokio_listener = tokio::net::UnixListener::from_std(
        listener
            .try_clone()
            .map_err(|e| runq_core::RunqError::Boot(e.to_string()))?,
    )
    .map_err(|e| runq_core::RunqError::Boot(e.to_string()))?;

    tokio::select! {
        res = tokio_listener.accept() => {
            let (stream, _) = res.map_err(|e| runq_core::RunqError::Protocol(format!("accept failed: {e}")))?;
            Ok(stream)
        }
        status = child.wait() => {
            let status = status.map_err(|e| runq_core::RunqError::HypervisorFailure(e.to_string()))?;
            Err(runq_core::RunqError::HypervisorFailure(format!(
                "hypervisor exited before channel connect: {status}"
            )))
        }
    }
}

/// Waits for the guest's boot ack within `10 + mem_mib/2048` seconds,
/// killing the hypervisor if the deadline or an early exit beats it.
async fn wait_for_boot_ack(conn: &mut TokioUnixStream, child: &mut Child, mem_mib: u32) -> runq_core::Result<()> {
    let ack_timeout = Duration::from_secs(
        runq_core::cfg::DESCRIPTOR_ACK_TIMEOUT_BASE_SECS
            + (mem_mib / runq_core::cfg::DESCRIPTOR_ACK_TIMEOUT_MEM_DIVISOR) as u64,
    );
    tokio::select! {
        ack = tokio::time::timeout(ack_timeout, runq_transport::channel::read_ack(conn)) => {
            match ack {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) => Err(runq_core::RunqError::Protocol(e.to_string())),
                Err(_) => {
                    let _ = child.kill().await;
                    Err(runq_core::RunqError::HypervisorFailure(
                        "no ack within descriptor handshake timeout".into(),
                    ))
                }
            }
        }
        status = child.wait() => {
            let status = status.map_err(|e| runq_core::RunqError::HypervisorFailure(e.to_string()))?;
            Err(runq_core::RunqError::HypervisorFailure(format!(
                "hypervisor exited before boot ack: {status}"
            )))
        }
    }
}

/// After the boot handshake, remounts the host rootfs no-exec to foreclose
/// host-side execution once the guest is running (spec §4.3 step 7).
fn remount_root_noexec() {
    let _ = mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REMOUNT | MsFlags::MS_NOEXEC,
        None::<&str>,
    );
}

/// Spawns one watcher task per forwarded signal, each feeding its signal
/// number into the shared channel that `forward_task` drains onto C2.
fn spawn_signal_watchers(tx: mpsc::Sender<i32>) {
    for &signum in runq_core::cfg::SIGNALS {
        let tx = tx.clone();
        tokio::spawn(async move {
            let kind = tokio::signal::unix::SignalKind::from_raw(signum);
            let Ok(mut stream) = tokio::signal::unix::signal(kind) else {
                return;
            };
            while stream.recv().await.is_some() {
                if tx.send(signum).await.is_err() {
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_for_normal_status() {
        use std::os::unix::process::ExitStatusExt;
        let status = std::process::ExitStatus::from_raw(0);
        assert_eq!(exit_code_for_status(status), 0);
    }

    #[test]
    fn test_exit_code_for_nonzero_status() {
        use std::os::unix::process::ExitStatusExt;
        let status = std::process::ExitStatus::from_raw(3 << 8);
        assert_eq!(exit_code_for_status(status), 3);
    }

    #[tokio::test]
    async fn test_read_exit_ack_returns_byte_value() {
        let mut data: &[u8] = &[42u8];
        assert_eq!(read_exit_ack(&mut data).await, 42);
    }

    #[tokio::test]
    async fn test_read_exit_ack_defaults_to_one_on_eof() {
        let mut data: &[u8] = &[];
        assert_eq!(read_exit_ack(&mut data).await, 1);
    }

    #[test]
    fn test_current_arch_matches_target() {
        let arch = current_arch();
        if cfg!(target_arch = "s390x") {
            assert_eq!(arch, Arch::S390x);
        } else {
            assert_eq!(arch, Arch::Amd64);
        }
    }
}
