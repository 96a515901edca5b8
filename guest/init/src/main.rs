//! Guest PID 1: runs the full boot sequence (spec §4.4), then the message
//! loop and shutdown. Also answers as `/sbin/modprobe` when re-exec'd under
//! that name, since the kernel's `request_module()` upcall inside the
//! guest has nobody else to call.

use runq_core::descriptor::Data;
use runq_core::msg::Msgtype;
use runq_guest_init::{boot, kernel_conf, modules, reaper, rootfs, sandbox, shutdown, vsockd};
use std::time::Duration;

const GIT_COMMIT: &str = env!("CARGO_PKG_VERSION");

fn main() {
    let argv0 = std::env::args().next().unwrap_or_default();
    if argv0.ends_with("/modprobe") || argv0 == "modprobe" {
        let module = std::env::args().nth(1).unwrap_or_default();
        std::process::exit(modules::run_as_modprobe(&module));
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let runtime = tokio::runtime::Runtime::new().expect("failed to start guest init runtime");
    let code = runtime.block_on(run());
    std::process::exit(code);
}

async fn run() -> i32 {
    match boot_and_serve().await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("boot sequence failed: {e}");
            1
        }
    }
}

async fn boot_and_serve() -> runq_core::Result<i32> {
    boot::bootstrap_mounts()?;

    let kernel_conf_text = std::fs::read_to_string("/kernel.conf").unwrap_or_default();
    let module_entries = kernel_conf::parse(&kernel_conf_text);
    modules::load_base_modules(&module_entries)?;

    let mut port = boot::open_channel_port(Duration::from_secs(1)).await?;
    let data = boot::receive_descriptor(&mut port, GIT_COMMIT).await?;

    load_host_specific_modules(&module_entries, &data)?;

    rootfs::mount_root(&data)?;
    apply_descriptor(&data)?;
    runq_guest_init::network::configure_network(&data).await?;

    tokio::spawn(reaper::run());

    let entrypoint_pid = sandbox::spawn(&data.entrypoint)?;

    if let Some(mut vsockd_cfg) = data.vsockd.clone() {
        vsockd_cfg.entrypoint_pid = Some(entrypoint_pid.as_raw() as u32);
        tokio::spawn(async move {
            set_oom_score_adj(-1000);
            if let Err(e) = vsockd::run(&vsockd_cfg).await {
                tracing::error!("vsock daemon exited: {e}");
            }
        });
    }

    let exit = message_loop(&mut port, entrypoint_pid).await;
    finish_shutdown(&mut port, &data, exit).await
}

fn load_host_specific_modules(entries: &[kernel_conf::ModuleEntry], data: &Data) -> runq_core::Result<()> {
    if std::env::consts::ARCH == "s390x" {
        let sysinfo = std::fs::read_to_string("/proc/sysinfo").unwrap_or_default();
        modules::load_s390x_modules(entries, &sysinfo)?;
    }
    modules::load_vsock_modules(entries, data.vsockd.is_some())?;
    Ok(())
}

fn apply_descriptor(data: &Data) -> runq_core::Result<()> {
    rootfs::apply_extra_mounts(data)?;
    let sysctls = rootfs::merge_sysctls(&data.sysctl);
    rootfs::apply_sysctls(&sysctls)?;
    rootfs::set_hostname(&data.hostname)?;
    rootfs::setup_disks(&data.disks)?;
    Ok(())
}

/// Either the entrypoint's exit status (normal exit or a terminating
/// signal), collected concurrently with the C2 message loop.
enum ExitReason {
    Status(i32),
    Signal(i32),
}

async fn message_loop(port: &mut tokio::fs::File, entrypoint_pid: nix::unistd::Pid) -> ExitReason {
    loop {
        tokio::select! {
            wait = wait_entrypoint(entrypoint_pid) => return wait,
            msg = runq_transport::channel::read_message(port) => {
                match msg {
                    Ok(m) if m.typ == Msgtype::Signal => {
                        if let Some(signum) = m.signal_number() {
                            unsafe { libc::kill(entrypoint_pid.as_raw(), signum); }
                        }
                    }
                    _ => {
                        // Any non-Signal message (or a channel error) ends
                        // the loop; the entrypoint wait above still runs.
                        return wait_entrypoint(entrypoint_pid).await;
                    }
                }
            }
        }
    }
}

async fn wait_entrypoint(pid: nix::unistd::Pid) -> ExitReason {
    loop {
        match nix::sys::wait::waitpid(pid, None) {
            Ok(nix::sys::wait::WaitStatus::Exited(_, code)) => return ExitReason::Status(code),
            Ok(nix::sys::wait::WaitStatus::Signaled(_, signal, _)) => return ExitReason::Signal(signal as i32),
            Ok(_) => continue,
            Err(_) => return ExitReason::Status(1),
        }
    }
}

async fn finish_shutdown(port: &mut tokio::fs::File, data: &Data, exit: ExitReason) -> runq_core::Result<i32> {
    if !shutdown::begin() {
        return Ok(0);
    }

    let systemd = data.entrypoint.systemd;
    let report_code = match exit {
        ExitReason::Status(code) => code,
        ExitReason::Signal(signal) => shutdown::exit_code_for_shutdown(systemd, Some(signal)),
    };

    use tokio::io::AsyncWriteExt;
    let _ = tokio::time::timeout(runq_core::cfg::ACK_TIMEOUT, port.write_all(&[report_code as u8])).await;

    let mode = shutdown::reboot_mode_for(systemd, report_code);
    shutdown::run(mode).await
}

fn set_oom_score_adj(value: i32) {
    if let Err(e) = std::fs::write("/proc/self/oom_score_adj", value.to_string()) {
        tracing::warn!("failed to set oom_score_adj: {e}");
    }
}
