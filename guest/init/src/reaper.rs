//! Background zombie reaper (spec §5, "Reaper vs. specific waits").
//!
//! PID 1 inherits every orphan in the guest's PID namespace. A periodic
//! non-blocking sweep collects them without racing the message loop's
//! specific wait on the entrypoint's PID: both call `waitpid` with
//! `WNOHANG`, so a reap by one side is simply a miss for the other.

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use runq_core::cfg::REAPER_INTERVAL;
use tokio::time::interval;

/// Runs forever, reaping any exited child every `REAPER_INTERVAL` until a
/// sweep finds nothing left to collect.
pub async fn run() {
    let mut ticker = interval(REAPER_INTERVAL);
    loop {
        ticker.tick().await;
        reap_all();
    }
}

/// One non-blocking sweep: reaps every exited child currently waitable,
/// stopping at the first "nothing to reap" or "no children" result.
pub fn reap_all() {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            Ok(WaitStatus::Exited(pid, code)) => {
                tracing::debug!(%pid, code, "reaped orphan");
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                tracing::debug!(%pid, ?signal, "reaped orphan");
            }
            Ok(_) => continue,
        }
    }
}
