//! C5: the vsock exec daemon, handling the host's control/execute
//! connections under a mutual-auth TLS session (spec §4.5, §6.7, §9).
//!
//! A job is a two-step handshake: a *control* connection registers a
//! [`JobId`] and later reads back the exit code; a matching *execute*
//! connection, opened within [`JOB_CLAIM_WINDOW`], carries the
//! [`JobRequest`] and the process's stdio. The daemon re-enters the
//! entrypoint's namespaces by opening its `/proc/<pid>/ns/*` handles
//! directly rather than shelling out to `nsenter` (spec §9 design note).

use nix::sched::{setns, CloneFlags};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use runq_core::descriptor::Vsockd;
use runq_core::{Result, RunqError};
use runq_transport::job::{ConnType, JobId, JobRequest, DONE, HOST_CONTEXT_ID, PORT};
use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_rustls::TlsAcceptor;
use tokio_vsock::{VsockAddr, VsockListener, VsockStream};

/// A control connection waiting for its execute peer, or already running.
enum JobSlot {
    AwaitingExecute { claimed_at: Instant },
    Running,
}

type Registry = Arc<Mutex<HashMap<JobId, JobSlot>>>;

/// Runs the daemon until the process exits. Binds vsock port [`PORT`] on
/// any CID and accepts only connections from [`HOST_CONTEXT_ID`].
pub async fn run(vsockd: &Vsockd) -> Result<()> {
    let acceptor = build_acceptor(vsockd)?;
    let listener = VsockListener::bind(VsockAddr::new(libc::VMADDR_CID_ANY, PORT))
        .map_err(|e| RunqError::Vsock(format!("bind vsock port {PORT} failed: {e}")))?;

    let registry: Registry = Arc::new(Mutex::new(HashMap::new()));

    loop {
        let (stream, addr) = listener
            .accept()
            .await
            .map_err(|e| RunqError::Vsock(format!("accept failed: {e}")))?;

        if addr.cid() != HOST_CONTEXT_ID {
            tracing::warn!(cid = addr.cid(), "rejected connection from non-host CID");
            continue;
        }

        let acceptor = acceptor.clone();
        let registry = registry.clone();
        let entrypoint_pid = vsockd.entrypoint_pid;
        let entrypoint_env = vsockd.entrypoint_env.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, acceptor, registry, entrypoint_pid, entrypoint_env).await {
                tracing::warn!("vsock connection failed: {e}");
            }
        });
    }
}

fn build_acceptor(vsockd: &Vsockd) -> Result<TlsAcceptor> {
    let certs = &vsockd.certificates;
    let server_cert = CertificateDer::from(certs.cert.clone());
    let server_key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certs.key.clone()));

    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(CertificateDer::from(certs.ca_cert.clone()))
        .map_err(|e| RunqError::Vsock(format!("invalid CA certificate: {e}")))?;

    let client_verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| RunqError::Vsock(format!("client verifier build failed: {e}")))?;

    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(vec![server_cert], server_key)
        .map_err(|e| RunqError::Vsock(format!("TLS server config failed: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

async fn handle_connection(
    stream: VsockStream,
    acceptor: TlsAcceptor,
    registry: Registry,
    entrypoint_pid: Option<u32>,
    entrypoint_env: Vec<String>,
) -> Result<()> {
    let mut tls = acceptor
        .accept(stream)
        .await
        .map_err(|e| RunqError::Vsock(format!("TLS handshake failed: {e}")))?;

    let mut tag = [0u8; 1];
    tls.read_exact(&mut tag)
        .await
        .map_err(|e| RunqError::Vsock(format!("read conn type failed: {e}")))?;
    let conn_type = ConnType::from_u8(tag[0]).ok_or_else(|| RunqError::Vsock("unknown conn type".into()))?;

    match conn_type {
        ConnType::Control => handle_control(tls, registry).await,
        ConnType::Execute => handle_execute(tls, registry, entrypoint_pid, entrypoint_env).await,
    }
}

/// Registers a new job, hands its [`JobId`] back to the client, waits for
/// the matching execute connection to finish, then writes the exit code
/// and waits for the client's [`DONE`] ack.
async fn handle_control<S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin>(
    mut conn: S,
    registry: Registry,
) -> Result<()> {
    let job_id = JobId::random();
    {
        let mut reg = registry.lock().await;
        reg.insert(job_id, JobSlot::AwaitingExecute { claimed_at: Instant::now() });
    }

    conn.write_all(&job_id.as_bytes())
        .await
        .map_err(|e| RunqError::Vsock(format!("write job id failed: {e}")))?;

    let (tx, rx) = tokio::sync::oneshot::channel();
    exit_waiters().await.lock().await.insert(job_id, tx);

    // No timeout here: a job's own runtime is unbounded. The execute side
    // must still claim the job within JOB_CLAIM_WINDOW (enforced below in
    // handle_execute); if no execute connection ever arrives this control
    // connection simply waits until its own client gives up.
    let exit_code = rx.await.map_err(|_| RunqError::Vsock("exit notifier dropped".into()))?;

    conn.write_all(&[exit_code as u8])
        .await
        .map_err(|e| RunqError::Vsock(format!("write exit code failed: {e}")))?;

    let mut done = [0u8; 1];
    let ack = tokio::time::timeout(runq_core::cfg::JOB_DONE_ACK_TIMEOUT, conn.read_exact(&mut done)).await;
    if !matches!(ack, Ok(Ok(_)) if done[0] == DONE) {
        tracing::warn!(?job_id, "client did not ack job completion in time");
    }

    registry.lock().await.remove(&job_id);
    Ok(())
}

/// Static map from [`JobId`] to a one-shot sender the matching control
/// connection is waiting on for the exit code.
static EXIT_WAITERS: tokio::sync::OnceCell<Mutex<HashMap<JobId, tokio::sync::oneshot::Sender<i32>>>> =
    tokio::sync::OnceCell::const_new();

async fn exit_waiters() -> &'static Mutex<HashMap<JobId, tokio::sync::oneshot::Sender<i32>>> {
    EXIT_WAITERS.get_or_init(|| async { Mutex::new(HashMap::new()) }).await
}

async fn handle_execute<S>(
    mut conn: S,
    registry: Registry,
    entrypoint_pid: Option<u32>,
    entrypoint_env: Vec<String>,
) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut id_bytes = [0u8; 4];
    conn.read_exact(&mut id_bytes)
        .await
        .map_err(|e| RunqError::Vsock(format!("read job id failed: {e}")))?;
    let job_id = JobId::from_bytes(&id_bytes).ok_or_else(|| RunqError::Vsock("malformed job id".into()))?;

    {
        let mut reg = registry.lock().await;
        match reg.get(&job_id) {
            Some(JobSlot::AwaitingExecute { claimed_at }) if claimed_at.elapsed() <= runq_core::cfg::JOB_CLAIM_WINDOW => {
                reg.insert(job_id, JobSlot::Running);
            }
            _ => return Err(RunqError::Vsock("job id not claimable".into())),
        }
    }

    let mut len_buf = [0u8; 4];
    conn.read_exact(&mut len_buf)
        .await
        .map_err(|e| RunqError::Vsock(format!("read request length failed: {e}")))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    conn.read_exact(&mut payload)
        .await
        .map_err(|e| RunqError::Vsock(format!("read request failed: {e}")))?;
    let request = JobRequest::decode(&payload)?;

    let outcome = run_in_entrypoint_namespace(entrypoint_pid, &entrypoint_env, &request, &mut conn).await;
    let exit_code = match &outcome {
        Ok(code) => *code,
        Err(_) => 1,
    };

    if let Some(tx) = exit_waiters().await.lock().await.remove(&job_id) {
        let _ = tx.send(exit_code);
    }
    outcome.map(|_| ())
}

/// Opens the entrypoint's `/proc/<pid>/ns/*` handles and re-enters each
/// namespace via `setns(2)` before spawning the requested command, so the
/// job runs with the entrypoint's view of PID/mount/IPC/UTS/network.
async fn run_in_entrypoint_namespace<S>(
    entrypoint_pid: Option<u32>,
    entrypoint_env: &[String],
    request: &JobRequest,
    conn: &mut S,
) -> Result<i32>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let Some(pid) = entrypoint_pid else {
        return Err(RunqError::Vsock("no entrypoint running".into()));
    };

    for ns in ["pid", "mnt", "ipc", "uts", "net"] {
        let path = format!("/proc/{pid}/ns/{ns}");
        let file = std::fs::File::open(&path).map_err(|e| RunqError::Vsock(format!("open {path} failed: {e}")))?;
        let flag = ns_clone_flag(ns);
        setns(file.as_raw_fd(), flag).map_err(|e| RunqError::Vsock(format!("setns {ns} failed: {e}")))?;
    }

    let mut env: Vec<String> = entrypoint_env.to_vec();
    env.extend(request.env.iter().cloned());

    let mut cmd = tokio::process::Command::new(&request.args[0]);
    cmd.args(&request.args[1..]);
    cmd.env_clear();
    for entry in &env {
        if let Some((k, v)) = entry.split_once('=') {
            cmd.env(k, v);
        }
    }

    if request.with_tty {
        run_with_pty(cmd, request.with_stdin, conn).await
    } else {
        run_with_pipes(cmd, request.with_stdin, conn).await
    }
}

/// Allocates a pseudo-terminal, hands the slave side to the child as its
/// stdio, and pumps the master side against `conn` — bidirectionally when
/// `with_stdin`, output-only otherwise.
async fn run_with_pty<S>(mut cmd: tokio::process::Command, with_stdin: bool, conn: &mut S) -> Result<i32>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let pty = nix::pty::openpty(None, None).map_err(|e| RunqError::Vsock(format!("openpty failed: {e}")))?;
    let slave_stdin = pty.slave.try_clone().map_err(|e| RunqError::Vsock(format!("clone pty slave failed: {e}")))?;
    let slave_stdout = pty.slave.try_clone().map_err(|e| RunqError::Vsock(format!("clone pty slave failed: {e}")))?;

    cmd.stdin(std::process::Stdio::from(slave_stdin));
    cmd.stdout(std::process::Stdio::from(slave_stdout));
    cmd.stderr(std::process::Stdio::from(pty.slave));

    let mut child = cmd.spawn().map_err(|e| RunqError::Vsock(format!("spawn job failed: {e}")))?;
    let mut master = tokio::fs::File::from_std(std::fs::File::from(pty.master));

    if with_stdin {
        tokio::io::copy_bidirectional(conn, &mut master).await.ok();
    } else {
        tokio::io::copy(&mut master, conn).await.ok();
    }

    let status = child.wait().await.map_err(|e| RunqError::Vsock(format!("wait on job failed: {e}")))?;
    Ok(exit_code_for_status(status))
}

/// No-TTY path: pipes the child's stdout/stderr to `conn`, and `conn`'s
/// input to the child's stdin when `with_stdin` is set.
async fn run_with_pipes<S>(mut cmd: tokio::process::Command, with_stdin: bool, conn: &mut S) -> Result<i32>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    cmd.stdin(if with_stdin { std::process::Stdio::piped() } else { std::process::Stdio::null() });
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| RunqError::Vsock(format!("spawn job failed: {e}")))?;

    let mut stdout = child.stdout.take().expect("stdout is piped");
    if with_stdin {
        let mut stdin = child.stdin.take().expect("stdin is piped");
        let (mut reader, mut writer) = tokio::io::split(conn);
        tokio::join!(
            async { tokio::io::copy(&mut reader, &mut stdin).await.ok() },
            async { tokio::io::copy(&mut stdout, &mut writer).await.ok() },
        );
    } else {
        tokio::io::copy(&mut stdout, conn).await.ok();
    }

    let status = child.wait().await.map_err(|e| RunqError::Vsock(format!("wait on job failed: {e}")))?;
    Ok(exit_code_for_status(status))
}

/// Maps a job's exit status to the Bash convention (spec §6.8): its own
/// code if it exited normally, `128 + signal` if a signal killed it.
fn exit_code_for_status(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.code().unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

fn ns_clone_flag(ns: &str) -> CloneFlags {
    match ns {
        "pid" => CloneFlags::CLONE_NEWPID,
        "mnt" => CloneFlags::CLONE_NEWNS,
        "ipc" => CloneFlags::CLONE_NEWIPC,
        "uts" => CloneFlags::CLONE_NEWUTS,
        "net" => CloneFlags::CLONE_NEWNET,
        _ => CloneFlags::empty(),
    }
}
