//! Subprocess execution: spawn in a fresh process group with rlimits, stream
//! stdout/stderr as it arrives, and resolve to exactly one terminal outcome.

use std::collections::HashMap;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info, warn};

use crate::proto::{ExecutionEvent, OutputStream, ResourceLimits, Terminal, TerminationReason};

/// Largest payload of a single `OutputChunk`.
pub const CHUNK_SIZE: usize = 64 * 1024;

const BASE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// cgroup v2 event counters of the cgroup this sidecar runs in.
const CGROUP_MEMORY_EVENTS: &str = "/sys/fs/cgroup/memory.events";

pub type EventSender = mpsc::Sender<Result<ExecutionEvent, Status>>;

#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: PathBuf,
    pub limits: ResourceLimits,
}

/// Why the process went away, before it is turned into a `Terminal`.
enum Ending {
    Exited(ExitStatus),
    Cancelled,
    OutputLimit,
    /// Sidecar is going down; no terminal is produced.
    Shutdown,
}

/// Run `spec` to completion, forwarding output chunks to `events`.
///
/// Returns the terminal outcome, or `None` when `shutdown` fired first. A
/// dropped `events` receiver counts as cancellation.
pub async fn run(
    spec: ExecSpec,
    events: &EventSender,
    cancel: &CancellationToken,
    shutdown: &CancellationToken,
    kill_grace: Duration,
) -> Option<Terminal> {
    if cancel.is_cancelled() {
        return Some(Terminal::failed(
            TerminationReason::Cancelled,
            "cancelled before launch",
        ));
    }

    let oom_kills_before = cgroup_oom_kills().await;
    let mut child = match spawn(&spec) {
        Ok(child) => child,
        Err(e) => {
            warn!(command = %spec.command, error = %e, "launch failed");
            return Some(Terminal::failed(
                TerminationReason::LaunchFailed,
                format!("{}: {}", spec.command, e),
            ));
        }
    };
    let pgid = child.id().map(|pid| Pid::from_raw(pid as i32));
    info!(command = %spec.command, pid = ?pgid, "process started");

    let (out_tx, mut out_rx) = mpsc::channel::<(OutputStream, Vec<u8>)>(32);
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, OutputStream::Stdout, out_tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, OutputStream::Stderr, out_tx.clone());
    }
    drop(out_tx);

    let mut forwarder = Forwarder {
        events,
        seq: 0,
        bytes: 0,
        max_bytes: spec.limits.max_output_bytes,
    };
    let mut pipes_open = true;

    let ending = loop {
        tokio::select! {
            chunk = out_rx.recv(), if pipes_open => match chunk {
                Some((stream, data)) => match forwarder.forward(stream, data).await {
                    Forward::Sent => {}
                    Forward::LimitExceeded => {
                        signal_group(pgid, Signal::SIGKILL);
                        let _ = child.wait().await;
                        break Ending::OutputLimit;
                    }
                    Forward::ReceiverGone => {
                        debug!("event receiver dropped, cancelling");
                        terminate(&mut child, pgid, kill_grace).await;
                        break Ending::Cancelled;
                    }
                },
                None => pipes_open = false,
            },
            status = child.wait() => match status {
                Ok(status) => break Ending::Exited(status),
                Err(e) => {
                    warn!(error = %e, "wait failed");
                    signal_group(pgid, Signal::SIGKILL);
                    return Some(Terminal::failed(TerminationReason::Internal, format!("wait: {}", e)));
                }
            },
            _ = cancel.cancelled() => {
                info!(pid = ?pgid, "cancel requested, terminating process group");
                terminate(&mut child, pgid, kill_grace).await;
                break Ending::Cancelled;
            }
            _ = shutdown.cancelled() => {
                signal_group(pgid, Signal::SIGKILL);
                let _ = child.wait().await;
                break Ending::Shutdown;
            }
        }
    };

    // Stragglers in the group would hold the pipes open forever.
    signal_group(pgid, Signal::SIGKILL);

    if matches!(ending, Ending::Shutdown) {
        return None;
    }
    if !matches!(ending, Ending::OutputLimit) {
        while let Some((stream, data)) = out_rx.recv().await {
            if !matches!(forwarder.forward(stream, data).await, Forward::Sent) {
                break;
            }
        }
    }

    let terminal = match ending {
        Ending::Exited(status) => {
            let oom_killed = matches!(
                (oom_kills_before, cgroup_oom_kills().await),
                (Some(before), Some(after)) if after > before
            );
            terminal_for_status(status, &spec.limits, oom_killed)
        }
        Ending::Cancelled => Terminal::failed(TerminationReason::Cancelled, "cancelled"),
        Ending::OutputLimit => Terminal::failed(
            TerminationReason::ResourceLimitExceeded,
            format!("output exceeded {} bytes", spec.limits.max_output_bytes),
        ),
        Ending::Shutdown => return None,
    };
    info!(
        reason = %terminal.termination_reason(),
        exit_code = ?terminal.exit_code,
        chunks = forwarder.seq,
        "process finished"
    );
    Some(terminal)
}

fn spawn(spec: &ExecSpec) -> io::Result<Child> {
    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args)
        .env_clear()
        .env("PATH", BASE_PATH)
        .env("HOME", &spec.working_dir)
        .envs(&spec.env)
        .current_dir(&spec.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);

    let limits = spec.limits;
    // SAFETY: the closure only calls setrlimit(2), which is async-signal-safe.
    unsafe {
        cmd.pre_exec(move || set_resource_limits(&limits));
    }
    cmd.spawn()
}

fn set_resource_limits(limits: &ResourceLimits) -> io::Result<()> {
    if limits.cpu_time_secs > 0 {
        // Soft limit delivers SIGXCPU, which lets us report the violation.
        setrlimit(
            Resource::RLIMIT_CPU,
            limits.cpu_time_secs,
            limits.cpu_time_secs + 1,
        )?;
    }
    if limits.memory_mb > 0 {
        let bytes = limits.memory_mb.saturating_mul(1024 * 1024);
        setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
    }
    if limits.max_open_files > 0 {
        setrlimit(
            Resource::RLIMIT_NOFILE,
            limits.max_open_files,
            limits.max_open_files,
        )?;
    }
    setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
    Ok(())
}

fn terminal_for_status(status: ExitStatus, limits: &ResourceLimits, oom_killed: bool) -> Terminal {
    // Same convention as a shell: 128 + signal number.
    let exit_code = status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1);
    let limit_exceeded = |message: String| Terminal {
        exit_code: Some(exit_code),
        ..Terminal::failed(TerminationReason::ResourceLimitExceeded, message)
    };

    if oom_killed {
        return limit_exceeded("killed by the kernel OOM killer".to_string());
    }
    match status.signal() {
        Some(sig) if sig == libc::SIGXCPU => return limit_exceeded("cpu time limit exceeded".to_string()),
        Some(sig) if sig == libc::SIGXFSZ => return limit_exceeded("file size limit exceeded".to_string()),
        _ => {}
    }
    // Under RLIMIT_AS a failed allocation surfaces as a crash, either of the
    // process itself or of a child whose status a shell passed on.
    let crash = status.signal().or_else(|| status.code().map(|code| code - 128));
    if limits.memory_mb > 0 && crash.is_some_and(is_allocation_crash) {
        return limit_exceeded(format!("memory limit of {} MiB exceeded", limits.memory_mb));
    }
    Terminal::exited(exit_code)
}

fn is_allocation_crash(sig: i32) -> bool {
    sig == libc::SIGSEGV || sig == libc::SIGBUS || sig == libc::SIGABRT
}

/// `oom_kill` count of this sidecar's cgroup, when cgroup v2 is mounted.
async fn cgroup_oom_kills() -> Option<u64> {
    let events = tokio::fs::read_to_string(CGROUP_MEMORY_EVENTS).await.ok()?;
    parse_oom_kills(&events)
}

fn parse_oom_kills(events: &str) -> Option<u64> {
    events
        .lines()
        .find_map(|line| line.strip_prefix("oom_kill "))
        .and_then(|count| count.trim().parse().ok())
}

/// SIGTERM the group, then SIGKILL once `grace` has passed.
async fn terminate(child: &mut Child, pgid: Option<Pid>, grace: Duration) {
    signal_group(pgid, Signal::SIGTERM);
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        warn!(pid = ?pgid, "process ignored SIGTERM, killing");
        signal_group(pgid, Signal::SIGKILL);
        let _ = child.wait().await;
    }
}

fn signal_group(pgid: Option<Pid>, signal: Signal) {
    if let Some(pgid) = pgid {
        // ESRCH just means the group is already gone.
        let _ = killpg(pgid, signal);
    }
}

fn spawn_reader<R>(mut reader: R, stream: OutputStream, tx: mpsc::Sender<(OutputStream, Vec<u8>)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send((stream, buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(?stream, error = %e, "pipe read failed");
                    break;
                }
            }
        }
    });
}

enum Forward {
    Sent,
    LimitExceeded,
    ReceiverGone,
}

struct Forwarder<'a> {
    events: &'a EventSender,
    seq: u64,
    bytes: u64,
    max_bytes: u64,
}

impl Forwarder<'_> {
    async fn forward(&mut self, stream: OutputStream, data: Vec<u8>) -> Forward {
        self.bytes += data.len() as u64;
        if self.max_bytes > 0 && self.bytes > self.max_bytes {
            return Forward::LimitExceeded;
        }
        let event = ExecutionEvent::chunk(stream, data, self.seq);
        if self.events.send(Ok(event)).await.is_err() {
            return Forward::ReceiverGone;
        }
        self.seq += 1;
        Forward::Sent
    }
}
