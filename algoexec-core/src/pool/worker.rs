//! One supervised worker child process and its line protocol.
//!
//! Grounded on `enviro-core/src/engine/isolation.rs`'s use of
//! `std::os::unix::process::CommandExt::pre_exec` to prepare a child
//! before `exec`; here it's used to put each worker in its own process
//! group (`setsid`) so a timeout kill can take out the whole subtree
//! without touching the parent or siblings.

use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use super::{WireRequest, WireResponse};

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// A live worker subprocess: its stdio pipes and the OS process id needed
/// to signal its process group.
pub struct WorkerHandle {
    child: Child,
    pid: i32,
    /// Stable identifier distinct from the OS pid (which the kernel can
    /// reuse once a process exits) - this is what lets a caller tell a
    /// freshly spawned replacement worker apart from the one it replaced
    /// (`spec.md` §8 invariant 5).
    worker_id: u64,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    pub spawned_at: Instant,
    /// `(name, version)` of stateful algorithms this worker has already
    /// initialized an instance for - used by the supervisor to prefer
    /// routing a stateful request back to a worker that already warmed it.
    pub warm_instances: std::collections::HashSet<(String, String)>,
}

impl WorkerHandle {
    /// Re-execs the current binary with `--worker`, in its own session so
    /// the whole process group can be killed independently later.
    ///
    /// `ALGOEXEC_WORKER_EXE`, when set, overrides the binary that's
    /// re-exec'd instead of `std::env::current_exe()` - used by
    /// integration tests (whose `current_exe()` is the test harness, not
    /// `algoexecd`) and by deployments that want worker processes to run
    /// a different binary than the front door (e.g. a slimmer image).
    pub fn spawn() -> std::io::Result<Self> {
        let exe = match std::env::var_os("ALGOEXEC_WORKER_EXE") {
            Some(path) => std::path::PathBuf::from(path),
            None => std::env::current_exe()?,
        };
        let mut command = Command::new(exe);
        command
            .arg("--worker")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        // Safety: the closure only calls async-signal-safe libc wrappers
        // (setsid) before exec, as required by `pre_exec`'s contract.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                Ok(())
            });
        }

        let mut child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| std::io::Error::other("worker exited before pid was observable"))?
            as i32;
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let lines = BufReader::new(stdout).lines();

        Ok(Self {
            child,
            pid,
            worker_id: NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed),
            stdin,
            lines,
            spawned_at: Instant::now(),
            warm_instances: std::collections::HashSet::new(),
        })
    }

    pub async fn send(&mut self, req: &WireRequest) -> std::io::Result<()> {
        let mut line = serde_json::to_string(req)?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await
    }

    /// Reads one response line. `Ok(None)` means the worker closed its
    /// stdout (crashed or exited) without answering.
    pub async fn recv(&mut self) -> std::io::Result<Option<WireResponse>> {
        match self.lines.next_line().await? {
            Some(line) => Ok(Some(serde_json::from_str(&line)?)),
            None => Ok(None),
        }
    }

    /// Hard-kills the worker's entire process group: SIGTERM, wait up to
    /// `grace`, then SIGKILL if it hasn't exited. `spec.md` §4.5's timeout
    /// contract.
    pub async fn kill_group(&mut self, grace: Duration, kill_tree: bool) {
        let target = if kill_tree { -self.pid } else { self.pid };
        let _ = kill(Pid::from_raw(target), Signal::SIGTERM);

        let waited = tokio::time::timeout(grace, self.child.wait()).await;
        if waited.is_err() {
            let _ = kill(Pid::from_raw(target), Signal::SIGKILL);
            let _ = self.child.wait().await;
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }
}

#[cfg(test)]
mod tests {
    // `WorkerHandle::spawn` re-execs the current test binary, which isn't
    // a meaningful worker; protocol framing is covered indirectly through
    // `super::supervisor`'s tests against an in-process stand-in, and
    // through the integration tests in `tests/` which spawn the real
    // `algoexecd --worker` binary.
}
