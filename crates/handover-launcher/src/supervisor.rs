use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use handover_process::{ProcessRole, ProcessState, ProcessStatus};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc};

use crate::config::SpawnSpec;

/// Which child stream an output chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogSource {
    Stdout,
    Stderr,
}

#[derive(Debug)]
pub enum ChildEvent {
    Output {
        role: ProcessRole,
        source: LogSource,
        chunk: String,
    },
    /// `planned` is true iff the child was in `Stopping` when the exit was
    /// observed, i.e. the launcher itself asked it to go away.
    Exited {
        role: ProcessRole,
        code: Option<i32>,
        signal: Option<i32>,
        planned: bool,
    },
}

#[derive(Debug)]
struct ChildEntry {
    state: ProcessState,
    pid: Option<u32>,
    pgid: Option<i32>,
    exit_code: Option<i32>,
    exit_signal: Option<i32>,
}

/// Owns the two child process handles and reports their output and exits
/// over a single event channel. At most one live instance per role.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Mutex<HashMap<ProcessRole, ChildEntry>>>,
    events: mpsc::UnboundedSender<ChildEvent>,
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the launcher dies (crash/kill), ensure the child is terminated.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

impl ProcessSupervisor {
    pub fn new(events: mpsc::UnboundedSender<ChildEvent>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    pub async fn start(
        &self,
        role: ProcessRole,
        spec: &SpawnSpec,
    ) -> anyhow::Result<ProcessStatus> {
        {
            let mut inner = self.inner.lock().await;
            if let Some(existing) = inner.get(&role)
                && existing.state.is_live()
            {
                anyhow::bail!("{role} already running (pid {:?})", existing.pid);
            }
            // Remove any stale exited entry so the role can be reused.
            inner.remove(&role);
        }

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    // Start a new session so we can signal the whole process tree.
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "spawn {role}: {} {} (cwd {})",
                spec.command,
                spec.args.join(" "),
                spec.cwd.display()
            )
        })?;

        let pid = child.id();
        let pgid = pid.map(|p| p as i32);

        tracing::info!(%role, pid = ?pid, command = %spec.command, "spawned child");

        if let Some(out) = child.stdout.take() {
            self.spawn_reader(role, LogSource::Stdout, out);
        }
        if let Some(err) = child.stderr.take() {
            self.spawn_reader(role, LogSource::Stderr, err);
        }

        {
            let mut inner = self.inner.lock().await;
            inner.insert(
                role,
                ChildEntry {
                    state: ProcessState::Running,
                    pid,
                    pgid,
                    exit_code: None,
                    exit_signal: None,
                },
            );
        }

        // Wait task: record the exit and report whether it was planned.
        let inner = self.inner.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let res = child.wait().await;
            let (code, signal) = match res {
                Ok(status) => (status.code(), exit_signal(&status)),
                Err(_) => (None, None),
            };

            let planned = {
                let mut map = inner.lock().await;
                let Some(e) = map.get_mut(&role) else {
                    return;
                };
                let planned = matches!(e.state, ProcessState::Stopping);
                e.state = if planned || code == Some(0) {
                    ProcessState::Exited
                } else {
                    ProcessState::Failed
                };
                e.pid = None;
                e.exit_code = code;
                e.exit_signal = signal;
                planned
            };

            let _ = events.send(ChildEvent::Exited {
                role,
                code,
                signal,
                planned,
            });
        });

        Ok(ProcessStatus {
            role,
            state: ProcessState::Running,
            pid,
            exit_code: None,
            exit_signal: None,
        })
    }

    fn spawn_reader<R>(&self, role: ProcessRole, source: LogSource, mut stream: R)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                        if events
                            .send(ChildEvent::Output { role, source, chunk })
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });
    }

    pub async fn status(&self, role: ProcessRole) -> Option<ProcessStatus> {
        let inner = self.inner.lock().await;
        inner.get(&role).map(|e| ProcessStatus {
            role,
            state: e.state,
            pid: e.pid,
            exit_code: e.exit_code,
            exit_signal: e.exit_signal,
        })
    }

    pub async fn is_live(&self, role: ProcessRole) -> bool {
        let inner = self.inner.lock().await;
        inner.get(&role).is_some_and(|e| e.state.is_live())
    }

    /// Graceful stop: SIGTERM to the process group, then poll for the exit
    /// until the grace window elapses. No SIGKILL escalation; expiry of the
    /// window proceeds regardless.
    pub async fn stop(&self, role: ProcessRole, grace: Duration) -> anyhow::Result<()> {
        let pgid = {
            let mut inner = self.inner.lock().await;
            let Some(e) = inner.get_mut(&role) else {
                return Ok(());
            };
            if matches!(e.state, ProcessState::Exited | ProcessState::Failed) {
                return Ok(());
            }
            e.state = ProcessState::Stopping;
            e.pgid
        };

        tracing::info!(%role, grace_ms = grace.as_millis() as u64, "stopping child");

        #[cfg(unix)]
        if let Some(pgid) = pgid {
            unsafe {
                libc::kill(-pgid, libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        let _ = pgid;

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            {
                let inner = self.inner.lock().await;
                let gone = inner
                    .get(&role)
                    .is_none_or(|e| matches!(e.state, ProcessState::Exited | ProcessState::Failed));
                if gone {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(%role, "grace window elapsed before exit; continuing");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn sh(script: &str) -> SpawnSpec {
        SpawnSpec {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: PathBuf::from("."),
        }
    }

    async fn next_exit(
        rx: &mut mpsc::UnboundedReceiver<ChildEvent>,
    ) -> (ProcessRole, Option<i32>, Option<i32>, bool) {
        loop {
            match tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for exit event")
                .expect("event channel closed")
            {
                ChildEvent::Exited {
                    role,
                    code,
                    signal,
                    planned,
                } => return (role, code, signal, planned),
                ChildEvent::Output { .. } => continue,
            }
        }
    }

    #[tokio::test]
    async fn reports_output_and_unplanned_exit() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sup = ProcessSupervisor::new(tx);

        sup.start(ProcessRole::Agent, &sh("echo hello"))
            .await
            .unwrap();

        let mut saw_hello = false;
        loop {
            match tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .unwrap()
                .unwrap()
            {
                ChildEvent::Output { role, chunk, .. } => {
                    assert_eq!(role, ProcessRole::Agent);
                    if chunk.contains("hello") {
                        saw_hello = true;
                    }
                }
                ChildEvent::Exited {
                    role,
                    code,
                    planned,
                    ..
                } => {
                    assert_eq!(role, ProcessRole::Agent);
                    assert_eq!(code, Some(0));
                    assert!(!planned);
                    break;
                }
            }
        }
        assert!(saw_hello);
        assert!(!sup.is_live(ProcessRole::Agent).await);
    }

    #[tokio::test]
    async fn rejects_second_instance_of_live_role() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sup = ProcessSupervisor::new(tx);

        sup.start(ProcessRole::Ui, &sh("sleep 30")).await.unwrap();
        let err = sup
            .start(ProcessRole::Ui, &sh("sleep 30"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already running"));

        sup.stop(ProcessRole::Ui, Duration::from_secs(5))
            .await
            .unwrap();
        let (role, _, signal, planned) = next_exit(&mut rx).await;
        assert_eq!(role, ProcessRole::Ui);
        assert!(planned);
        assert_eq!(signal, Some(libc::SIGTERM));
    }

    #[tokio::test]
    async fn stale_entry_is_replaced_on_restart() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sup = ProcessSupervisor::new(tx);

        sup.start(ProcessRole::Agent, &sh("true")).await.unwrap();
        let (_, code, _, planned) = next_exit(&mut rx).await;
        assert_eq!(code, Some(0));
        assert!(!planned);

        // Same role can be started again once the old instance is gone.
        sup.start(ProcessRole::Agent, &sh("sleep 30"))
            .await
            .unwrap();
        assert!(sup.is_live(ProcessRole::Agent).await);
        sup.stop(ProcessRole::Agent, Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_as_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sup = ProcessSupervisor::new(tx);

        sup.start(ProcessRole::Agent, &sh("exit 7")).await.unwrap();
        let (_, code, _, planned) = next_exit(&mut rx).await;
        assert_eq!(code, Some(7));
        assert!(!planned);

        let status = sup.status(ProcessRole::Agent).await.unwrap();
        assert_eq!(status.state, ProcessState::Failed);
        assert_eq!(status.exit_code, Some(7));
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_an_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sup = ProcessSupervisor::new(tx);

        let spec = SpawnSpec {
            command: "/nonexistent/handover-no-such-binary".to_string(),
            args: vec![],
            cwd: PathBuf::from("."),
        };
        let err = sup.start(ProcessRole::Agent, &spec).await.unwrap_err();
        assert!(err.to_string().contains("spawn agent"));
    }
}
