//! Native process execution strategy.
//!
//! Runs the server's main process as a direct child of the daemon with piped
//! stdio. Output is pumped into the console buffer; a dedicated exit watcher
//! reaps the child and keeps `is_running` accurate without requiring callers
//! to wait.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::console::{ConsoleBuffer, ConsoleEvent};
use crate::files::FileSandbox;

use super::{EnvError, Environment, LaunchConfig, ProcessStats, Result, StopMethod};

struct ProcessHandle {
    pid: u32,
    stdin: Option<ChildStdin>,
}

pub struct NativeEnvironment {
    server_id: String,
    launch: Arc<RwLock<LaunchConfig>>,
    working_dir: PathBuf,
    console: Arc<ConsoleBuffer>,
    sandbox: FileSandbox,
    /// Some while a live process handle exists; cleared by the exit watcher.
    state: Arc<Mutex<Option<ProcessHandle>>>,
    running_tx: Arc<watch::Sender<bool>>,
}

impl NativeEnvironment {
    pub fn new(
        server_id: String,
        launch: Arc<RwLock<LaunchConfig>>,
        working_dir: PathBuf,
        console: ConsoleBuffer,
    ) -> Self {
        let (running_tx, _) = watch::channel(false);
        Self {
            server_id,
            launch,
            sandbox: FileSandbox::new(&working_dir),
            working_dir,
            console: Arc::new(console),
            state: Arc::new(Mutex::new(None)),
            running_tx: Arc::new(running_tx),
        }
    }

    /// Take the stdin handle out of the live entry, run `f` on it, and put it
    /// back. Avoids holding the state lock across the write.
    async fn with_stdin(&self, line: &str) -> Result<()> {
        let mut stdin = {
            let mut guard = self.state.lock().expect("state lock poisoned");
            let handle = guard.as_mut().ok_or(EnvError::NotRunning)?;
            handle.stdin.take().ok_or(EnvError::InputUnavailable)?
        };

        let result = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await?;
            Ok::<(), EnvError>(())
        }
        .await;

        let mut guard = self.state.lock().expect("state lock poisoned");
        if let Some(handle) = guard.as_mut() {
            handle.stdin = Some(stdin);
        }
        result
    }

    fn current_pid(&self) -> Option<u32> {
        self.state
            .lock()
            .expect("state lock poisoned")
            .as_ref()
            .map(|h| h.pid)
    }

    fn spawn_output_pump(
        &self,
        mut reader: impl AsyncReadExt + Unpin + Send + 'static,
    ) {
        let console = self.console.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 8192];
            let mut pending = Vec::new();
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        pending.extend_from_slice(&buf[..n]);
                        let text = drain_utf8(&mut pending);
                        if !text.is_empty() {
                            console.write(&text);
                        }
                    }
                }
            }
            if !pending.is_empty() {
                console.write(&String::from_utf8_lossy(&pending));
            }
        });
    }

    fn spawn_exit_watcher(&self, mut child: Child) {
        let server_id = self.server_id.clone();
        let console = self.console.clone();
        let state = self.state.clone();
        let running_tx = self.running_tx.clone();
        tokio::spawn(async move {
            let exit_code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(server = %server_id, error = %e, "Failed to wait on main process");
                    None
                }
            };

            state.lock().expect("state lock poisoned").take();
            running_tx.send_replace(false);

            console.flush();
            match exit_code {
                Some(code) => console.write_line(&format!("[berth] server stopped (exit {code})")),
                None => console.write_line("[berth] server stopped"),
            }
            console.broadcast(ConsoleEvent::Stopped { exit_code });
            info!(server = %server_id, exit = ?exit_code, "Main process exited");
        });
    }
}

/// Decode the buffered bytes, holding back an incomplete trailing multi-byte
/// sequence until its continuation bytes arrive. A read boundary inside a
/// UTF-8 character must not surface as replacement characters.
fn drain_utf8(pending: &mut Vec<u8>) -> String {
    let split = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        // Genuinely invalid bytes: decode lossily rather than stall.
        Err(_) => pending.len(),
    };
    let tail = pending.split_off(split);
    let text = String::from_utf8_lossy(pending).into_owned();
    *pending = tail;
    text
}

#[async_trait]
impl Environment for NativeEnvironment {
    async fn start(&self) -> Result<()> {
        let launch = self.launch.read().await.clone();

        tokio::fs::create_dir_all(&self.working_dir).await?;

        let mut guard = self.state.lock().expect("state lock poisoned");
        if guard.is_some() {
            return Err(EnvError::AlreadyRunning);
        }

        let mut cmd = Command::new(&launch.command);
        cmd.args(&launch.args)
            .envs(&launch.environment)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| EnvError::SpawnFailed(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| EnvError::SpawnFailed("process exited before tracking".into()))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        *guard = Some(ProcessHandle { pid, stdin });
        drop(guard);
        self.running_tx.send_replace(true);

        info!(server = %self.server_id, pid, command = %launch.command, "Starting server");
        self.console.write_line("[berth] starting server");

        if let Some(out) = stdout {
            self.spawn_output_pump(out);
        }
        if let Some(err) = stderr {
            self.spawn_output_pump(err);
        }
        self.spawn_exit_watcher(child);

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let stop = self.launch.read().await.stop.clone();

        match stop {
            StopMethod::Command { command } => {
                debug!(server = %self.server_id, "Stopping via console command");
                self.with_stdin(&command).await
            }
            StopMethod::Signal { signal } => {
                let pid = self.current_pid().ok_or(EnvError::NotRunning)?;
                debug!(server = %self.server_id, pid, signal, "Stopping via signal");
                // SAFETY: pid came from a live Child handle tracked by this
                // environment.
                unsafe {
                    libc::kill(pid as libc::pid_t, signal);
                }
                Ok(())
            }
        }
    }

    async fn kill(&self) -> Result<()> {
        let Some(pid) = self.current_pid() else {
            // Killing a stopped environment is a no-op.
            return Ok(());
        };
        info!(server = %self.server_id, pid, "Killing server");
        // SAFETY: see stop().
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGKILL);
        }
        Ok(())
    }

    async fn wait_for_main_process(&self) {
        let mut rx = self.running_tx.subscribe();
        while *rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    async fn wait_for_main_process_for(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_for_main_process())
            .await
            .is_ok()
    }

    fn is_running(&self) -> bool {
        *self.running_tx.borrow()
    }

    async fn get_stats(&self) -> Result<ProcessStats> {
        use sysinfo::{Pid, ProcessRefreshKind, System, MINIMUM_CPU_UPDATE_INTERVAL};

        let pid = Pid::from_u32(self.current_pid().ok_or(EnvError::NotRunning)?);
        let refresh = ProcessRefreshKind::new().with_cpu().with_memory();

        // CPU utilization needs two samples spaced apart.
        let mut system = System::new();
        system.refresh_process_specifics(pid, refresh);
        tokio::time::sleep(MINIMUM_CPU_UPDATE_INTERVAL).await;
        system.refresh_process_specifics(pid, refresh);

        let process = system.process(pid).ok_or(EnvError::NotRunning)?;
        Ok(ProcessStats {
            cpu: f64::from(process.cpu_usage()),
            memory: process.memory() as f64,
        })
    }

    async fn send_input(&self, line: &str) -> Result<()> {
        self.with_stdin(line).await
    }

    fn console(&self) -> &ConsoleBuffer {
        &self.console
    }

    fn sandbox(&self) -> &FileSandbox {
        &self.sandbox
    }

    fn working_directory(&self) -> &Path {
        &self.working_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_utf8_holds_back_split_character() {
        // "é" is 0xC3 0xA9; split it across two reads.
        let mut pending = vec![b'h', 0xC3];
        assert_eq!(drain_utf8(&mut pending), "h");
        assert_eq!(pending, vec![0xC3]);

        pending.push(0xA9);
        assert_eq!(drain_utf8(&mut pending), "é");
        assert!(pending.is_empty());
    }

    #[test]
    fn drain_utf8_passes_complete_input_through() {
        let mut pending = "server läuft\n".as_bytes().to_vec();
        assert_eq!(drain_utf8(&mut pending), "server läuft\n");
        assert!(pending.is_empty());
    }

    #[test]
    fn drain_utf8_replaces_invalid_bytes() {
        let mut pending = vec![b'a', 0xFF, b'b'];
        assert_eq!(drain_utf8(&mut pending), "a\u{FFFD}b");
        assert!(pending.is_empty());
    }
}
