//! Spawned server process wrapper: stdio capture into the log pipeline and
//! an exit watch channel that is independent of log delivery.

use std::path::Path;
use std::sync::Arc;
use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::watch;

use crate::logs::{LogSource, LogStream};
use crate::registry::ManagedServer;

/// Force-kill a process by PID. Cross-platform helper.
pub fn force_kill_pid(pid: u32) -> Result<()> {
    #[cfg(target_os = "windows")]
    {
        use winapi::um::handleapi::CloseHandle;
        use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
        use winapi::um::winnt::PROCESS_TERMINATE;

        unsafe {
            let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
            if handle.is_null() {
                return Err(anyhow::anyhow!("Failed to open process {}", pid));
            }
            let result = TerminateProcess(handle, 1);
            CloseHandle(handle);
            if result == 0 {
                return Err(anyhow::anyhow!("TerminateProcess failed for PID {}", pid));
            }
        }
    }
    #[cfg(not(target_os = "windows"))]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL)
            .map_err(|e| anyhow::anyhow!("Failed to kill PID {}: {}", pid, e))?;
    }
    Ok(())
}

/// ASA 서버 런치 인수 생성.
///
/// 형식: `<Map>?listen?SessionName=..?Port=..?QueryPort=..?RCONPort=..`
/// 뒤에 `-log -NoBattlEye`, 클러스터면 `-clusterid` / `-ClusterDirOverride`.
pub fn build_launch_args(server: &ManagedServer) -> Vec<String> {
    let mut main_arg = format!(
        "{}?listen?SessionName={}?Port={}?QueryPort={}?RCONPort={}?RCONEnabled=True?MaxPlayers={}?ServerAdminPassword={}",
        server.map_name,
        server.session_name,
        server.ports.game_port,
        server.ports.query_port,
        server.ports.rcon_port,
        server.max_players,
        server.rcon_password,
    );
    if let Some(ref password) = server.server_password {
        main_arg.push_str(&format!("?ServerPassword={}", password));
    }

    let mut args = vec![main_arg, "-log".to_string(), "-NoBattlEye".to_string()];

    if let Some(ref cluster) = server.cluster {
        if !cluster.cluster_id.is_empty() {
            args.push(format!("-clusterid={}", cluster.cluster_id));
            args.push(format!(
                "-ClusterDirOverride={}",
                cluster.cluster_dir.display()
            ));
        }
    }

    args
}

/// A server process owned by the supervisor.
///
/// 소유권 규칙: OS 프로세스 핸들은 여기(그리고 waiter 태스크)만 가진다.
/// 다른 컴포넌트는 PID와 exit watch만 본다.
pub struct ServerProcess {
    pub pid: u32,
    running_rx: watch::Receiver<bool>,
}

impl ServerProcess {
    /// Spawn the server executable with piped stdio wired into `logs`.
    ///
    /// Exit detection은 로그 리더와 별개의 waiter 태스크가 child.wait()로
    /// 수행하므로, 로그 파이프가 막혀도 종료는 즉시 관측됩니다.
    pub async fn spawn(
        program: &Path,
        args: &[String],
        working_dir: &Path,
        logs: Arc<LogStream>,
    ) -> Result<Self> {
        let mut cmd = TokioCommand::new(program);
        cmd.args(args)
            .current_dir(working_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);

        // Windows: hide console window
        crate::utils::apply_creation_flags(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn '{}': {}", program.display(), e))?;

        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("Failed to get PID of spawned process"))?;

        let (running_tx, running_rx) = watch::channel(true);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // ── stdout reader ────────────────────────────────────
        if let Some(stdout) = stdout {
            let logs = logs.clone();
            tokio::spawn(async move {
                let reader = BufReader::new(stdout);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    logs.push_raw(LogSource::Stdout, line);
                }
            });
        }

        // ── stderr reader ────────────────────────────────────
        if let Some(stderr) = stderr {
            let logs = logs.clone();
            tokio::spawn(async move {
                let reader = BufReader::new(stderr);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    logs.push_raw(LogSource::Stderr, line);
                }
            });
        }

        // ── process waiter ───────────────────────────────────
        {
            let logs = logs.clone();
            tokio::spawn(async move {
                let exit_msg = match child.wait().await {
                    Ok(status) => format!("Process exited with {}", status),
                    Err(e) => format!("Failed to wait for process: {}", e),
                };
                tracing::info!(pid, "{}", exit_msg);
                logs.push_system(exit_msg);
                let _ = running_tx.send(false);
            });
        }

        logs.push_system(format!("Process started with PID {}", pid));

        Ok(Self { pid, running_rx })
    }

    /// Whether the process is still running.
    pub fn is_running(&self) -> bool {
        *self.running_rx.borrow()
    }

    /// Independent exit observer — 구독자마다 자기 receiver를 갖는다.
    pub fn exit_watch(&self) -> watch::Receiver<bool> {
        self.running_rx.clone()
    }

    /// Wait until the process exits.
    pub async fn wait_for_exit(&self) {
        let mut rx = self.exit_watch();
        while *rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────
