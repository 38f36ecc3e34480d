//! Intelligent Mode — graceful shutdown sequencer.
//!
//! SendingSave → AwaitingExit → (ForcingKill) → Done 순서로 진행합니다.
//! RCON으로 SaveWorld와 DoExit를 보내고, 유예 시간 안에 프로세스가 스스로
//! 내려가지 않으면 강제 종료로 넘어갑니다. 어떤 경로로 끝나든 서버는
//! 반드시 Stopped로 수렴하며, 결과(Graceful/Forced)는 구분되어 보고됩니다.
//! 외부 취소는 없다: 한번 시작된 시퀀스는 스스로 끝까지 간다.

use std::future::Future;
use std::sync::Arc;
use serde::Serialize;
use tokio::time::{timeout, Duration, Instant};

use crate::process_scan;
use crate::protocol::rcon;
use crate::protocol::SessionError;
use crate::registry::ServerStatus;
use crate::supervisor::error::{StopError, SupervisorError};
use crate::supervisor::process::{force_kill_pid, ServerProcess};
use crate::supervisor::Supervisor;

/// Sequencer 진행 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPhase {
    SendingSave,
    AwaitingExit,
    ForcingKill,
    Done,
}

/// Shutdown 결과. Forced는 마지막 저장이 확인되지 않았음을 뜻하므로
/// 호출자(특히 Watcher)가 Graceful과 반드시 구분해야 한다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownOutcome {
    Graceful,
    Forced,
    AlreadyStopped,
}

/// 진행 중인 shutdown 시퀀스 1건의 상태
pub struct ShutdownTask {
    pub server_id: String,
    pub started: Instant,
    pub deadline: Instant,
    pub phase: ShutdownPhase,
}

impl ShutdownTask {
    pub fn new(server_id: impl Into<String>, grace: Duration) -> Self {
        let started = Instant::now();
        Self {
            server_id: server_id.into(),
            started,
            deadline: started + grace,
            phase: ShutdownPhase::SendingSave,
        }
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// 시퀀스의 단계 전이 로직.
///
/// RCON 시도 자체도 남은 유예 시간으로 제한한다. RCON이 어떤 형태로
/// 무응답이든(거부, 행, 인증 실패) ForcingKill 도달은 태스크 생성 시점
/// 기준 grace + ε 안이다.
pub(crate) async fn drive_phases<R, E>(
    task: &mut ShutdownTask,
    save_and_exit: R,
    wait_exit: E,
) -> ShutdownOutcome
where
    R: Future<Output = Result<Vec<String>, SessionError>>,
    E: Future<Output = ()>,
{
    task.phase = ShutdownPhase::SendingSave;
    match timeout(task.remaining(), save_and_exit).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            // RCON 불능이면 기다릴 이유가 없다 — 바로 강제 종료 단계로
            tracing::warn!(server = %task.server_id, "RCON save/exit failed: {}", e);
            task.phase = ShutdownPhase::ForcingKill;
            return ShutdownOutcome::Forced;
        }
        Err(_) => {
            tracing::warn!(server = %task.server_id, "RCON save/exit exceeded grace period");
            task.phase = ShutdownPhase::ForcingKill;
            return ShutdownOutcome::Forced;
        }
    }

    task.phase = ShutdownPhase::AwaitingExit;
    match timeout(task.remaining(), wait_exit).await {
        Ok(()) => {
            task.phase = ShutdownPhase::Done;
            ShutdownOutcome::Graceful
        }
        Err(_) => {
            task.phase = ShutdownPhase::ForcingKill;
            ShutdownOutcome::Forced
        }
    }
}

/// 프로세스 핸들이 있으면 exit watch, 없으면 추적 PID를 폴링한다.
async fn wait_exit(process: Option<Arc<ServerProcess>>, fallback_pid: Option<u32>) {
    match process {
        Some(process) => process.wait_for_exit().await,
        None => {
            if let Some(pid) = fallback_pid {
                while process_scan::is_running_async(pid).await {
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            }
        }
    }
}

impl Supervisor {
    /// Intelligent Mode 정지 실행.
    ///
    /// 서버당 동시에 1건만 허용되며(try_begin_stop), 이미 정지된 서버에
    /// 대해서는 AlreadyStopped no-op입니다.
    pub(crate) async fn run_shutdown(&self, id: &str) -> Result<ShutdownOutcome, SupervisorError> {
        let server = self
            .server(id)
            .await
            .ok_or_else(|| SupervisorError::ServerNotFound(id.to_string()))?;

        let _guard = self.try_begin_stop(id)?;

        let process = self.live_process(id).await;
        let tracked_pid = process.as_ref().map(|p| p.pid).or(server.last_pid);

        let anything_alive = if process.is_some() {
            true
        } else {
            match server.last_pid {
                Some(pid) => process_scan::is_running_async(pid).await,
                None => false,
            }
        };
        if !anything_alive {
            // Crashed 등 비정상 표시도 여기서 Stopped로 정규화된다
            if server.declared_status != ServerStatus::Stopped {
                self.set_last_pid(id, None).await;
                self.set_status(id, ServerStatus::Stopped).await;
            }
            return Ok(ShutdownOutcome::AlreadyStopped);
        }

        let mut task = ShutdownTask::new(id, self.config.grace_period());
        tracing::info!(
            server = id,
            grace_secs = self.config.grace_period_secs,
            "Beginning graceful shutdown"
        );
        self.log_stream(id)
            .await
            .push_system("Graceful shutdown initiated: SaveWorld, then DoExit".to_string());

        let save_and_exit = rcon::execute_session(
            "127.0.0.1".to_string(),
            server.ports.rcon_port,
            server.rcon_password.clone(),
            vec!["SaveWorld".to_string(), "DoExit".to_string()],
            self.config.rcon_timeout(),
            self.config.save_settle(),
        );
        let exit = wait_exit(process.clone(), server.last_pid);

        let outcome = drive_phases(&mut task, save_and_exit, exit).await;

        if outcome == ShutdownOutcome::Forced {
            if let Some(pid) = tracked_pid {
                if process_scan::is_running_async(pid).await {
                    tracing::warn!(server = id, pid, "Grace period exhausted, force killing");
                    force_kill_pid(pid).map_err(|e| {
                        SupervisorError::Stop(StopError::KillFailed {
                            pid,
                            reason: e.to_string(),
                        })
                    })?;
                }
            }
            if let Some(ref process) = process {
                let _ = timeout(Duration::from_secs(10), process.wait_for_exit()).await;
            }
        }
        task.phase = ShutdownPhase::Done;

        self.drop_process(id).await;
        self.set_last_pid(id, None).await;
        self.set_status(id, ServerStatus::Stopped).await;

        let logs = self.log_stream(id).await;
        match outcome {
            ShutdownOutcome::Graceful => {
                logs.push_system("Graceful shutdown complete, world save confirmed".to_string());
            }
            _ => {
                logs.push_system(
                    "Process killed after grace period, last save not confirmed".to_string(),
                );
            }
        }
        tracing::info!(server = id, outcome = ?outcome, "Shutdown sequence finished");

        Ok(outcome)
    }
}

// ─── Tests ───────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WardenConfig;
    use crate::registry::{ManagedServer, ServerPorts};
    use crate::supervisor::StopMode;
    use std::path::Path;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_phases_graceful_path() {
        let mut task = ShutdownTask::new("s1", Duration::from_secs(5));
        let rcon = async { Ok(vec!["World Saved".to_string(), String::new()]) };
        let exit = async { tokio::time::sleep(Duration::from_millis(50)).await };

        let outcome = drive_phases(&mut task, rcon, exit).await;
        assert_eq!(outcome, ShutdownOutcome::Graceful);
        assert_eq!(task.phase, ShutdownPhase::Done);
    }

    #[tokio::test]
    async fn test_phases_rcon_failure_skips_to_kill() {
        let started = Instant::now();
        let mut task = ShutdownTask::new("s1", Duration::from_secs(5));
        let rcon = async { Err(SessionError::Task("connection refused".to_string())) };
        let exit = std::future::pending::<()>();

        let outcome = drive_phases(&mut task, rcon, exit).await;
        assert_eq!(outcome, ShutdownOutcome::Forced);
        assert_eq!(task.phase, ShutdownPhase::ForcingKill);
        // RCON 실패 시 유예 시간을 기다리지 않는다
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_phases_hung_rcon_bounded_by_grace() {
        let started = Instant::now();
        let mut task = ShutdownTask::new("s1", Duration::from_millis(200));
        let rcon = std::future::pending::<Result<Vec<String>, SessionError>>();
        let exit = std::future::pending::<()>();

        let outcome = drive_phases(&mut task, rcon, exit).await;
        assert_eq!(outcome, ShutdownOutcome::Forced);
        // grace + ε 안에 ForcingKill 도달
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_phases_no_exit_forces_at_deadline() {
        let started = Instant::now();
        let mut task = ShutdownTask::new("s1", Duration::from_millis(300));
        let rcon = async { Ok(vec![String::new(), String::new()]) };
        let exit = std::future::pending::<()>();

        let outcome = drive_phases(&mut task, rcon, exit).await;
        assert_eq!(outcome, ShutdownOutcome::Forced);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    // ── Supervisor-level ─────────────────────────────────────

    fn test_config(dir: &Path) -> WardenConfig {
        let mut cfg = WardenConfig::default();
        cfg.registry_path = dir.join("servers.json").to_string_lossy().into_owned();
        cfg.readiness_timeout_secs = 0;
        cfg.grace_period_secs = 1;
        cfg.rcon_timeout_secs = 1;
        cfg
    }

    #[tokio::test]
    async fn test_graceful_on_stopped_server_is_noop() {
        let dir = TempDir::new().unwrap();
        let supervisor = Arc::new(Supervisor::new(test_config(dir.path())));
        supervisor.initialize().await.unwrap();

        let install = dir.path().join("a");
        std::fs::create_dir_all(&install).unwrap();
        let server = ManagedServer::new(
            "island",
            install,
            ServerPorts { game_port: 7777, query_port: 27015, rcon_port: 27020 },
            "pw",
        );
        let id = supervisor.add_server(server).await.unwrap();

        let outcome = supervisor.stop(&id, StopMode::Graceful).await.unwrap();
        assert_eq!(outcome, ShutdownOutcome::AlreadyStopped);
        assert_eq!(
            supervisor.server(&id).await.unwrap().declared_status,
            ServerStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_second_stop_rejected_while_in_progress() {
        let dir = TempDir::new().unwrap();
        let supervisor = Arc::new(Supervisor::new(test_config(dir.path())));
        supervisor.initialize().await.unwrap();

        let install = dir.path().join("a");
        std::fs::create_dir_all(&install).unwrap();
        let server = ManagedServer::new(
            "island",
            install,
            ServerPorts { game_port: 7777, query_port: 27015, rcon_port: 27020 },
            "pw",
        );
        let id = supervisor.add_server(server).await.unwrap();

        // 진행 중인 stop을 흉내 내는 가드
        let _guard = supervisor.try_begin_stop(&id).unwrap();

        let err = supervisor.stop(&id, StopMode::Graceful).await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Stop(StopError::AlreadyInProgress)
        ));
        // Forceful도 같은 배타성 아래 있다
        let err = supervisor.stop(&id, StopMode::Forceful).await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Stop(StopError::AlreadyInProgress)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreachable_rcon_falls_back_to_force() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let supervisor = Arc::new(Supervisor::new(test_config(dir.path())));
        supervisor.initialize().await.unwrap();

        let wrapper = dir.path().join("fake-server.sh");
        std::fs::write(&wrapper, "#!/bin/sh\nsleep 60\n").unwrap();
        std::fs::set_permissions(&wrapper, std::fs::Permissions::from_mode(0o755)).unwrap();

        let install = dir.path().join("a");
        std::fs::create_dir_all(&install).unwrap();
        let mut server = ManagedServer::new(
            "island",
            install,
            // 아무도 듣지 않는 RCON 포트 → connection refused
            ServerPorts { game_port: 7777, query_port: 27015, rcon_port: 59123 },
            "pw",
        );
        server.executable_override = Some(wrapper);
        let id = supervisor.add_server(server).await.unwrap();

        let pid = supervisor.clone().start(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let started = Instant::now();
        let outcome = supervisor.stop(&id, StopMode::Graceful).await.unwrap();
        assert_eq!(outcome, ShutdownOutcome::Forced);
        // RCON 거부 → 유예 전체를 기다리지 않고 강제 종료로 간다
        assert!(started.elapsed() < Duration::from_secs(4));

        assert_eq!(
            supervisor.server(&id).await.unwrap().declared_status,
            ServerStatus::Stopped
        );
        assert!(!process_scan::is_running(pid));

        // Forced 후에도 즉시 재기동 가능
        let pid2 = supervisor.clone().start(&id).await.unwrap();
        assert_ne!(pid, pid2);
        supervisor.stop(&id, StopMode::Forceful).await.unwrap();
    }
}
