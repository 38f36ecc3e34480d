pub mod error;
pub mod process;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use anyhow::Result;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::{Duration, Instant};

use crate::config::WardenConfig;
use crate::logs::{LogLine, LogStream};
use crate::process_scan;
use crate::protocol::rcon;
use crate::registry::{ManagedServer, RegistryStore, ServerStatus};
use error::{LaunchError, StopError, SupervisorError};
use process::{build_launch_args, force_kill_pid, ServerProcess};

/// 상태 전이 알림 — UI 등 구독자에게 broadcast로 전달.
/// 느린 구독자는 lag으로 이벤트를 잃을 뿐 생산자를 막지 않는다.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub server_id: String,
    pub status: ServerStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    Graceful,
    Forceful,
}

/// Process Supervisor — 서버 OS 프로세스 생사에 대한 단일 진실 공급원.
///
/// declared_status를 전이시킬 수 있는 유일한 컴포넌트입니다. Sequencer와
/// Watcher는 반드시 이 API를 통해 전이를 요청합니다.
pub struct Supervisor {
    pub(crate) config: WardenConfig,
    registry: RwLock<RegistryStore>,
    /// 살아있는 프로세스 핸들 — Supervisor가 배타적으로 소유
    processes: Mutex<HashMap<String, Arc<ServerProcess>>>,
    /// 서버별 로그 파이프라인 (프로세스 수명과 독립)
    logs: Mutex<HashMap<String, Arc<LogStream>>>,
    /// 진행 중인 stop/shutdown 작업 — 서버당 최대 1개, 원자적으로 검사
    stops_in_flight: Arc<StdMutex<HashSet<String>>>,
    /// 진행 중인 start/update 예약 — 검사와 spawn 사이의 레이스 차단
    starts_in_flight: Arc<StdMutex<HashSet<String>>>,
    status_tx: broadcast::Sender<StatusEvent>,
}

/// in-flight 집합에서의 등록 해제를 보장하는 가드
pub(crate) struct InFlightGuard {
    set: Arc<StdMutex<HashSet<String>>>,
    server_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.server_id);
    }
}

fn try_reserve(set: &Arc<StdMutex<HashSet<String>>>, id: &str) -> Option<InFlightGuard> {
    let mut guard = set.lock().unwrap_or_else(|e| e.into_inner());
    if !guard.insert(id.to_string()) {
        return None;
    }
    Some(InFlightGuard {
        set: Arc::clone(set),
        server_id: id.to_string(),
    })
}

impl Supervisor {
    pub fn new(config: WardenConfig) -> Self {
        let registry = RegistryStore::new(&config.registry_path);
        let (status_tx, _) = broadcast::channel(256);
        Self {
            config,
            registry: RwLock::new(registry),
            processes: Mutex::new(HashMap::new()),
            logs: Mutex::new(HashMap::new()),
            stops_in_flight: Arc::new(StdMutex::new(HashSet::new())),
            starts_in_flight: Arc::new(StdMutex::new(HashSet::new())),
            status_tx,
        }
    }

    /// 레지스트리 로드 후 startup reconciliation 수행
    pub async fn initialize(&self) -> Result<()> {
        {
            let mut registry = self.registry.write().await;
            registry.load()?;
        }
        self.reconcile().await?;
        Ok(())
    }

    // ─── Registry access ─────────────────────────────────────

    pub async fn add_server(&self, server: ManagedServer) -> Result<String, SupervisorError> {
        let id = server.id.clone();
        let mut registry = self.registry.write().await;
        registry.add(server).map_err(|e| SupervisorError::Internal(e.into()))?;
        Ok(id)
    }

    pub async fn remove_server(&self, id: &str) -> Result<(), SupervisorError> {
        {
            let processes = self.processes.lock().await;
            if processes.get(id).map(|p| p.is_running()).unwrap_or(false) {
                return Err(SupervisorError::Launch(LaunchError::AlreadyRunning));
            }
        }
        let mut registry = self.registry.write().await;
        registry
            .remove(id)
            .map_err(|_| SupervisorError::ServerNotFound(id.to_string()))?;
        Ok(())
    }

    pub async fn server(&self, id: &str) -> Option<ManagedServer> {
        self.registry.read().await.get(id).cloned()
    }

    pub async fn list_servers(&self) -> Vec<ManagedServer> {
        self.registry.read().await.list().to_vec()
    }

    // ─── Status transitions (supervisor 전용) ────────────────

    /// 상태 전이 + 영속화 + broadcast. 이 함수 밖에서 declared_status를
    /// 바꾸는 코드는 존재해서는 안 된다.
    pub(crate) async fn set_status(&self, id: &str, status: ServerStatus) {
        {
            let mut registry = self.registry.write().await;
            if let Err(e) = registry.set_status(id, status) {
                tracing::error!("Failed to persist status for '{}': {}", id, e);
                return;
            }
        }
        tracing::info!(server = id, "Status transition → {}", status);
        let _ = self.status_tx.send(StatusEvent { server_id: id.to_string(), status });
    }

    pub(crate) async fn set_last_pid(&self, id: &str, pid: Option<u32>) {
        let mut registry = self.registry.write().await;
        if let Err(e) = registry.set_last_pid(id, pid) {
            tracing::error!("Failed to persist pid for '{}': {}", id, e);
        }
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status_tx.subscribe()
    }

    // ─── Log pipeline access ─────────────────────────────────

    pub async fn log_stream(&self, id: &str) -> Arc<LogStream> {
        let mut logs = self.logs.lock().await;
        logs.entry(id.to_string())
            .or_insert_with(|| Arc::new(LogStream::new(self.config.log_buffer_size)))
            .clone()
    }

    pub async fn console_since(&self, id: &str, since: u64) -> Vec<LogLine> {
        self.log_stream(id).await.get_since(since)
    }

    pub async fn recent_console(&self, id: &str, count: usize) -> Vec<LogLine> {
        self.log_stream(id).await.get_recent(count)
    }

    // ─── Lifecycle ───────────────────────────────────────────

    /// 서버 기동. Starting으로 전이 후 readiness(첫 RCON 인증 성공 또는
    /// 제한 시간)가 확인되면 Running으로 전이합니다.
    ///
    /// start 예약 가드가 검사부터 processes 등록까지를 서버별로
    /// 직렬화한다 — 동시 start 두 건이 둘 다 spawn하는 일은 없다.
    pub async fn start(self: Arc<Self>, id: &str) -> Result<u32, SupervisorError> {
        let server = self
            .server(id)
            .await
            .ok_or_else(|| SupervisorError::ServerNotFound(id.to_string()))?;

        let _start_guard = self.try_begin_start(id)?;

        {
            let processes = self.processes.lock().await;
            if processes.get(id).map(|p| p.is_running()).unwrap_or(false) {
                return Err(LaunchError::AlreadyRunning.into());
            }
        }
        if matches!(server.declared_status, ServerStatus::Updating) {
            return Err(LaunchError::AlreadyRunning.into());
        }

        if let Some(port) = self.registry.read().await.port_conflict(id) {
            return Err(LaunchError::BindConflict(port).into());
        }

        let executable = server.executable_path();
        if !executable.exists() {
            return Err(LaunchError::ExecutableMissing(executable).into());
        }

        let args = build_launch_args(&server);
        let logs = self.log_stream(id).await;
        let process = ServerProcess::spawn(&executable, &args, &server.install_path, logs)
            .await
            .map_err(|e| {
                // spawn 실패는 Stopped 유지 — 호출자에게 즉시 보고
                SupervisorError::Launch(LaunchError::SpawnFailed(e.to_string()))
            })?;

        let pid = process.pid;
        let process = Arc::new(process);
        {
            let mut processes = self.processes.lock().await;
            processes.insert(id.to_string(), process.clone());
        }
        self.set_last_pid(id, Some(pid)).await;
        self.set_status(id, ServerStatus::Starting).await;

        Self::spawn_readiness_task(self.clone(), id.to_string(), server, process.clone());
        Self::spawn_crash_watch(self, id.to_string(), process);

        tracing::info!(server = id, pid, "Server process launched");
        Ok(pid)
    }

    /// readiness 판정: RCON 인증이 성공하거나 제한 시간이 지나면 Running.
    fn spawn_readiness_task(
        supervisor: Arc<Self>,
        id: String,
        server: ManagedServer,
        process: Arc<ServerProcess>,
    ) {
        tokio::spawn(async move {
            let deadline = Instant::now() + supervisor.config.readiness_timeout();
            while Instant::now() < deadline {
                if !process.is_running() {
                    return; // crash watch가 처리
                }
                if rcon::probe(
                    "127.0.0.1".to_string(),
                    server.ports.rcon_port,
                    server.rcon_password.clone(),
                    Duration::from_secs(2),
                )
                .await
                {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
            }

            if !process.is_running() {
                return;
            }
            // 아직 Starting일 때만 Running으로 올린다
            if let Some(current) = supervisor.server(&id).await {
                if current.declared_status == ServerStatus::Starting {
                    supervisor.set_status(&id, ServerStatus::Running).await;
                }
            }
        });
    }

    /// 프로세스 종료 감시: 의도된 stop이 아닌 종료는 Crashed로 표면화.
    /// 로그 리더와 독립적인 exit watch를 쓰므로 로그 파이프가 막혀도
    /// 종료는 관측된다.
    fn spawn_crash_watch(supervisor: Arc<Self>, id: String, process: Arc<ServerProcess>) {
        tokio::spawn(async move {
            process.wait_for_exit().await;

            {
                let mut processes = supervisor.processes.lock().await;
                if let Some(existing) = processes.get(&id) {
                    if Arc::ptr_eq(existing, &process) {
                        processes.remove(&id);
                    }
                }
            }

            // 의도된 stop/shutdown 진행 중이면 sequencer가 상태를 마무리한다
            if supervisor.stop_in_flight(&id) {
                return;
            }

            if let Some(server) = supervisor.server(&id).await {
                if matches!(
                    server.declared_status,
                    ServerStatus::Running | ServerStatus::Starting
                ) {
                    tracing::warn!(server = %id, pid = process.pid, "Unexpected exit — marking crashed");
                    supervisor
                        .log_stream(&id)
                        .await
                        .push_system("Server process exited unexpectedly".to_string());
                    supervisor.set_last_pid(&id, None).await;
                    supervisor.set_status(&id, ServerStatus::Crashed).await;
                }
            }
        });
    }

    /// 서버 정지. Graceful은 Shutdown Sequencer에 위임하고, Forceful은
    /// 즉시 강제 종료합니다. 이미 정지된 서버에 대해서는 no-op 성공.
    pub async fn stop(
        &self,
        id: &str,
        mode: StopMode,
    ) -> Result<crate::shutdown::ShutdownOutcome, SupervisorError> {
        match mode {
            StopMode::Graceful => self.run_shutdown(id).await,
            StopMode::Forceful => self.force_stop(id).await,
        }
    }

    pub(crate) async fn force_stop(
        &self,
        id: &str,
    ) -> Result<crate::shutdown::ShutdownOutcome, SupervisorError> {
        use crate::shutdown::ShutdownOutcome;

        let server = self
            .server(id)
            .await
            .ok_or_else(|| SupervisorError::ServerNotFound(id.to_string()))?;

        let _guard = self.try_begin_stop(id)?;

        let process = {
            let mut processes = self.processes.lock().await;
            processes.remove(id)
        };

        match process {
            Some(process) if process.is_running() => {
                tracing::info!(server = id, pid = process.pid, "Forcefully terminating");
                force_kill_pid(process.pid).map_err(|e| {
                    SupervisorError::Stop(StopError::KillFailed {
                        pid: process.pid,
                        reason: e.to_string(),
                    })
                })?;
                let _ = tokio::time::timeout(Duration::from_secs(10), process.wait_for_exit()).await;
            }
            _ => {
                // 핸들이 없어도 추적 PID가 살아 있으면 잡는다 (데몬 재시작 후)
                if let Some(pid) = server.last_pid {
                    if process_scan::is_running_async(pid).await {
                        tracing::info!(server = id, pid, "Killing tracked PID without handle");
                        force_kill_pid(pid).map_err(|e| {
                            SupervisorError::Stop(StopError::KillFailed {
                                pid,
                                reason: e.to_string(),
                            })
                        })?;
                    } else if server.declared_status == ServerStatus::Stopped {
                        return Ok(ShutdownOutcome::AlreadyStopped);
                    }
                } else if server.declared_status == ServerStatus::Stopped {
                    return Ok(ShutdownOutcome::AlreadyStopped);
                }
            }
        }

        self.set_last_pid(id, None).await;
        self.set_status(id, ServerStatus::Stopped).await;
        Ok(ShutdownOutcome::Forced)
    }

    /// Graceful stop 후 재기동. Sequencer 내부의 forceful fallback 덕분에
    /// stop이 어떻게 끝나든 뒤따르는 start는 막히지 않는다.
    pub async fn restart(self: Arc<Self>, id: &str) -> Result<u32, SupervisorError> {
        self.stop(id, StopMode::Graceful).await?;
        self.start(id).await
    }

    // ─── Update markers ──────────────────────────────────────

    /// 업데이트 시작 표시. start와 같은 예약 가드를 잡으므로 진행 중인
    /// 기동과 경합하지 않고, 검사와 전이는 레지스트리 write lock
    /// 아래에서 서버별로 원자적이다.
    pub async fn begin_update(&self, id: &str) -> Result<(), SupervisorError> {
        let _start_guard = self.try_begin_start(id)?;
        {
            let processes = self.processes.lock().await;
            if processes.get(id).map(|p| p.is_running()).unwrap_or(false) {
                return Err(LaunchError::AlreadyRunning.into());
            }
        }
        {
            let mut registry = self.registry.write().await;
            let server = registry
                .get(id)
                .ok_or_else(|| SupervisorError::ServerNotFound(id.to_string()))?;
            if server.declared_status == ServerStatus::Updating {
                return Err(LaunchError::AlreadyRunning.into());
            }
            registry
                .set_status(id, ServerStatus::Updating)
                .map_err(|e| SupervisorError::Internal(e.into()))?;
        }
        let _ = self.status_tx.send(StatusEvent {
            server_id: id.to_string(),
            status: ServerStatus::Updating,
        });
        Ok(())
    }

    pub async fn finish_update(&self, id: &str) -> Result<(), SupervisorError> {
        let current = self
            .server(id)
            .await
            .ok_or_else(|| SupervisorError::ServerNotFound(id.to_string()))?;
        if current.declared_status == ServerStatus::Updating {
            self.set_status(id, ServerStatus::Stopped).await;
        }
        Ok(())
    }

    // ─── RCON pass-through ───────────────────────────────────

    /// 실행 중인 서버에 임의 명령 전달 (인터랙티브 콘솔용)
    pub async fn execute_rcon(&self, id: &str, command: &str) -> Result<String, SupervisorError> {
        let server = self
            .server(id)
            .await
            .ok_or_else(|| SupervisorError::ServerNotFound(id.to_string()))?;
        if server.declared_status != ServerStatus::Running {
            return Err(SupervisorError::NotRunning(id.to_string()));
        }

        let response = rcon::execute_one(
            "127.0.0.1".to_string(),
            server.ports.rcon_port,
            server.rcon_password.clone(),
            command.to_string(),
            self.config.rcon_timeout(),
        )
        .await?;
        Ok(response)
    }

    // ─── Reconciliation ──────────────────────────────────────

    /// 앱 기동 시 persisted status와 OS 현실의 대조.
    ///
    /// Running/Starting으로 기록된 서버마다 추적 PID와 RCON 핸드셰이크로
    /// 생존을 검증하고, 죽어 있으면 Stopped로 교정합니다. 데몬이 내려가
    /// 있는 동안 자식이 죽어 "유령"으로 남는 것을 막는 핵심 동작.
    pub async fn reconcile(&self) -> Result<()> {
        let servers = self.list_servers().await;
        for server in servers {
            match server.declared_status {
                ServerStatus::Running | ServerStatus::Starting => {
                    let exe_name = server
                        .executable_path()
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();

                    let pid_alive = match server.last_pid {
                        Some(pid) => process_scan::runs_executable_async(pid, &exe_name).await,
                        None => false,
                    };

                    let alive = if pid_alive {
                        true
                    } else {
                        rcon::probe(
                            "127.0.0.1".to_string(),
                            server.ports.rcon_port,
                            server.rcon_password.clone(),
                            Duration::from_secs(2),
                        )
                        .await
                    };

                    if alive {
                        tracing::info!(
                            server = %server.id,
                            pid = ?server.last_pid,
                            "Reconciliation: server still alive, keeping status"
                        );
                    } else {
                        tracing::warn!(
                            server = %server.id,
                            "Reconciliation: no live process found, correcting {} → stopped",
                            server.declared_status
                        );
                        self.set_last_pid(&server.id, None).await;
                        self.set_status(&server.id, ServerStatus::Stopped).await;
                    }
                }
                ServerStatus::Updating => {
                    // 업데이트 태스크는 데몬과 함께 죽었다
                    tracing::warn!(server = %server.id, "Reconciliation: stale updating marker cleared");
                    self.set_status(&server.id, ServerStatus::Stopped).await;
                }
                ServerStatus::Stopped | ServerStatus::Crashed => {}
            }
        }
        Ok(())
    }

    // ─── Stop mutual exclusion ───────────────────────────────

    /// 서버당 stop 작업 1개 원칙 — 검사와 등록이 한 뮤텍스 아래에서
    /// 원자적으로 일어난다.
    pub(crate) fn try_begin_stop(&self, id: &str) -> Result<InFlightGuard, StopError> {
        try_reserve(&self.stops_in_flight, id).ok_or(StopError::AlreadyInProgress)
    }

    /// 서버당 start/update 예약 1개 원칙. start는 spawn과 processes 등록을
    /// 마칠 때까지, begin_update는 Updating 전이를 마칠 때까지 가드를 쥔다.
    pub(crate) fn try_begin_start(&self, id: &str) -> Result<InFlightGuard, LaunchError> {
        try_reserve(&self.starts_in_flight, id).ok_or(LaunchError::StartInProgress)
    }

    pub(crate) fn stop_in_flight(&self, id: &str) -> bool {
        self.stops_in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(id)
    }

    // ─── Internal accessors for the sequencer ────────────────

    pub(crate) async fn live_process(&self, id: &str) -> Option<Arc<ServerProcess>> {
        let processes = self.processes.lock().await;
        processes.get(id).filter(|p| p.is_running()).cloned()
    }

    pub(crate) async fn drop_process(&self, id: &str) {
        let mut processes = self.processes.lock().await;
        processes.remove(id);
    }
}

// ─── Tests ───────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServerPorts;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn test_config(dir: &Path) -> WardenConfig {
        let mut cfg = WardenConfig::default();
        cfg.registry_path = dir.join("servers.json").to_string_lossy().into_owned();
        cfg.readiness_timeout_secs = 0; // 테스트: 스폰 즉시 Running 판정
        cfg.grace_period_secs = 1;
        cfg.rcon_timeout_secs = 1;
        cfg
    }

    async fn add_test_server(
        supervisor: &Arc<Supervisor>,
        dir: &TempDir,
        name: &str,
        rcon_port: u16,
        exe: Option<&str>,
        install_sub: &str,
    ) -> String {
        let install = dir.path().join(install_sub);
        std::fs::create_dir_all(&install).unwrap();
        let mut server = ManagedServer::new(
            name,
            install,
            ServerPorts { game_port: 7777, query_port: 27015, rcon_port },
            "admin123",
        );
        server.executable_override = exe.map(PathBuf::from);
        supervisor.add_server(server).await.unwrap()
    }

    #[cfg(unix)]
    fn write_script(path: &Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::write(path, body).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test]
    async fn test_start_missing_executable() {
        let dir = TempDir::new().unwrap();
        let supervisor = Arc::new(Supervisor::new(test_config(dir.path())));
        supervisor.initialize().await.unwrap();

        let id = add_test_server(&supervisor, &dir, "island", 27020, None, "a").await;
        let err = supervisor.clone().start(&id).await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Launch(LaunchError::ExecutableMissing(_))
        ));
        // 실패한 start는 Stopped를 유지한다
        assert_eq!(
            supervisor.server(&id).await.unwrap().declared_status,
            ServerStatus::Stopped
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_forceful_stop_then_start_round_trip() {
        let dir = TempDir::new().unwrap();
        let supervisor = Arc::new(Supervisor::new(test_config(dir.path())));
        supervisor.initialize().await.unwrap();

        // 런치 인수를 무시하고 오래 사는 가짜 서버
        let wrapper = dir.path().join("fake-server.sh");
        write_script(&wrapper, "#!/bin/sh\nsleep 60\n");

        let id = add_test_server(
            &supervisor,
            &dir,
            "island",
            27020,
            Some(wrapper.to_str().unwrap()),
            "a",
        )
        .await;

        let pid = supervisor.clone().start(&id).await.unwrap();
        assert!(pid > 0);

        // readiness 타임아웃 0초 → 곧 Running
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(
            supervisor.server(&id).await.unwrap().declared_status,
            ServerStatus::Running
        );

        // 이중 기동 거부
        let err = supervisor.clone().start(&id).await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Launch(LaunchError::AlreadyRunning)
        ));

        supervisor.stop(&id, StopMode::Forceful).await.unwrap();
        assert_eq!(
            supervisor.server(&id).await.unwrap().declared_status,
            ServerStatus::Stopped
        );

        // round-trip: 곧바로 다시 시작 가능해야 한다
        let pid2 = supervisor.clone().start(&id).await.unwrap();
        assert_ne!(pid, pid2);
        supervisor.stop(&id, StopMode::Forceful).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_start_spawns_single_process() {
        let dir = TempDir::new().unwrap();
        let supervisor = Arc::new(Supervisor::new(test_config(dir.path())));
        supervisor.initialize().await.unwrap();

        let wrapper = dir.path().join("fake-server.sh");
        write_script(&wrapper, "#!/bin/sh\nsleep 60\n");

        let id = add_test_server(
            &supervisor,
            &dir,
            "island",
            27020,
            Some(wrapper.to_str().unwrap()),
            "a",
        )
        .await;

        // 같은 서버에 대한 병렬 start 2건 — 정확히 1건만 spawn에 도달해야 한다
        let (a, b) = {
            let (s1, s2) = (supervisor.clone(), supervisor.clone());
            let (id1, id2) = (id.clone(), id.clone());
            tokio::join!(
                tokio::spawn(async move { s1.start(&id1).await }),
                tokio::spawn(async move { s2.start(&id2).await }),
            )
        };
        let results = [a.unwrap(), b.unwrap()];

        let oks: Vec<u32> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
        assert_eq!(oks.len(), 1);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(SupervisorError::Launch(
                LaunchError::StartInProgress | LaunchError::AlreadyRunning
            ))
        )));

        // 소유 핸들도 1개, 추적 PID도 승자의 것
        assert!(supervisor.live_process(&id).await.is_some());
        assert_eq!(supervisor.server(&id).await.unwrap().last_pid, Some(oks[0]));

        supervisor.stop(&id, StopMode::Forceful).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_already_stopped_is_noop() {
        let dir = TempDir::new().unwrap();
        let supervisor = Arc::new(Supervisor::new(test_config(dir.path())));
        supervisor.initialize().await.unwrap();

        let id = add_test_server(&supervisor, &dir, "island", 27020, None, "a").await;
        let outcome = supervisor.stop(&id, StopMode::Forceful).await.unwrap();
        assert!(matches!(
            outcome,
            crate::shutdown::ShutdownOutcome::AlreadyStopped
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unexpected_exit_marks_crashed() {
        let dir = TempDir::new().unwrap();
        let supervisor = Arc::new(Supervisor::new(test_config(dir.path())));
        supervisor.initialize().await.unwrap();

        // 0.2초 뒤 스스로 죽는 "서버"
        let wrapper = dir.path().join("crashy.sh");
        write_script(&wrapper, "#!/bin/sh\nsleep 0.2\nexit 1\n");

        let id = add_test_server(
            &supervisor,
            &dir,
            "island",
            27020,
            Some(wrapper.to_str().unwrap()),
            "a",
        )
        .await;

        supervisor.clone().start(&id).await.unwrap();
        // readiness(0s) → Running, 그 후 예기치 않은 종료 → Crashed
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(
            supervisor.server(&id).await.unwrap().declared_status,
            ServerStatus::Crashed
        );
    }

    #[tokio::test]
    async fn test_reconcile_corrects_ghost_running() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());

        // 첫 번째 데몬 수명: Running + 죽은 PID를 기록해 둔다
        {
            let supervisor = Arc::new(Supervisor::new(config.clone()));
            supervisor.initialize().await.unwrap();
            let id = add_test_server(&supervisor, &dir, "ghost", 27020, None, "a").await;
            supervisor.set_last_pid(&id, Some(u32::MAX - 13)).await;
            supervisor.set_status(&id, ServerStatus::Running).await;
        }

        // 두 번째 데몬 수명: reconciliation이 유령을 바로잡아야 한다
        let supervisor = Arc::new(Supervisor::new(config));
        supervisor.initialize().await.unwrap();
        let servers = supervisor.list_servers().await;
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].declared_status, ServerStatus::Stopped);
        assert_eq!(servers[0].last_pid, None);
    }

    #[tokio::test]
    async fn test_reconcile_keeps_live_pid() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());

        // 현재 테스트 프로세스를 "서버"로 위장: exe 이름이 일치하고 PID가 살아있음.
        // 리눅스 comm은 15자로 잘리므로 짧은 접두사를 exe 이름으로 쓴다.
        let own_name = std::env::current_exe()
            .unwrap()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .chars()
            .take(8)
            .collect::<String>();
        let own_exe = dir.path().join(&own_name);
        {
            let supervisor = Arc::new(Supervisor::new(config.clone()));
            supervisor.initialize().await.unwrap();
            let install = dir.path().join("a");
            std::fs::create_dir_all(&install).unwrap();
            let mut server = ManagedServer::new(
                "alive",
                install,
                ServerPorts { game_port: 7777, query_port: 27015, rcon_port: 27020 },
                "pw",
            );
            server.executable_override = Some(own_exe.clone());
            let id = supervisor.add_server(server).await.unwrap();
            supervisor.set_last_pid(&id, Some(std::process::id())).await;
            supervisor.set_status(&id, ServerStatus::Running).await;
        }

        let supervisor = Arc::new(Supervisor::new(config));
        supervisor.initialize().await.unwrap();
        let servers = supervisor.list_servers().await;
        assert_eq!(servers[0].declared_status, ServerStatus::Running);
    }

    #[tokio::test]
    async fn test_update_marker_exclusive() {
        let dir = TempDir::new().unwrap();
        let supervisor = Arc::new(Supervisor::new(test_config(dir.path())));
        supervisor.initialize().await.unwrap();

        let id = add_test_server(&supervisor, &dir, "island", 27020, None, "a").await;
        supervisor.begin_update(&id).await.unwrap();
        assert_eq!(
            supervisor.server(&id).await.unwrap().declared_status,
            ServerStatus::Updating
        );

        // 이중 업데이트 거부 — 서버별 배타성
        assert!(supervisor.begin_update(&id).await.is_err());
        // 업데이트 중 기동 거부
        assert!(matches!(
            supervisor.clone().start(&id).await.unwrap_err(),
            SupervisorError::Launch(LaunchError::AlreadyRunning)
        ));

        supervisor.finish_update(&id).await.unwrap();
        assert_eq!(
            supervisor.server(&id).await.unwrap().declared_status,
            ServerStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_bind_conflict_on_start() {
        let dir = TempDir::new().unwrap();
        let supervisor = Arc::new(Supervisor::new(test_config(dir.path())));
        supervisor.initialize().await.unwrap();

        let a = add_test_server(&supervisor, &dir, "a", 27020, None, "a").await;
        let b = add_test_server(&supervisor, &dir, "b", 27021, None, "b").await;
        // 둘 다 game_port 7777 — b를 running으로 표시하면 a는 충돌
        supervisor.set_status(&b, ServerStatus::Running).await;

        let err = supervisor.clone().start(&a).await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Launch(LaunchError::BindConflict(7777))
        ));
    }

    #[tokio::test]
    async fn test_execute_rcon_requires_running() {
        let dir = TempDir::new().unwrap();
        let supervisor = Arc::new(Supervisor::new(test_config(dir.path())));
        supervisor.initialize().await.unwrap();

        let id = add_test_server(&supervisor, &dir, "island", 27020, None, "a").await;
        let err = supervisor.execute_rcon(&id, "ListPlayers").await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotRunning(_)));
    }

    #[tokio::test]
    async fn test_status_broadcast() {
        let dir = TempDir::new().unwrap();
        let supervisor = Arc::new(Supervisor::new(test_config(dir.path())));
        supervisor.initialize().await.unwrap();

        let id = add_test_server(&supervisor, &dir, "island", 27020, None, "a").await;
        let mut rx = supervisor.subscribe_status();
        supervisor.set_status(&id, ServerStatus::Starting).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.server_id, id);
        assert_eq!(event.status, ServerStatus::Starting);
    }
}
