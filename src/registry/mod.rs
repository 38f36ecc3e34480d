use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// 서버 상태 — Supervisor만 전이시킬 수 있으며, 모든 전이는
/// 레지스트리 파일에 즉시 기록되어 앱 재시작에도 살아남습니다.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Updating,
    Crashed,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerStatus::Stopped => "stopped",
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::Updating => "updating",
            ServerStatus::Crashed => "crashed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerPorts {
    pub game_port: u16,
    pub query_port: u16,
    pub rcon_port: u16,
}

/// 클러스터 설정 — cross-ARK travel을 위한 공유 디렉토리
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSettings {
    pub cluster_id: String,
    pub cluster_dir: PathBuf,
}

/// 관리 대상 서버 — 설정된 게임 서버 인스턴스 하나당 하나
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedServer {
    pub id: String,
    pub name: String,
    /// 설치 경로 — 이 서버가 배타적으로 소유, 절대 공유 불가
    pub install_path: PathBuf,
    pub ports: ServerPorts,
    /// RCON 비밀번호 (= ServerAdminPassword). 로그에 남기지 않음.
    pub rcon_password: String,
    pub map_name: String,
    pub session_name: String,
    pub max_players: i32,
    #[serde(default)]
    pub server_password: Option<String>,
    #[serde(default)]
    pub cluster: Option<ClusterSettings>,
    /// 실행 파일 경로 오버라이드 (테스트, 비표준 레이아웃)
    #[serde(default)]
    pub executable_override: Option<PathBuf>,
    pub declared_status: ServerStatus,
    /// 마지막으로 추적한 OS PID — 재시작 후 reconciliation에 사용
    #[serde(default)]
    pub last_pid: Option<u32>,
}

// rcon_password가 디버그 출력으로 새지 않도록 수동 구현
impl std::fmt::Debug for ManagedServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedServer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("install_path", &self.install_path)
            .field("ports", &self.ports)
            .field("rcon_password", &"<redacted>")
            .field("declared_status", &self.declared_status)
            .field("last_pid", &self.last_pid)
            .finish_non_exhaustive()
    }
}

impl ManagedServer {
    pub fn new(name: &str, install_path: PathBuf, ports: ServerPorts, rcon_password: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            install_path,
            ports,
            rcon_password: rcon_password.to_string(),
            map_name: "TheIsland_WP".to_string(),
            session_name: name.to_string(),
            max_players: 70,
            server_password: None,
            cluster: None,
            executable_override: None,
            declared_status: ServerStatus::Stopped,
            last_pid: None,
        }
    }

    /// 서버 실행 파일 경로 (ASA 표준 레이아웃 또는 오버라이드)
    pub fn executable_path(&self) -> PathBuf {
        if let Some(ref exe) = self.executable_override {
            return exe.clone();
        }
        self.install_path
            .join("ShooterGame")
            .join("Binaries")
            .join("Win64")
            .join("ArkAscendedServer.exe")
    }

    /// 월드/플레이어 영속 상태가 저장되는 디렉토리
    pub fn save_dir(&self) -> PathBuf {
        self.install_path
            .join("ShooterGame")
            .join("Saved")
            .join("SavedArks")
    }

    /// 외부에서 세이브를 떨어뜨리는 inbox 디렉토리 (Watcher가 감시)
    pub fn import_dir(&self) -> PathBuf {
        self.install_path
            .join("ShooterGame")
            .join("Saved")
            .join("Import")
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Server '{0}' not found")]
    NotFound(String),

    #[error("Install path {0:?} is already owned by another server")]
    InstallPathInUse(PathBuf),

    #[error("RCON port {0} is already assigned to another server")]
    RconPortInUse(u16),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry file corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// 서버 레지스트리 — servers.json 관리
///
/// declared_status와 last_pid의 durable store이기도 하므로,
/// 모든 상태 전이마다 save()가 호출됩니다.
pub struct RegistryStore {
    file_path: PathBuf,
    servers: Vec<ManagedServer>,
}

impl RegistryStore {
    pub fn new(file_path: &str) -> Self {
        Self {
            file_path: PathBuf::from(file_path),
            servers: Vec::new(),
        }
    }

    pub fn load(&mut self) -> Result<(), RegistryError> {
        if !self.file_path.exists() {
            tracing::info!("Registry file does not exist, starting empty");
            self.servers = Vec::new();
            return Ok(());
        }

        let content = fs::read_to_string(&self.file_path)?;
        self.servers = serde_json::from_str(&content)?;
        tracing::info!("Loaded {} servers from registry", self.servers.len());
        Ok(())
    }

    pub fn save(&self) -> Result<(), RegistryError> {
        let content = serde_json::to_string_pretty(&self.servers)?;
        fs::write(&self.file_path, content)?;
        Ok(())
    }

    /// 서버 추가 — 설치 경로/RCON 포트 배타성 검증 포함
    pub fn add(&mut self, server: ManagedServer) -> Result<(), RegistryError> {
        if self.servers.iter().any(|s| same_path(&s.install_path, &server.install_path)) {
            return Err(RegistryError::InstallPathInUse(server.install_path));
        }
        if self.servers.iter().any(|s| s.ports.rcon_port == server.ports.rcon_port) {
            return Err(RegistryError::RconPortInUse(server.ports.rcon_port));
        }
        tracing::info!("Registered server '{}' ({})", server.name, server.id);
        self.servers.push(server);
        self.save()?;
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Result<(), RegistryError> {
        let before = self.servers.len();
        self.servers.retain(|s| s.id != id);
        if self.servers.len() == before {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        self.save()?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ManagedServer> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn list(&self) -> &[ManagedServer] {
        &self.servers
    }

    /// 상태 전이 기록 — Supervisor 전용 진입점
    pub fn set_status(&mut self, id: &str, status: ServerStatus) -> Result<(), RegistryError> {
        let server = self
            .servers
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        server.declared_status = status;
        self.save()?;
        Ok(())
    }

    pub fn set_last_pid(&mut self, id: &str, pid: Option<u32>) -> Result<(), RegistryError> {
        let server = self
            .servers
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        server.last_pid = pid;
        self.save()?;
        Ok(())
    }

    /// 다른 non-stopped 서버와 포트가 충돌하는지 검사 (start 시점 검증)
    pub fn port_conflict(&self, id: &str) -> Option<u16> {
        let target = self.get(id)?;
        for other in &self.servers {
            if other.id == id || other.declared_status == ServerStatus::Stopped {
                continue;
            }
            for port in [target.ports.game_port, target.ports.query_port, target.ports.rcon_port] {
                if port == other.ports.game_port
                    || port == other.ports.query_port
                    || port == other.ports.rcon_port
                {
                    return Some(port);
                }
            }
        }
        None
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    // canonicalize는 존재하지 않는 경로에서 실패하므로 컴포넌트 비교로 폴백
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(ca), Ok(cb)) => ca == cb,
        _ => a == b,
    }
}
