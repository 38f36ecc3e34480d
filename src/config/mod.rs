use serde::Deserialize;
use std::time::Duration;

/// 데몬 전역 설정 — config/warden.toml
///
/// 모든 필드는 선택적이며, 값이 없으면 기본 정책 상수를 사용합니다.
/// grace period와 debounce window는 정책 파라미터이므로
/// 하드코딩하지 않고 여기서 조정할 수 있게 합니다.
#[derive(Deserialize, Debug, Clone)]
pub struct WardenConfig {
    /// IPC HTTP 서버 바인드 주소 (루프백 전용)
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// 서버 레지스트리 파일 경로
    #[serde(default = "default_registry_path")]
    pub registry_path: String,

    /// Intelligent Mode graceful shutdown 유예 시간 (초)
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,

    /// SaveWorld 후 DoExit 전 저장 안정화 대기 (초)
    #[serde(default = "default_save_settle")]
    pub save_settle_secs: u64,

    /// 파일 감시 debounce 윈도우 (초)
    #[serde(default = "default_debounce")]
    pub debounce_secs: u64,

    /// Starting → Running 판정 제한 시간 (초)
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,

    /// RCON connect/execute 타임아웃 (초)
    #[serde(default = "default_rcon_timeout")]
    pub rcon_timeout_secs: u64,

    /// 서버별 콘솔 링 버퍼 최대 라인 수
    #[serde(default = "default_log_buffer")]
    pub log_buffer_size: usize,
}

fn default_listen_addr() -> String {
    "127.0.0.1:57810".to_string()
}

fn default_registry_path() -> String {
    "./servers.json".to_string()
}

fn default_grace_period() -> u64 {
    15
}

fn default_save_settle() -> u64 {
    2
}

fn default_debounce() -> u64 {
    2
}

fn default_readiness_timeout() -> u64 {
    120
}

fn default_rcon_timeout() -> u64 {
    5
}

fn default_log_buffer() -> usize {
    1000
}

impl Default for WardenConfig {
    fn default() -> Self {
        // serde 기본값과 동일
        toml::from_str("").expect("empty config must deserialize")
    }
}

impl WardenConfig {
    pub fn load() -> anyhow::Result<Self> {
        let s = std::fs::read_to_string("config/warden.toml").unwrap_or_default();
        let cfg: Self = toml::from_str(&s)?;
        Ok(cfg)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn save_settle(&self) -> Duration {
        Duration::from_secs(self.save_settle_secs)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn rcon_timeout(&self) -> Duration {
        Duration::from_secs(self.rcon_timeout_secs)
    }
}
