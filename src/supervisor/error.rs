//! Supervisor 전용 에러 타입 — 에러 종류를 구분하여 IPC 핸들러에서
//! 적절한 HTTP 상태 코드를 반환할 수 있게 합니다.

use axum::http::StatusCode;
use std::path::PathBuf;

/// 서버 기동 실패 유형
#[derive(thiserror::Error, Debug)]
pub enum LaunchError {
    #[error("Server is already running")]
    AlreadyRunning,

    #[error("A start is already in progress for this server")]
    StartInProgress,

    #[error("Port {0} collides with another managed server")]
    BindConflict(u16),

    #[error("Server executable not found at {0:?}")]
    ExecutableMissing(PathBuf),

    #[error("Failed to spawn server process: {0}")]
    SpawnFailed(String),
}

/// 서버 정지 실패 유형
#[derive(thiserror::Error, Debug)]
pub enum StopError {
    #[error("A graceful shutdown is already in progress for this server")]
    AlreadyInProgress,

    #[error("Failed to terminate process {pid}: {reason}")]
    KillFailed { pid: u32, reason: String },
}

/// Watcher의 pause/apply/resume 사이클 실패 유형.
/// ResumeFailed는 절대 조용히 삼켜지면 안 된다 — 서버가 내려간 채로
/// 방치되는 것이 최악의 silent failure이기 때문.
#[derive(thiserror::Error, Debug)]
pub enum WatchApplyError {
    #[error("Failed to pause server before applying files: {0}")]
    PauseFailed(String),

    #[error("Failed to apply incoming save files: {0}")]
    ApplyFailed(String),

    #[error("Server failed to resume after applying files: {0}")]
    ResumeFailed(String),
}

/// Supervisor 작업 중 발생할 수 있는 에러 유형
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("Server '{0}' not found")]
    ServerNotFound(String),

    #[error("Server '{0}' is not running")]
    NotRunning(String),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Stop(#[from] StopError),

    #[error("RCON error: {0}")]
    Rcon(#[from] crate::protocol::SessionError),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl SupervisorError {
    /// HTTP 상태 코드 매핑
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ServerNotFound(_) => StatusCode::NOT_FOUND,
            Self::NotRunning(_) => StatusCode::CONFLICT,
            Self::Launch(LaunchError::AlreadyRunning) => StatusCode::CONFLICT,
            Self::Launch(LaunchError::StartInProgress) => StatusCode::CONFLICT,
            Self::Launch(LaunchError::BindConflict(_)) => StatusCode::CONFLICT,
            Self::Launch(LaunchError::ExecutableMissing(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Launch(LaunchError::SpawnFailed(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Stop(StopError::AlreadyInProgress) => StatusCode::CONFLICT,
            Self::Stop(StopError::KillFailed { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Rcon(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ServerNotFound(_) => "SERVER_NOT_FOUND",
            Self::NotRunning(_) => "NOT_RUNNING",
            Self::Launch(LaunchError::AlreadyRunning) => "ALREADY_RUNNING",
            Self::Launch(LaunchError::StartInProgress) => "START_IN_PROGRESS",
            Self::Launch(LaunchError::BindConflict(_)) => "BIND_CONFLICT",
            Self::Launch(LaunchError::ExecutableMissing(_)) => "EXECUTABLE_MISSING",
            Self::Launch(LaunchError::SpawnFailed(_)) => "SPAWN_FAILED",
            Self::Stop(StopError::AlreadyInProgress) => "SHUTDOWN_IN_PROGRESS",
            Self::Stop(StopError::KillFailed { .. }) => "KILL_FAILED",
            Self::Rcon(_) => "RCON_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// JSON 에러 응답 생성
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }
}

/// axum 핸들러에서 SupervisorError를 직접 반환할 수 있도록 IntoResponse 구현
impl axum::response::IntoResponse for SupervisorError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let err = SupervisorError::Launch(LaunchError::AlreadyRunning);
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.error_code(), "ALREADY_RUNNING");

        let err = SupervisorError::ServerNotFound("x".into());
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err = SupervisorError::Stop(StopError::AlreadyInProgress);
        assert_eq!(err.error_code(), "SHUTDOWN_IN_PROGRESS");
    }

    #[test]
    fn test_json_shape() {
        let err = SupervisorError::Launch(LaunchError::BindConflict(27020));
        let json = err.to_json();
        assert_eq!(json["success"], false);
        assert_eq!(json["error_code"], "BIND_CONFLICT");
        assert!(json["error"].as_str().unwrap().contains("27020"));
    }
}
