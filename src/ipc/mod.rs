//! 로컬 IPC HTTP 서버 (루프백 전용).
//!
//! 데몬 외부(CLI, UI)에서 서버 등록/기동/정지/콘솔 조회를 수행하는
//! 관리 API입니다. 에러는 SupervisorError의 IntoResponse 매핑을 타고
//! 상태 코드 + 머신 리더블 error_code로 내려갑니다.

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::registry::{ClusterSettings, ManagedServer, ServerPorts};
use crate::supervisor::error::SupervisorError;
use crate::supervisor::{StopMode, Supervisor};

/// IPC 요청 타입

#[derive(Debug, Clone, Deserialize)]
pub struct CreateServerRequest {
    pub name: String,
    pub install_path: PathBuf,
    pub game_port: u16,
    pub query_port: u16,
    pub rcon_port: u16,
    pub rcon_password: String,
    #[serde(default)]
    pub map_name: Option<String>,
    #[serde(default)]
    pub session_name: Option<String>,
    #[serde(default)]
    pub max_players: Option<i32>,
    #[serde(default)]
    pub server_password: Option<String>,
    #[serde(default)]
    pub cluster: Option<ClusterSettings>,
    #[serde(default)]
    pub executable_override: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StopModeParam {
    #[default]
    Graceful,
    Forceful,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StopRequest {
    #[serde(default)]
    pub mode: StopModeParam,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RconRequest {
    pub command: String,
}

/// IPC Server State
#[derive(Clone)]
pub struct IpcServer {
    pub supervisor: Arc<Supervisor>,
    pub listen_addr: String,
}

impl IpcServer {
    pub fn new(supervisor: Arc<Supervisor>, listen_addr: &str) -> Self {
        Self {
            supervisor,
            listen_addr: listen_addr.to_string(),
        }
    }

    pub async fn start(self) -> Result<()> {
        tracing::info!("IPC HTTP server starting on {}", self.listen_addr);

        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("IPC listening on http://{}", self.listen_addr);

        axum::serve(listener, router(self.supervisor)).await?;
        Ok(())
    }
}

/// Router 생성 — 테스트에서 tower::ServiceExt::oneshot으로 직접 때릴 수
/// 있도록 분리되어 있다.
pub fn router(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/api/servers", get(list_servers).post(create_server))
        .route("/api/server/:id", get(get_server).delete(delete_server))
        .route("/api/server/:id/start", post(start_server))
        .route("/api/server/:id/stop", post(stop_server))
        .route("/api/server/:id/restart", post(restart_server))
        .route("/api/server/:id/update/begin", post(begin_update))
        .route("/api/server/:id/update/finish", post(finish_update))
        .route("/api/server/:id/rcon", post(execute_rcon))
        .route("/api/server/:id/console", get(get_console))
        .layer(TraceLayer::new_for_http())
        .with_state(supervisor)
}

/// GET /api/servers - 등록된 서버 전체
async fn list_servers(State(supervisor): State<Arc<Supervisor>>) -> impl IntoResponse {
    let servers = supervisor.list_servers().await;
    Json(json!({ "servers": servers }))
}

/// POST /api/servers - 서버 등록
async fn create_server(
    State(supervisor): State<Arc<Supervisor>>,
    Json(req): Json<CreateServerRequest>,
) -> Result<impl IntoResponse, SupervisorError> {
    let mut server = ManagedServer::new(
        &req.name,
        req.install_path,
        ServerPorts {
            game_port: req.game_port,
            query_port: req.query_port,
            rcon_port: req.rcon_port,
        },
        &req.rcon_password,
    );
    if let Some(map) = req.map_name {
        server.map_name = map;
    }
    if let Some(session) = req.session_name {
        server.session_name = session;
    }
    if let Some(max) = req.max_players {
        server.max_players = max;
    }
    server.server_password = req.server_password;
    server.cluster = req.cluster;
    server.executable_override = req.executable_override;

    let id = supervisor.add_server(server).await?;
    Ok((StatusCode::CREATED, Json(json!({ "success": true, "id": id }))))
}

/// GET /api/server/:id - 단일 서버 조회
async fn get_server(
    Path(id): Path<String>,
    State(supervisor): State<Arc<Supervisor>>,
) -> Result<impl IntoResponse, SupervisorError> {
    let server = supervisor
        .server(&id)
        .await
        .ok_or(SupervisorError::ServerNotFound(id))?;
    Ok(Json(server))
}

/// DELETE /api/server/:id - 서버 등록 해제 (실행 중이면 거부)
async fn delete_server(
    Path(id): Path<String>,
    State(supervisor): State<Arc<Supervisor>>,
) -> Result<impl IntoResponse, SupervisorError> {
    supervisor.remove_server(&id).await?;
    Ok(Json(json!({ "success": true })))
}

/// POST /api/server/:id/start - 서버 기동
async fn start_server(
    Path(id): Path<String>,
    State(supervisor): State<Arc<Supervisor>>,
) -> Result<impl IntoResponse, SupervisorError> {
    let pid = supervisor.clone().start(&id).await?;
    Ok(Json(json!({ "success": true, "pid": pid })))
}

/// POST /api/server/:id/stop - 서버 정지 (기본 graceful)
async fn stop_server(
    Path(id): Path<String>,
    State(supervisor): State<Arc<Supervisor>>,
    payload: Option<Json<StopRequest>>,
) -> Result<impl IntoResponse, SupervisorError> {
    let req = payload.map(|Json(r)| r).unwrap_or_default();
    let mode = match req.mode {
        StopModeParam::Graceful => StopMode::Graceful,
        StopModeParam::Forceful => StopMode::Forceful,
    };

    let outcome = supervisor.stop(&id, mode).await?;
    Ok(Json(json!({ "success": true, "outcome": outcome })))
}

/// POST /api/server/:id/restart - graceful stop 후 재기동
async fn restart_server(
    Path(id): Path<String>,
    State(supervisor): State<Arc<Supervisor>>,
) -> Result<impl IntoResponse, SupervisorError> {
    let pid = supervisor.clone().restart(&id).await?;
    Ok(Json(json!({ "success": true, "pid": pid })))
}

/// POST /api/server/:id/update/begin - 업데이트 표시
async fn begin_update(
    Path(id): Path<String>,
    State(supervisor): State<Arc<Supervisor>>,
) -> Result<impl IntoResponse, SupervisorError> {
    supervisor.begin_update(&id).await?;
    Ok(Json(json!({ "success": true })))
}

/// POST /api/server/:id/update/finish - 업데이트 종료 표시
async fn finish_update(
    Path(id): Path<String>,
    State(supervisor): State<Arc<Supervisor>>,
) -> Result<impl IntoResponse, SupervisorError> {
    supervisor.finish_update(&id).await?;
    Ok(Json(json!({ "success": true })))
}

/// POST /api/server/:id/rcon - 임의 RCON 명령 실행
async fn execute_rcon(
    Path(id): Path<String>,
    State(supervisor): State<Arc<Supervisor>>,
    Json(req): Json<RconRequest>,
) -> Result<impl IntoResponse, SupervisorError> {
    let response = supervisor.execute_rcon(&id, &req.command).await?;
    Ok(Json(json!({ "success": true, "response": response })))
}

/// GET /api/server/:id/console?since=0&count=100 - 콘솔 조회
async fn get_console(
    Path(id): Path<String>,
    State(supervisor): State<Arc<Supervisor>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, SupervisorError> {
    if supervisor.server(&id).await.is_none() {
        return Err(SupervisorError::ServerNotFound(id));
    }

    let since = params.get("since").and_then(|s| s.parse::<u64>().ok());
    let lines = if let Some(since) = since {
        supervisor.console_since(&id, since).await
    } else {
        let count = params
            .get("count")
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(100);
        supervisor.recent_console(&id, count).await
    };

    // 빈 응답이면 요청한 since를 되돌려준다 — 폴링 커서가 0으로 되감기지 않게
    let next = lines.last().map(|l| l.id + 1).or(since).unwrap_or(0);
    Ok(Json(json!({ "lines": lines, "next_since": next })))
}
