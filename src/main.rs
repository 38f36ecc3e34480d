use std::sync::Arc;

use asa_warden::config::WardenConfig;
use asa_warden::ipc::IpcServer;
use asa_warden::supervisor::Supervisor;
use asa_warden::watcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    tracing::info!("ASA Warden daemon starting");

    let config = match WardenConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            WardenConfig::default()
        }
    };
    let listen_addr = config.listen_addr.clone();

    let supervisor = Arc::new(Supervisor::new(config));
    // 레지스트리 로드 + ghost reconciliation
    if let Err(e) = supervisor.initialize().await {
        tracing::error!("Failed to initialize supervisor: {}", e);
        return Err(e);
    }

    // 등록된 서버마다 세이브 인박스 감시 시작
    let mut watches = Vec::new();
    for server in supervisor.list_servers().await {
        match watcher::spawn_watch(supervisor.clone(), &server.id).await {
            Ok(watch) => watches.push(watch),
            Err(e) => {
                tracing::error!("Failed to watch '{}': {}", server.name, e);
            }
        }
    }
    tracing::info!("Save protection active for {} server(s)", watches.len());

    // Graceful shutdown: Ctrl+C 시 실행 중인 서버를 모두 정리
    {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received, stopping managed servers...");

            for server in supervisor.list_servers().await {
                use asa_warden::registry::ServerStatus;
                if matches!(
                    server.declared_status,
                    ServerStatus::Running | ServerStatus::Starting
                ) {
                    match supervisor
                        .stop(&server.id, asa_warden::supervisor::StopMode::Graceful)
                        .await
                    {
                        Ok(outcome) => {
                            tracing::info!("[Shutdown] '{}' stopped: {:?}", server.name, outcome)
                        }
                        Err(e) => {
                            tracing::error!("[Shutdown] Failed to stop '{}': {}", server.name, e)
                        }
                    }
                }
            }

            tracing::info!("Cleanup complete, exiting");
            std::process::exit(0);
        });
    }

    let ipc_server = IpcServer::new(supervisor, &listen_addr);
    if let Err(e) = ipc_server.start().await {
        tracing::error!("IPC server error: {}", e);
    }

    tracing::info!("ASA Warden shutting down");
    Ok(())
}
