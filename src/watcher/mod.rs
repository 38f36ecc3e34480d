//! Save-protection watcher.
//!
//! 서버별 Import 인박스 디렉터리를 감시하다가 파일 유입이 잠잠해지면
//! pause → apply → resume 보호 사이클을 실행합니다. 실행 중인 서버는
//! 먼저 graceful shutdown으로 내린 뒤(세이브 확정) 파일을 적용하고
//! 다시 올립니다. 이미 정지된 서버는 pause/resume 없이 적용만 합니다.

use std::path::Path;
use std::sync::Arc;
use std::future::Future;
use anyhow::{Context, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use crate::registry::{ManagedServer, ServerStatus};
use crate::supervisor::error::WatchApplyError;
use crate::supervisor::{StopMode, Supervisor};

/// 살아있는 동안 감시가 유지되는 핸들. 드롭하면 감시가 끝난다.
pub struct SaveWatcher {
    _watcher: RecommendedWatcher,
    pub server_id: String,
}

/// 이벤트 버스트를 하나의 사이클로 병합한다.
///
/// 첫 이벤트 후 `window` 동안 조용해질 때까지 추가 이벤트를 흡수하고,
/// 그제서야 `on_settled`를 한 번 실행합니다. 대용량 세이브 전송이
/// 진행되는 동안 반쪽짜리 파일로 사이클이 돌지 않게 하는 장치.
pub(crate) async fn debounce_events<F, Fut>(
    mut rx: mpsc::UnboundedReceiver<()>,
    window: Duration,
    mut on_settled: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    while rx.recv().await.is_some() {
        loop {
            match timeout(window, rx.recv()).await {
                Ok(Some(())) => continue, // 아직 유입 중
                Ok(None) => {
                    on_settled().await;
                    return;
                }
                Err(_) => break, // 조용해졌다
            }
        }
        on_settled().await;
    }
}

/// 인박스 내용물(파일과 디렉터리)을 세이브 디렉터리로 적용한다 (블로킹 IO).
///
/// 클러스터/플레이어 세이브 세트는 디렉터리째 들어오기도 하므로
/// 하위 디렉터리도 재귀 복사 후 비운다. 적용 전 기존 SavedArks 전체를
/// `Saved/Backups/PreImport_<ts>`로 복사해 두므로 잘못된 파일이 들어와도
/// 되돌릴 수 있다.
fn apply_incoming(server: &ManagedServer) -> std::io::Result<usize> {
    let inbox = server.import_dir();
    let save_dir = server.save_dir();

    let entries = inbox_entries(&inbox)?;
    if entries.is_empty() {
        return Ok(0);
    }

    if save_dir.exists() {
        if let Some(saved_root) = save_dir.parent() {
            let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
            let backup = saved_root.join("Backups").join(format!("PreImport_{}", stamp));
            if !backup.exists() {
                copy_dir_recursive(&save_dir, &backup)?;
            }
        }
    }
    std::fs::create_dir_all(&save_dir)?;

    for path in &entries {
        let name = match path.file_name() {
            Some(n) => n,
            None => continue,
        };
        if path.is_dir() {
            copy_dir_recursive(path, &save_dir.join(name))?;
            std::fs::remove_dir_all(path)?;
        } else {
            std::fs::copy(path, save_dir.join(name))?;
            std::fs::remove_file(path)?;
        }
    }
    Ok(entries.len())
}

/// 인박스 최상위 엔트리 나열. 감시 대상이 아직 없으면 빈 목록.
fn inbox_entries(inbox: &Path) -> std::io::Result<Vec<std::path::PathBuf>> {
    let mut entries = Vec::new();
    if inbox.exists() {
        for entry in std::fs::read_dir(inbox)? {
            entries.push(entry?.path());
        }
    }
    Ok(entries)
}

fn copy_dir_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &dest)?;
        } else {
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

/// 보호 사이클 1회: pause(필요 시) → apply → resume(필요 시).
///
/// ResumeFailed는 절대 삼키지 않는다 — 서버가 내려간 채 방치되는 것이
/// 이 시스템 최악의 silent failure이므로 호출자까지 반드시 전파된다.
pub(crate) async fn protection_cycle(
    supervisor: &Arc<Supervisor>,
    id: &str,
) -> Result<usize, WatchApplyError> {
    let server = supervisor
        .server(id)
        .await
        .ok_or_else(|| WatchApplyError::ApplyFailed("server no longer registered".to_string()))?;

    // 적용할 것이 없으면 서버를 건드리지 않는다 (이벤트만 남고
    // 내용물이 사라진 경우의 헛된 재기동 방지)
    let pending = inbox_entries(&server.import_dir())
        .map_err(|e| WatchApplyError::ApplyFailed(e.to_string()))?;
    if pending.is_empty() {
        return Ok(0);
    }

    let was_active = matches!(
        server.declared_status,
        ServerStatus::Running | ServerStatus::Starting
    );

    if was_active {
        tracing::info!(server = id, "Pausing server before applying incoming save files");
        supervisor
            .stop(id, StopMode::Graceful)
            .await
            .map_err(|e| WatchApplyError::PauseFailed(e.to_string()))?;
    }

    let applied = {
        let server = server.clone();
        tokio::task::spawn_blocking(move || apply_incoming(&server))
            .await
            .map_err(|e| WatchApplyError::ApplyFailed(e.to_string()))?
            .map_err(|e| WatchApplyError::ApplyFailed(e.to_string()))?
    };
    tracing::info!(server = id, applied, "Incoming save files applied");
    supervisor
        .log_stream(id)
        .await
        .push_system(format!("Applied {} incoming save file(s)", applied));

    if was_active {
        supervisor
            .clone()
            .start(id)
            .await
            .map_err(|e| WatchApplyError::ResumeFailed(e.to_string()))?;
        tracing::info!(server = id, "Server resumed after save import");
    }

    Ok(applied)
}

/// 서버 하나에 대한 인박스 감시 시작.
pub async fn spawn_watch(supervisor: Arc<Supervisor>, id: &str) -> Result<SaveWatcher> {
    let server = supervisor
        .server(id)
        .await
        .with_context(|| format!("unknown server '{}'", id))?;
    let inbox = server.import_dir();
    std::fs::create_dir_all(&inbox)
        .with_context(|| format!("failed to create inbox {:?}", inbox))?;

    let (tx, rx) = mpsc::unbounded_channel();

    // notify 콜백은 자체 스레드에서 돈다 — 채널로 런타임에 넘긴다
    let mut watcher = notify::recommended_watcher(
        move |res: Result<notify::Event, notify::Error>| match res {
            Ok(event) => {
                if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    let _ = tx.send(());
                }
            }
            Err(e) => tracing::warn!("File watch error: {}", e),
        },
    )?;
    watcher.watch(&inbox, RecursiveMode::NonRecursive)?;
    tracing::info!(server = id, inbox = ?inbox, "Save protection watch started");

    let window = supervisor.config.debounce_window();
    let server_id = id.to_string();
    {
        let server_id = server_id.clone();
        tokio::spawn(async move {
            debounce_events(rx, window, || {
                let supervisor = supervisor.clone();
                let server_id = server_id.clone();
                async move {
                    match protection_cycle(&supervisor, &server_id).await {
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(server = %server_id, "Save protection cycle failed: {}", e);
                            supervisor
                                .log_stream(&server_id)
                                .await
                                .push_system(format!("Save protection failed: {}", e));
                        }
                    }
                }
            })
            .await;
        });
    }

    Ok(SaveWatcher { _watcher: watcher, server_id })
}

// ─── Tests ───────────────────────────────────────────────────
