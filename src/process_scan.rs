//! OS 프로세스 테이블 조회 헬퍼 — startup reconciliation이 persisted PID의
//! 생존 여부를 판정할 때 사용합니다.

use sysinfo::{Pid, System};

/// 특정 PID가 실행 중인지 확인 (크로스 플랫폼)
pub fn is_running(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes();
    sys.process(Pid::from_u32(pid)).is_some()
}

/// PID가 살아있고, 그 프로세스의 이름이 기대한 실행 파일과 일치하는지 확인.
/// PID 재사용으로 전혀 다른 프로세스를 우리 서버로 오인하는 것을 막습니다.
pub fn runs_executable(pid: u32, exe_name: &str) -> bool {
    let mut sys = System::new();
    sys.refresh_processes();
    match sys.process(Pid::from_u32(pid)) {
        Some(process) => {
            let name = process.name().to_lowercase();
            let expected = exe_name.to_lowercase();
            name.contains(expected.trim_end_matches(".exe")) || name == expected
        }
        None => false,
    }
}

// ── Async wrappers ─────────────────────────────────────────
// sysinfo는 동기적으로 프로세스 테이블을 스캔하므로 spawn_blocking으로
// 전용 블로킹 스레드풀에서 실행합니다.

/// `is_running`의 비동기 래퍼.
pub async fn is_running_async(pid: u32) -> bool {
    tokio::task::spawn_blocking(move || is_running(pid))
        .await
        .unwrap_or(false)
}

/// `runs_executable`의 비동기 래퍼.
pub async fn runs_executable_async(pid: u32, exe_name: &str) -> bool {
    let exe_name = exe_name.to_string();
    tokio::task::spawn_blocking(move || runs_executable(pid, &exe_name))
        .await
        .unwrap_or(false)
}
