pub mod rcon;

use thiserror::Error;

/// RCON 연결 단계 오류
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Connection to {0} timed out")]
    Timeout(String),

    #[error("Connection to {0} refused")]
    Refused(String),

    #[error("Connection to {addr} failed: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// RCON 인증 단계 오류 — 비밀번호 거부는 네트워크 장애와 구분되어야
/// 오퍼레이터가 "비밀번호를 고쳐라"와 "서버가 죽었다"를 구분할 수 있습니다.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Authentication rejected: invalid password")]
    Rejected,

    #[error("Authentication timed out")]
    Timeout,

    #[error("Protocol violation during auth: {0}")]
    Protocol(String),

    #[error("io error during auth: {0}")]
    Io(#[from] std::io::Error),
}

/// 명령 실행 단계 오류
#[derive(Error, Debug)]
pub enum RconError {
    #[error("Command timed out")]
    Timeout,

    #[error("Protocol violation: {0}")]
    ProtocolError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 한 세션(연결→인증→명령들→종료) 전체를 감싸는 오류.
/// Shutdown Sequencer는 variant를 구분하지 않고 전부 forceful fallback으로
/// 처리하지만, 로그에는 원인이 그대로 남습니다.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Rcon(#[from] RconError),

    #[error("rcon worker task failed: {0}")]
    Task(String),
}
