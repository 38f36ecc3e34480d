use super::{AuthError, ConnectError, RconError, SessionError};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Source RCON 클라이언트 (ARK: Survival Ascended 호환)
///
/// 프로토콜 명세:
/// - TCP 기반, 모든 패킷은 `[크기:i32][ID:i32][타입:i32][본문][0x00 0x00]` (LE)
/// - 타입: 3 = 인증 요청, 2 = 명령 실행 / 인증 응답, 0 = 응답 값
/// - 인증 실패 시 응답 ID가 -1
/// - 큰 응답은 같은 ID의 패킷 여러 개로 분할될 수 있으므로, 빈 응답-값
///   패킷을 뒤따라 보내고 그 ID가 메아리칠 때까지 조각을 이어 붙인다
const TYPE_AUTH: i32 = 3;
const TYPE_EXEC: i32 = 2;
const TYPE_RESPONSE_VALUE: i32 = 0;

/// 응답 본문 상한. 이보다 큰 프레임은 프로토콜 위반으로 취급.
const MAX_BODY: usize = 4096;

/// 재조립 시 허용하는 최대 조각 수 (폭주 방어)
const MAX_FRAGMENTS: usize = 256;

pub struct RconClient;

impl RconClient {
    /// 서버에 연결. 인증은 별도 단계 — 비밀번호 거부를 연결 실패와
    /// 구분해서 보고하기 위함.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<RconSession, ConnectError> {
        let addr = format!("{}:{}", host, port);

        let sock_addr = addr
            .to_socket_addrs()
            .map_err(|e| ConnectError::Io { addr: addr.clone(), source: e })?
            .next()
            .ok_or_else(|| ConnectError::Io {
                addr: addr.clone(),
                source: std::io::Error::new(ErrorKind::InvalidInput, "no address resolved"),
            })?;

        let stream = TcpStream::connect_timeout(&sock_addr, timeout).map_err(|e| {
            match e.kind() {
                ErrorKind::TimedOut | ErrorKind::WouldBlock => ConnectError::Timeout(addr.clone()),
                ErrorKind::ConnectionRefused => ConnectError::Refused(addr.clone()),
                _ => ConnectError::Io { addr: addr.clone(), source: e },
            }
        })?;

        stream
            .set_read_timeout(Some(timeout))
            .and_then(|_| stream.set_write_timeout(Some(timeout)))
            .map_err(|e| ConnectError::Io { addr: addr.clone(), source: e })?;

        tracing::debug!("RCON connected to {}", addr);
        Ok(RconSession { stream, peer: addr, request_id: 0 })
    }
}

/// 인증 전/후의 한 RCON 연결. 오류, 유휴 타임아웃, 명시적 disconnect로
/// 소멸하며 어디에도 영속화되지 않습니다.
pub struct RconSession {
    stream: TcpStream,
    peer: String,
    request_id: i32,
}

#[derive(Debug)]
struct RawPacket {
    id: i32,
    ptype: i32,
    body: String,
}

impl RconSession {
    fn next_id(&mut self) -> i32 {
        self.request_id = self.request_id.wrapping_add(1);
        if self.request_id <= 0 {
            self.request_id = 1;
        }
        self.request_id
    }

    /// 비밀번호 인증. 응답 ID -1은 명시적 거부.
    pub fn authenticate(&mut self, password: &str) -> Result<(), AuthError> {
        let id = self.next_id();
        write_frame(&mut self.stream, id, TYPE_AUTH, password)
            .map_err(|e| map_timeout(e, AuthError::Timeout))?;

        // 일부 서버는 인증 응답 전에 빈 응답-값 패킷을 먼저 보낸다
        for _ in 0..4 {
            let pkt = read_frame(&mut self.stream).map_err(|e| match e {
                RconError::Timeout => AuthError::Timeout,
                RconError::ProtocolError(m) => AuthError::Protocol(m),
                RconError::Io(e) => AuthError::Io(e),
            })?;

            if pkt.ptype == TYPE_RESPONSE_VALUE {
                continue;
            }
            if pkt.id == -1 {
                return Err(AuthError::Rejected);
            }
            if pkt.id == id {
                tracing::debug!("RCON authenticated to {}", self.peer);
                return Ok(());
            }
            return Err(AuthError::Protocol(format!(
                "auth response id mismatch: sent {}, got {}",
                id, pkt.id
            )));
        }

        Err(AuthError::Protocol("no auth response received".to_string()))
    }

    /// 명령 하나를 실행하고 재조립된 전체 응답 텍스트를 반환.
    ///
    /// 명령 패킷 뒤에 빈 응답-값 패킷(신선한 ID)을 보내 multi-packet
    /// 응답의 끝을 판정합니다. 종결자 ID가 돌아오기 전까지 명령 ID의
    /// 조각을 모두 이어 붙이므로, 진짜 빈 응답("")과 종결자를 혼동하지
    /// 않습니다.
    pub fn execute(&mut self, command: &str) -> Result<String, RconError> {
        let cmd_id = self.next_id();
        write_frame(&mut self.stream, cmd_id, TYPE_EXEC, command)
            .map_err(|e| map_timeout(e, RconError::Timeout))?;

        let sentinel_id = self.next_id();
        write_frame(&mut self.stream, sentinel_id, TYPE_RESPONSE_VALUE, "")
            .map_err(|e| map_timeout(e, RconError::Timeout))?;

        let mut response = String::new();
        for _ in 0..MAX_FRAGMENTS {
            let pkt = read_frame(&mut self.stream)?;

            if pkt.id == sentinel_id {
                return Ok(response);
            }
            if pkt.id == cmd_id {
                response.push_str(&pkt.body);
                continue;
            }
            return Err(RconError::ProtocolError(format!(
                "unexpected response id {} (command {}, sentinel {})",
                pkt.id, cmd_id, sentinel_id
            )));
        }

        Err(RconError::ProtocolError("response fragment limit exceeded".to_string()))
    }

    pub fn disconnect(self) {
        tracing::debug!("RCON disconnected from {}", self.peer);
        // TcpStream drop이 소켓을 닫는다
    }
}

fn map_timeout<E>(e: std::io::Error, timeout: E) -> E
where
    E: From<std::io::Error>,
{
    match e.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => timeout,
        _ => E::from(e),
    }
}

fn write_frame(w: &mut impl Write, id: i32, ptype: i32, body: &str) -> std::io::Result<()> {
    let size = 4 + 4 + body.len() + 2;
    w.write_i32::<LittleEndian>(size as i32)?;
    w.write_i32::<LittleEndian>(id)?;
    w.write_i32::<LittleEndian>(ptype)?;
    w.write_all(body.as_bytes())?;
    w.write_all(&[0, 0])?;
    w.flush()
}

fn read_frame(r: &mut impl Read) -> Result<RawPacket, RconError> {
    let size = r
        .read_i32::<LittleEndian>()
        .map_err(|e| map_timeout(e, RconError::Timeout))? as usize;

    if !(10..=MAX_BODY + 10).contains(&size) {
        return Err(RconError::ProtocolError(format!("invalid frame size: {}", size)));
    }

    let mut buf = vec![0u8; size];
    r.read_exact(&mut buf).map_err(|e| map_timeout(e, RconError::Timeout))?;

    let mut cursor = &buf[..];
    let id = cursor
        .read_i32::<LittleEndian>()
        .map_err(|e| RconError::ProtocolError(format!("truncated frame: {}", e)))?;
    let ptype = cursor
        .read_i32::<LittleEndian>()
        .map_err(|e| RconError::ProtocolError(format!("truncated frame: {}", e)))?;

    // 본문 끝의 널 패딩 제거
    let mut body_bytes = &buf[8..];
    while body_bytes.last() == Some(&0) {
        body_bytes = &body_bytes[..body_bytes.len() - 1];
    }
    let body = String::from_utf8_lossy(body_bytes).into_owned();

    Ok(RawPacket { id, ptype, body })
}

// ─── Async wrappers ──────────────────────────────────────────
// RCON 소켓은 동기 블로킹이므로 tokio 워커에서 직접 호출하면 런타임이
// 멈춥니다. spawn_blocking으로 전용 스레드풀에서 실행합니다.

/// 연결→인증→명령 목록 순차 실행→종료를 한 번에 수행.
/// `pause_between`은 명령 사이 대기 (SaveWorld 후 디스크 flush 대기용).
pub async fn execute_session(
    host: String,
    port: u16,
    password: String,
    commands: Vec<String>,
    timeout: Duration,
    pause_between: Duration,
) -> Result<Vec<String>, SessionError> {
    tokio::task::spawn_blocking(move || {
        let mut session = RconClient::connect(&host, port, timeout)?;
        session.authenticate(&password)?;

        let mut responses = Vec::with_capacity(commands.len());
        let last = commands.len().saturating_sub(1);
        for (i, command) in commands.iter().enumerate() {
            responses.push(session.execute(command)?);
            if i < last && !pause_between.is_zero() {
                std::thread::sleep(pause_between);
            }
        }
        session.disconnect();
        Ok(responses)
    })
    .await
    .map_err(|e| SessionError::Task(e.to_string()))?
}

/// 단일 명령 실행 (IPC pass-through 용)
pub async fn execute_one(
    host: String,
    port: u16,
    password: String,
    command: String,
    timeout: Duration,
) -> Result<String, SessionError> {
    let mut responses =
        execute_session(host, port, password, vec![command], timeout, Duration::ZERO).await?;
    Ok(responses.pop().unwrap_or_default())
}

/// 살아있는 RCON 핸드셰이크 확인 — readiness 판정과 reconciliation에 사용.
pub async fn probe(host: String, port: u16, password: String, timeout: Duration) -> bool {
    tokio::task::spawn_blocking(move || {
        match RconClient::connect(&host, port, timeout) {
            Ok(mut session) => session.authenticate(&password).is_ok(),
            Err(_) => false,
        }
    })
    .await
    .unwrap_or(false)
}

// ─── Tests ───────────────────────────────────────────────────
