//! Log Streaming Pipeline
//!
//! 서버 프로세스의 raw 출력 라인을 분류하고, 서버별 bounded 링 버퍼에
//! 보관하며, broadcast 채널로 구독자(UI)에게 전달합니다.
//!
//! - 분류는 라인 내용만 보는 순수 함수 (상태 없음, 항상 정확히 한 클래스)
//! - 링 버퍼는 최근 N 라인만 유지, 디스크에 자동 기록하지 않음
//! - 느린 구독자는 broadcast lag으로 라인을 잃을 뿐, 생산자를 막지 않음

use std::collections::VecDeque;
use std::sync::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::utils::current_timestamp;

// ─── Log Types ───────────────────────────────────────────────

/// A single line of console output from a managed server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    /// Sequential ID for polling (`GET /console?since=<id>`)
    pub id: u64,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    /// Where the line came from
    pub source: LogSource,
    /// Raw text content
    pub content: String,
    /// Derived classification
    pub class: LogClass,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
    /// Messages from asa-warden itself
    System,
}

/// 라인 분류 결과. 항상 정확히 하나의 클래스가 부여됩니다 (기본 Info).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogClass {
    Info,
    Warning,
    Error,
    Debug,
    /// ASA 로그 서브시스템 태그 (예: "LogNet", "LogServerApp")
    Subsystem(String),
}

// ─── Classification ──────────────────────────────────────────

/// Classify a raw log line. Pure and total: the same input always yields the
/// same class, and every line gets exactly one class (default Info).
///
/// Priority: Error > Warning > Debug > Subsystem tag > Info.
pub fn classify(line: &str) -> LogClass {
    let lower = line.to_lowercase();

    if lower.contains("error:")
        || lower.contains("[error]")
        || lower.contains("fatal error")
        || lower.contains("critical:")
    {
        return LogClass::Error;
    }

    if lower.contains("warning:") || lower.contains("[warn]") || lower.contains("[warning]") {
        return LogClass::Warning;
    }

    if lower.contains("[debug]") || lower.contains("verbose:") {
        return LogClass::Debug;
    }

    if let Some(tag) = subsystem_tag(line) {
        return LogClass::Subsystem(tag.to_string());
    }

    LogClass::Info
}

/// UE 스타일 서브시스템 태그 추출: 라인이 `LogXxx:` 로 시작하는 경우.
/// `Log` 뒤는 대문자여야 한다 — "Login:", "Logic:" 같은 일반 단어 배제.
fn subsystem_tag(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let colon = trimmed.find(':')?;
    let token = &trimmed[..colon];
    if token.len() > 3
        && token.starts_with("Log")
        && token[3..].chars().next().is_some_and(|c| c.is_ascii_uppercase())
        && token.chars().all(|c| c.is_ascii_alphanumeric())
    {
        Some(token)
    } else {
        None
    }
}

// ─── Log Buffer ──────────────────────────────────────────────

/// Ring buffer that stores recent log lines with sequential IDs.
struct LogBuffer {
    lines: VecDeque<LogLine>,
    next_id: u64,
    max_size: usize,
}

impl LogBuffer {
    fn with_capacity(max_size: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_size),
            next_id: 0,
            max_size,
        }
    }

    fn push(&mut self, source: LogSource, content: String, class: LogClass) -> LogLine {
        let line = LogLine {
            id: self.next_id,
            timestamp: current_timestamp(),
            source,
            content,
            class,
        };
        self.next_id += 1;

        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line.clone());
        line
    }

    // since_id 포함 — 클라이언트는 `마지막 id + 1`로 다음 폴링을 한다
    fn get_since(&self, since_id: u64) -> Vec<LogLine> {
        self.lines.iter().filter(|l| l.id >= since_id).cloned().collect()
    }

    fn get_recent(&self, count: usize) -> Vec<LogLine> {
        self.lines.iter().rev().take(count).rev().cloned().collect()
    }
}

// ─── Log Stream ──────────────────────────────────────────────

/// Per-server log pipeline: bounded ring buffer + real-time broadcast.
///
/// 프로세스 수명과 독립적으로 Supervisor가 보유합니다. 프로세스가 죽어도
/// 마지막 N 라인은 조회 가능하고, Watcher 같은 다른 컴포넌트도 system
/// 라인을 밀어 넣을 수 있습니다.
pub struct LogStream {
    buffer: Mutex<LogBuffer>,
    broadcast: broadcast::Sender<LogLine>,
}

impl LogStream {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self {
            buffer: Mutex::new(LogBuffer::with_capacity(capacity)),
            broadcast: tx,
        }
    }

    /// Push a raw output line; classification happens here.
    pub fn push_raw(&self, source: LogSource, content: String) -> LogLine {
        let mut class = classify(&content);
        // stderr 라인은 최소 Warning으로 취급
        if source == LogSource::Stderr && matches!(class, LogClass::Info | LogClass::Subsystem(_)) {
            class = LogClass::Warning;
        }
        self.push_classified(source, content, class)
    }

    /// Push a pre-classified line (system messages).
    pub fn push_system(&self, content: String) -> LogLine {
        self.push_classified(LogSource::System, content, LogClass::Info)
    }

    fn push_classified(&self, source: LogSource, content: String, class: LogClass) -> LogLine {
        let line = {
            let mut buf = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            buf.push(source, content, class)
        };
        // 구독자가 없거나 느려도 송신 실패는 무시 — 생산자는 막히지 않는다
        let _ = self.broadcast.send(line.clone());
        line
    }

    pub fn get_since(&self, since_id: u64) -> Vec<LogLine> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).get_since(since_id)
    }

    pub fn get_recent(&self, count: usize) -> Vec<LogLine> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).get_recent(count)
    }

    /// Subscribe to real-time log events.
    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.broadcast.subscribe()
    }
}

// ─── Tests ───────────────────────────────────────────────────
