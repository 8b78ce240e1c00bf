//! Console multiplexer - ring buffer plus live broadcast of server output
//!
//! Decouples the server process's output rate from slow consumers: every
//! line lands in a bounded ring buffer (oldest lines drop on overflow) and
//! is fanned out to live subscribers over a broadcast channel. Appending
//! never blocks the producer; console history is best-effort, not an
//! audit log.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default maximum number of console lines kept in the ring buffer.
/// Can be overridden via `console.buffer_size` in config/craftd.toml.
pub const DEFAULT_BUFFER_SIZE: usize = 10_000;

/// Capacity of the live broadcast channel. Subscribers that lag further
/// than this behind the producer lose the overwritten lines.
const BROADCAST_CAPACITY: usize = 2048;

// ─── Line Types ──────────────────────────────────────────────

/// A single line of console traffic. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleLine {
    /// Sequential ID for polling (`GET /api/server/console?since=<id>`)
    pub id: u64,
    /// Unix timestamp (seconds) at arrival
    pub timestamp: u64,
    /// Where the line came from
    pub source: LineSource,
    /// Raw text content
    pub text: String,
    /// Parsed severity level
    pub level: LogLevel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LineSource {
    Stdout,
    Stderr,
    /// A command the operator injected into the server's stdin
    Command,
    /// Messages from craftd itself (lifecycle transitions etc.)
    System,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

// ─── Ring Buffer ─────────────────────────────────────────────

struct RingBuffer {
    lines: VecDeque<ConsoleLine>,
    next_id: u64,
    max_size: usize,
}

impl RingBuffer {
    fn push(&mut self, source: LineSource, text: String, level: LogLevel) -> ConsoleLine {
        let line = ConsoleLine {
            id: self.next_id,
            timestamp: current_timestamp(),
            source,
            text,
            level,
        };
        self.next_id += 1;

        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line.clone());
        line
    }
}

// ─── Console Bus ─────────────────────────────────────────────

/// Shared console bus. One per supervised server; readers push into it,
/// the IPC layer polls it, live consumers subscribe to it.
pub struct ConsoleBus {
    buffer: Mutex<RingBuffer>,
    broadcast: broadcast::Sender<ConsoleLine>,
    /// Optional regex with a `level` capture group for extracting the
    /// severity from raw server output. No match defaults to Info.
    level_pattern: Option<Regex>,
}

impl ConsoleBus {
    pub fn new(max_size: usize, level_pattern: Option<&str>) -> Self {
        let level_pattern = level_pattern.and_then(|pat| match Regex::new(pat) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!("Invalid console level pattern '{}': {}", pat, e);
                None
            }
        });
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            buffer: Mutex::new(RingBuffer {
                lines: VecDeque::with_capacity(max_size.min(1024)),
                next_id: 0,
                max_size: max_size.max(1),
            }),
            broadcast: tx,
            level_pattern,
        }
    }

    /// Append a line from the server's stdout/stderr. The severity is
    /// parsed from the text; stderr lines are promoted to at least Warn.
    pub fn append_output(&self, source: LineSource, text: String) -> ConsoleLine {
        let mut level = parse_level(&text, self.level_pattern.as_ref());
        if source == LineSource::Stderr && level == LogLevel::Info {
            level = LogLevel::Warn;
        }
        self.append(source, text, level)
    }

    /// Append a line with an explicit severity. Never blocks; on overflow
    /// the oldest buffered line is dropped.
    pub fn append(&self, source: LineSource, text: String, level: LogLevel) -> ConsoleLine {
        let line = {
            let mut buf = self.lock_buffer();
            buf.push(source, text, level)
        };
        // Only fails when there are no live subscribers, which is fine.
        let _ = self.broadcast.send(line.clone());
        line
    }

    /// Subscribe to live console traffic. Subscribers receive lines
    /// appended after this call, never the buffered history.
    pub fn subscribe(&self) -> broadcast::Receiver<ConsoleLine> {
        self.broadcast.subscribe()
    }

    /// All buffered lines with `id > since_id`, for polling consumers.
    pub fn get_since(&self, since_id: u64) -> Vec<ConsoleLine> {
        self.lock_buffer()
            .lines
            .iter()
            .filter(|l| l.id > since_id)
            .cloned()
            .collect()
    }

    /// The most recent `count` buffered lines, in arrival order.
    pub fn get_recent(&self, count: usize) -> Vec<ConsoleLine> {
        let buf = self.lock_buffer();
        buf.lines.iter().rev().take(count).rev().cloned().collect()
    }

    fn lock_buffer(&self) -> std::sync::MutexGuard<'_, RingBuffer> {
        // A poisoned buffer still holds valid lines; keep serving them.
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ConsoleBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, None)
    }
}

// ─── Helpers ─────────────────────────────────────────────────

/// Parse the severity from a raw server log line.
///
/// The pattern needs a named capture group `level` matching level keywords,
/// e.g. Minecraft: `/(?P<level>INFO|WARN|ERROR|DEBUG|FATAL)\]`
fn parse_level(text: &str, pattern: Option<&Regex>) -> LogLevel {
    if let Some(re) = pattern {
        if let Some(caps) = re.captures(text) {
            if let Some(m) = caps.name("level") {
                return match m.as_str().to_uppercase().as_str() {
                    "ERROR" | "FATAL" => LogLevel::Error,
                    "WARN" | "WARNING" => LogLevel::Warn,
                    "DEBUG" | "TRACE" => LogLevel::Debug,
                    _ => LogLevel::Info,
                };
            }
        }
    }
    LogLevel::Info
}

pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ─── Tests ───────────────────────────────────────────────────
