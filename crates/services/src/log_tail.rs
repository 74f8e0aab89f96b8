//! Session-scoped log tailing for the debugger.
//!
//! Callers own a [`LogCursor`] per log and pass it back on every read, so
//! independent debugger sessions never share read positions.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Logs the debugger knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Api,
    Ollama,
    A2a,
    Rag,
    Electron,
}

impl LogSource {
    pub const ALL: [LogSource; 5] = [
        LogSource::Api,
        LogSource::Ollama,
        LogSource::A2a,
        LogSource::Rag,
        LogSource::Electron,
    ];

    pub fn default_path(&self) -> PathBuf {
        match self {
            LogSource::Api => PathBuf::from("/tmp/ai-dev-suite-api.log"),
            LogSource::Ollama => PathBuf::from("/tmp/ollama.log"),
            LogSource::A2a => PathBuf::from("/tmp/ai-dev-suite-debug-a2a.log"),
            LogSource::Rag => BaseDirs::new()
                .map(|dirs| dirs.home_dir().to_path_buf())
                .unwrap_or_default()
                .join(".config")
                .join("ai-dev-suite")
                .join("rag.log"),
            LogSource::Electron => PathBuf::from("/tmp/ai-dev-suite-electron.log"),
        }
    }

    /// Section header used in saved session logs.
    pub fn label(&self) -> &'static str {
        match self {
            LogSource::Api => "[API]",
            LogSource::Ollama => "[OLLAMA]",
            LogSource::A2a => "[A2A]",
            LogSource::Rag => "[RAG]",
            LogSource::Electron => "[ELECTRON]",
        }
    }
}

/// Number of non-blank lines already seen in one log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogCursor {
    lines_seen: usize,
}

impl LogCursor {
    pub fn lines_seen(&self) -> usize {
        self.lines_seen
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRead {
    pub lines: Vec<String>,
    pub cursor: LogCursor,
}

/// Lines added to `path` since `cursor`. Blank lines are ignored.
///
/// Without a cursor nothing is returned and the cursor starts at the current
/// end, so a session only sees what is logged after it started. If the file
/// shrank (rotated or truncated) everything in it is returned.
pub fn read_new_lines(path: &Path, cursor: Option<LogCursor>) -> Result<LogRead> {
    if !path.exists() {
        return Ok(LogRead {
            lines: Vec::new(),
            cursor: cursor.unwrap_or_default(),
        });
    }
    let raw = fs::read(path).with_context(|| format!("reading log {}", path.display()))?;
    let content = String::from_utf8_lossy(&raw);
    let all: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    let total = all.len();

    let lines = match cursor {
        None => Vec::new(),
        Some(c) if c.lines_seen > total => {
            tracing::debug!(path = %path.display(), "log shrank, reading from the start");
            all.iter().map(|l| l.to_string()).collect()
        }
        Some(c) => all[c.lines_seen..].iter().map(|l| l.to_string()).collect(),
    };

    Ok(LogRead {
        lines,
        cursor: LogCursor { lines_seen: total },
    })
}

/// Cursors and collected lines for one debugger session.
#[derive(Debug, Default)]
pub struct DebugSession {
    paths: HashMap<LogSource, PathBuf>,
    cursors: HashMap<LogSource, LogCursor>,
    collected: HashMap<LogSource, Vec<String>>,
}

impl DebugSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `source` from `path` instead of its default location.
    pub fn with_path(mut self, source: LogSource, path: impl Into<PathBuf>) -> Self {
        self.paths.insert(source, path.into());
        self
    }

    fn path_of(&self, source: LogSource) -> PathBuf {
        self.paths
            .get(&source)
            .cloned()
            .unwrap_or_else(|| source.default_path())
    }

    /// New lines for `source` since the last poll; also kept for [`save`](Self::save).
    pub fn poll(&mut self, source: LogSource) -> Result<Vec<String>> {
        let read = read_new_lines(&self.path_of(source), self.cursors.get(&source).copied())?;
        self.cursors.insert(source, read.cursor);
        self.collected
            .entry(source)
            .or_default()
            .extend(read.lines.iter().cloned());
        Ok(read.lines)
    }

    pub fn collected(&self, source: LogSource) -> &[String] {
        self.collected.get(&source).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Write everything collected so far into `dir`.
    pub fn save(&self, dir: &Path) -> Result<Option<PathBuf>> {
        let sections: Vec<(LogSource, &[String])> = LogSource::ALL
            .iter()
            .map(|source| (*source, self.collected(*source)))
            .collect();
        save_session_logs(dir, &sections, Local::now())
    }
}

/// Write non-empty sections to `dir/debugger_<timestamp>.log`.
/// Returns `None` without touching the disk when every section is empty.
pub fn save_session_logs(
    dir: &Path,
    sections: &[(LogSource, &[String])],
    now: DateTime<Local>,
) -> Result<Option<PathBuf>> {
    let body = sections
        .iter()
        .filter(|(_, lines)| !lines.is_empty())
        .map(|(source, lines)| format!("{}\n{}", source.label(), lines.join("\n")))
        .collect::<Vec<_>>()
        .join("\n\n---\n\n");
    if body.is_empty() {
        return Ok(None);
    }

    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(format!("debugger_{}.log", now.format("%Y-%m-%d_%H%M%S")));
    fs::write(&path, body).with_context(|| format!("writing {}", path.display()))?;
    Ok(Some(path))
}
