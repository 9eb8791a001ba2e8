use std::borrow::Cow;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::config::write_atomic;
use crate::error::SshError;

/// One trusted `(host, port)` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKeyRecord {
    pub host: String,
    pub port: u16,
    pub key_type: String,
    pub fingerprint: String,
}

impl HostKeyRecord {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        key_type: impl Into<String>,
        fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            key_type: key_type.into(),
            fingerprint: fingerprint.into(),
        }
    }

    /// Same key type and fingerprint
    pub fn matches_key(&self, key_type: &str, fingerprint: &str) -> bool {
        self.key_type == key_type && self.fingerprint == fingerprint
    }

    fn to_line(&self) -> String {
        format!(
            "{} {} {}",
            host_pattern(&self.host, self.port),
            self.key_type,
            self.fingerprint
        )
    }
}

/// Durable `(host, port) -> (key_type, fingerprint)` map backed by one file.
///
/// One record per line: `<host|[host]:port> <key_type> <fingerprint>`. Blank
/// lines and `#` comments survive rewrites; lines that do not parse are
/// skipped on read and kept verbatim on write.
#[derive(Debug, Clone)]
pub struct HostKeyStore {
    path: PathBuf,
}

impl HostKeyStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored record for `(host, port)`, if any. A missing file is an empty store.
    pub fn lookup(&self, host: &str, port: u16) -> Result<Option<HostKeyRecord>, SshError> {
        let content = self.read()?;
        Ok(content
            .lines()
            .enumerate()
            .filter_map(|(index, line)| self.parse_line(index, line))
            .find(|record| record.host == host && record.port == port))
    }

    pub fn records(&self) -> Result<Vec<HostKeyRecord>, SshError> {
        let content = self.read()?;
        Ok(content
            .lines()
            .enumerate()
            .filter_map(|(index, line)| self.parse_line(index, line))
            .collect())
    }

    /// Insert or overwrite the record for `(record.host, record.port)`.
    ///
    /// The first existing line for that host is replaced in place and any
    /// duplicates are dropped; every other line is preserved.
    pub fn save(&self, record: &HostKeyRecord) -> Result<(), SshError> {
        let content = self.read()?;
        let mut lines = Vec::new();
        let mut replaced = false;

        for line in content.lines() {
            if self.is_record_for(line, &record.host, record.port) {
                if !replaced {
                    lines.push(record.to_line());
                    replaced = true;
                }
                continue;
            }
            lines.push(line.to_string());
        }
        if !replaced {
            lines.push(record.to_line());
        }

        self.write(&lines)?;
        tracing::debug!(
            "Saved host key for {}:{} to {}",
            record.host,
            record.port,
            self.path.display()
        );
        Ok(())
    }

    /// Drop every record for `(host, port)`. Returns whether anything was removed.
    pub fn remove(&self, host: &str, port: u16) -> Result<bool, SshError> {
        let content = self.read()?;
        let before = content.lines().count();
        let lines: Vec<String> = content
            .lines()
            .filter(|line| !self.is_record_for(line, host, port))
            .map(str::to_string)
            .collect();

        if lines.len() == before {
            return Ok(false);
        }
        self.write(&lines)?;
        Ok(true)
    }

    fn read(&self) -> Result<String, SshError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(SshError::KnownHosts(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn write(&self, lines: &[String]) -> Result<(), SshError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SshError::KnownHosts(format!(
                        "Failed to create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let mut content = lines.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }

        write_atomic(&self.path, &content).map_err(|e| {
            SshError::KnownHosts(format!("Failed to write {}: {}", self.path.display(), e))
        })
    }

    fn is_record_for(&self, line: &str, host: &str, port: u16) -> bool {
        parse_record(line).is_some_and(|record| record.host == host && record.port == port)
    }

    fn parse_line(&self, index: usize, line: &str) -> Option<HostKeyRecord> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return None;
        }

        let record = parse_record(trimmed);
        if record.is_none() {
            tracing::warn!(
                "Skipping malformed line {} in {}",
                index + 1,
                self.path.display()
            );
        }
        record
    }
}

fn host_pattern(host: &str, port: u16) -> Cow<'_, str> {
    if port == 22 {
        Cow::Borrowed(host)
    } else {
        Cow::Owned(format!("[{}]:{}", host, port))
    }
}

fn parse_host_pattern(pattern: &str) -> Option<(String, u16)> {
    match pattern.strip_prefix('[') {
        Some(bracketed) => {
            let (host, port) = bracketed.split_once("]:")?;
            if host.is_empty() {
                return None;
            }
            Some((host.to_string(), port.parse().ok()?))
        }
        None => Some((pattern.to_string(), 22)),
    }
}

fn parse_record(line: &str) -> Option<HostKeyRecord> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }

    let mut parts = trimmed.split_whitespace();
    let (host, port) = parse_host_pattern(parts.next()?)?;
    let key_type = parts.next()?;
    let fingerprint = parts.next()?;
    if parts.next().is_some() {
        return None;
    }

    Some(HostKeyRecord::new(host, port, key_type, fingerprint))
}
