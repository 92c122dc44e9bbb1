use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

pub const AUDIT_LOG_FILE_NAME: &str = "LOGS_FOR_AGENTS.md";

#[derive(Debug, Error)]
pub enum AuditLogError {
    #[error("failed to open audit log {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("failed to write audit log {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// Append-only, line-per-record log shared with whatever else writes the same file.
///
/// The file is reopened for every record so a deleted or rotated file is recreated and nothing is
/// held open across a multi-hour session.
#[derive(Clone, Debug)]
pub struct AuditLog {
    path: PathBuf,
    offset: UtcOffset,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC),
        }
    }

    #[cfg(test)]
    pub fn with_offset(mut self, offset: UtcOffset) -> Self {
        self.offset = offset;
        self
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, tag: &str, message: &str) -> Result<(), AuditLogError> {
        let now = OffsetDateTime::now_utc().to_offset(self.offset);
        self.append_at(now, tag, message)
    }

    pub fn append_at(
        &self,
        at: OffsetDateTime,
        tag: &str,
        message: &str,
    ) -> Result<(), AuditLogError> {
        let record = format_record(at, tag, message);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| AuditLogError::Open {
                path: self.path.clone(),
                source,
            })?;
        // Exactly one write per record.
        file.write_all(record.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|source| AuditLogError::Write {
                path: self.path.clone(),
                source,
            })
    }
}

/// `2026-03-01 14:02:09 | [GUI][TRAIN] message`, newline terminated. Embedded newlines in
/// `message` are flattened so one record stays one line.
pub fn format_record(at: OffsetDateTime, tag: &str, message: &str) -> String {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let timestamp = at
        .format(&format)
        .unwrap_or_else(|_| at.unix_timestamp().to_string());
    let message = message.replace(['\r', '\n'], " ");
    format!("{timestamp} | [GUI][{tag}] {message}\n")
}

/// Picks the audit log location: an existing file in `cwd`, then an existing file in its parent,
/// then a new file in `cwd`.
pub fn resolve_audit_log_path(cwd: &Path) -> PathBuf {
    let local = cwd.join(AUDIT_LOG_FILE_NAME);
    if local.is_file() {
        return local;
    }
    if let Some(parent) = cwd.parent() {
        let candidate = parent.join(AUDIT_LOG_FILE_NAME);
        if candidate.is_file() {
            return candidate;
        }
    }
    local
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use time::macros::datetime;

    #[test]
    fn formats_record_line() {
        let at = datetime!(2026-03-01 14:02:09 UTC);
        assert_eq!(
            format_record(at, "TRAIN", "ep=5/10"),
            "2026-03-01 14:02:09 | [GUI][TRAIN] ep=5/10\n"
        );
        assert_eq!(
            format_record(at, "EVAL", "two\nlines"),
            "2026-03-01 14:02:09 | [GUI][EVAL] two lines\n"
        );
    }

    #[test]
    fn appends_without_truncating() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(AUDIT_LOG_FILE_NAME);
        fs::write(&path, "existing\n").expect("seed");

        let log = AuditLog::new(&path).with_offset(UtcOffset::UTC);
        assert_eq!(log.path(), path.as_path());
        log.append("TRAIN", "first").expect("append");
        log.append("TRAIN", "second").expect("append");

        let text = fs::read_to_string(&path).expect("read");
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "existing");
        assert!(lines[1].ends_with(" | [GUI][TRAIN] first"));
        assert!(lines[2].ends_with(" | [GUI][TRAIN] second"));
    }

    #[test]
    fn missing_directory_is_an_open_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = AuditLog::new(dir.path().join("missing").join(AUDIT_LOG_FILE_NAME));
        let error = log.append("TRAIN", "lost").expect_err("should fail");
        assert!(matches!(error, AuditLogError::Open { .. }));
    }

    #[test]
    fn resolves_cwd_then_parent_then_default() {
        let root = tempfile::tempdir().expect("tempdir");
        let cwd = root.path().join("gui");
        fs::create_dir(&cwd).expect("mkdir");

        assert_eq!(
            resolve_audit_log_path(&cwd),
            cwd.join(AUDIT_LOG_FILE_NAME)
        );

        fs::write(root.path().join(AUDIT_LOG_FILE_NAME), "").expect("parent log");
        assert_eq!(
            resolve_audit_log_path(&cwd),
            root.path().join(AUDIT_LOG_FILE_NAME)
        );

        fs::write(cwd.join(AUDIT_LOG_FILE_NAME), "").expect("local log");
        assert_eq!(
            resolve_audit_log_path(&cwd),
            cwd.join(AUDIT_LOG_FILE_NAME)
        );
    }
}
