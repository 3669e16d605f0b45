use std::{
    fs, io,
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, SecondsFormat, Utc};

static FILE_SUFFIX_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn truncate_message(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }

    let truncated: String = input.chars().take(max_chars).collect();
    format!("{truncated}...")
}

pub fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Monotonic suffix for temp and backup file names within this process.
pub fn unique_time_suffix() -> u64 {
    let counter = FILE_SUFFIX_COUNTER.fetch_add(1, Ordering::Relaxed);
    unix_now_secs().saturating_mul(1_000).saturating_add(counter)
}

pub fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(unix)]
pub fn restrict_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt as _;

    if path.exists() {
        if let Err(error) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
            tracing::warn!(?path, %error, "failed to restrict file permissions");
        }
    }
}

#[cfg(not(unix))]
pub fn restrict_file_permissions(_path: &Path) {}

/// Write `content` next to `path` and rename it into place.
pub fn write_atomically(path: &Path, content: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = path.with_extension(format!("tmp-{}", unique_time_suffix()));
    fs::write(&tmp_path, content)?;
    restrict_file_permissions(&tmp_path);
    fs::rename(&tmp_path, path)
}
