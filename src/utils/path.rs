use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Name prefix of every file the stager writes into a staging directory.
/// The watchdog relies on it to find orphans.
pub const STAGED_FILE_PREFIX: &str = "tcf_";

pub const STDOUT_LOG_EXT: &str = "out";
pub const STDERR_LOG_EXT: &str = "err";

/// Strips the input or output protocol marker, whichever matches first.
pub fn strip_prefix<'a>(handle: &'a str, in_prefix: &str, out_prefix: &str) -> &'a str {
    if !in_prefix.is_empty() {
        if let Some(rest) = handle.strip_prefix(in_prefix) {
            return rest;
        }
    }
    if !out_prefix.is_empty() {
        if let Some(rest) = handle.strip_prefix(out_prefix) {
            return rest;
        }
    }
    handle
}

/// Replaces a malformed leading protocol (e.g. `lfn/`) with its corrected
/// form. At most one fixup is applied.
pub fn apply_prefix_fixup(handle: &str, fixups: &BTreeMap<String, String>) -> String {
    for (bad, good) in fixups {
        if let Some(rest) = handle.strip_prefix(bad.as_str()) {
            return format!("{}{}", good, rest);
        }
    }
    handle.to_string()
}

/// Key under which a file is tracked: trimmed, protocol marker removed,
/// malformed prefix corrected.
pub fn normalize_handle(
    raw: &str,
    in_prefix: &str,
    out_prefix: &str,
    fixups: &BTreeMap<String, String>,
) -> String {
    let stripped = strip_prefix(raw.trim(), in_prefix, out_prefix);
    apply_prefix_fixup(stripped, fixups)
}

/// Applies each `(from, to)` rewrite to its first occurrence.
pub fn rewrite_source(handle: &str, rewrites: &[(String, String)]) -> String {
    let mut source = handle.to_string();
    for (from, to) in rewrites {
        if let Some(pos) = source.find(from.as_str()) {
            source.replace_range(pos..pos + from.len(), to);
        }
    }
    source
}

/// Last component of a handle, splitting on both `/` and `:`.
pub fn handle_basename(handle: &str) -> String {
    let trimmed = handle.trim().trim_end_matches('/');
    let base = match trimmed.rfind(['/', ':']) {
        Some(pos) => &trimmed[pos + 1..],
        None => trimmed,
    };
    if base.is_empty() {
        trimmed.replace(['/', ':'], "_")
    } else {
        base.to_string()
    }
}

/// `<dir>/tcf_<basename>`
pub fn staging_filename(dir: &Path, handle: &str) -> PathBuf {
    dir.join(format!("{}{}", STAGED_FILE_PREFIX, handle_basename(handle)))
}

/// Stdout and stderr log paths for a transfer writing `staged`.
pub fn transfer_log_paths(log_dir: &Path, staged: &Path) -> (PathBuf, PathBuf) {
    let name = staged
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| STAGED_FILE_PREFIX.to_string());
    (
        log_dir.join(format!("{}.{}", name, STDOUT_LOG_EXT)),
        log_dir.join(format!("{}.{}", name, STDERR_LOG_EXT)),
    )
}

pub fn is_log_file(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e == STDOUT_LOG_EXT || e == STDERR_LOG_EXT)
        .unwrap_or(false)
}
