//! Shared persistence utilities: atomic file writes and JSON load/save.
//!
//! Every durable artifact tailtune produces (checkpoints, study reports,
//! tracking records) goes through the write-to-`.tmp`-then-rename path here,
//! so a reader observes either the previous file or the new one.

use std::io;
use std::path::Path;

/// Atomically write JSON data to a file.
///
/// Serializes `data` to pretty-printed JSON, writes to a `.tmp` sibling file,
/// then renames over the target path. Creates parent directories if needed.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Atomically write raw bytes to a file.
///
/// The temporary sibling is synced before the rename so that an abrupt
/// termination leaves either the old or the new content on disk.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load and deserialize JSON from a file.
///
/// Returns `Ok(None)` if the file doesn't exist and `ErrorKind::InvalidData`
/// when the content does not deserialize.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

/// Append one JSON value as a line to a JSONL file, creating it if needed.
pub fn append_json_line<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_string(data).map_err(io::Error::other)?;
    line.push('\n');
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(line.as_bytes())
}

/// Read every value of a JSONL file written by [`append_json_line`].
///
/// A missing file reads as empty. An unparseable final line is an append cut
/// short by a crash: it is dropped with a warning and truncated from the file
/// so the next append starts on a clean line. A bad line anywhere else is
/// `ErrorKind::InvalidData`.
pub fn load_json_lines<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Vec<T>> {
    use std::io::Write;

    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read(path)?;
    let lines: Vec<&[u8]> = content.split_inclusive(|b| *b == b'\n').collect();
    let last = lines
        .iter()
        .rposition(|line| !line.trim_ascii().is_empty());

    let mut values = Vec::new();
    let mut offset = 0u64;
    for (i, line) in lines.iter().enumerate() {
        let start = offset;
        offset += line.len() as u64;
        let text = line.trim_ascii();
        if text.is_empty() {
            continue;
        }
        match serde_json::from_slice(text) {
            Ok(value) => values.push(value),
            Err(e) if Some(i) == last => {
                tracing::warn!(
                    path = %path.display(),
                    line = i + 1,
                    error = %e,
                    "Dropping torn final line"
                );
                std::fs::OpenOptions::new()
                    .write(true)
                    .open(path)?
                    .set_len(start)?;
                return Ok(values);
            }
            Err(e) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("line {}: {e}", i + 1),
                ));
            }
        }
    }
    if content.last().is_some_and(|b| *b != b'\n') {
        std::fs::OpenOptions::new()
            .append(true)
            .open(path)?
            .write_all(b"\n")?;
    }
    Ok(values)
}
