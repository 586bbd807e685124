// src/utils/fsio.rs
//! Small filesystem helpers shared by every artifact producer.
//!
//! All JSON artifacts go through `write_json_atomic` so a concurrent reader
//! (the consolidator) sees either the previous file or the new one, never a
//! half-written buffer.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Atomically write bytes to a file.
/// Uses a `.tmp` sibling then renames.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut f = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Pretty-printed JSON with a trailing newline, written atomically.
pub fn write_json_atomic<S: Serialize>(path: &Path, value: &S) -> io::Result<()> {
    let mut text = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    text.push('\n');
    write_atomic(path, text.as_bytes())
}

/// Create a file that must not exist yet. Fails with `AlreadyExists` otherwise.
pub fn write_json_create_new<S: Serialize>(path: &Path, value: &S) -> io::Result<()> {
    let mut text = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    text.push('\n');
    let mut f = OpenOptions::new().write(true).create_new(true).open(path)?;
    f.write_all(text.as_bytes())?;
    f.sync_all()?;
    Ok(())
}

/// Outcome of reading an optional JSON artifact.
#[derive(Debug)]
pub enum JsonRead<T> {
    Missing,
    Malformed(String),
    Present(T),
}

/// Read and decode a JSON file that may legitimately not exist yet.
pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> JsonRead<T> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return JsonRead::Missing,
        Err(e) => return JsonRead::Malformed(format!("read {}: {e}", path.display())),
    };
    match serde_json::from_slice::<T>(&bytes) {
        Ok(v) => JsonRead::Present(v),
        Err(e) => JsonRead::Malformed(format!("parse {}: {e}", path.display())),
    }
}

/// Append one JSON value as a line to a JSONL file, creating parents.
pub fn append_jsonl<S: Serialize>(path: &Path, value: &S) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let line = serde_json::to_string(value).map_err(io::Error::other)?;
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(f, "{}", line)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn read_json_opt_distinguishes_missing_and_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(matches!(read_json_opt::<Value>(&missing), JsonRead::Missing));

        let broken = dir.path().join("broken.json");
        fs::write(&broken, b"{\"half\": ").unwrap();
        assert!(matches!(read_json_opt::<Value>(&broken), JsonRead::Malformed(_)));

        let good = dir.path().join("good.json");
        write_json_atomic(&good, &json!({"a": 1})).unwrap();
        match read_json_opt::<Value>(&good) {
            JsonRead::Present(v) => assert_eq!(v["a"], 1),
            other => panic!("expected present, got {other:?}"),
        }
    }

    #[test]
    fn create_new_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("header.json");
        write_json_create_new(&p, &json!({"v": 1})).unwrap();
        let err = write_json_create_new(&p, &json!({"v": 2})).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }
}
