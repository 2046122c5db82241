//! Content hashing for the no-progress guard and design-context identity.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// SHA-256 of a file as lowercase hex. A missing file hashes to `""`.
pub fn hash_file(path: &Path) -> Result<String> {
    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(String::new()),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    Ok(hex::encode(Sha256::digest(contents)))
}

/// Combined hash of several files, order-sensitive.
///
/// A single path hashes the same as [`hash_file`]; missing files contribute
/// nothing, so a set of missing files hashes to `""`.
pub fn hash_files(paths: &[&Path]) -> Result<String> {
    if let [only] = paths {
        return hash_file(only);
    }
    let mut hasher = Sha256::new();
    let mut any = false;
    for path in paths {
        let digest = hash_file(path)?;
        if digest.is_empty() {
            continue;
        }
        any = true;
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update(digest.as_bytes());
    }
    if !any {
        return Ok(String::new());
    }
    Ok(hex::encode(hasher.finalize()))
}

/// First 16 hex chars of SHA-256 over canonical (sorted-key) JSON.
pub fn hash_json(value: &Value) -> String {
    let canonical = canonicalize(value).to_string();
    let mut digest = hex::encode(Sha256::digest(canonical.as_bytes()));
    digest.truncate(16);
    digest
}

/// Copy of `value` with every object's keys in sorted order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            Value::Object(
                keys.into_iter()
                    .map(|key| (key.clone(), canonicalize(&map[key.as_str()])))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
