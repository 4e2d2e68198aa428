// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metadata of files registered against a run. Only the description is
//! sent; uploading the bytes is left to the storage backend.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::Path;

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

const MIME_TYPES: &[(&str, &str)] = &[
    ("csv", "text/csv"),
    ("gif", "image/gif"),
    ("gz", "application/gzip"),
    ("h5", "application/x-hdf5"),
    ("html", "text/html"),
    ("jpeg", "image/jpeg"),
    ("jpg", "image/jpeg"),
    ("json", "application/json"),
    ("md", "text/markdown"),
    ("npy", "application/octet-stream"),
    ("pdf", "application/pdf"),
    ("pkl", "application/octet-stream"),
    ("png", "image/png"),
    ("py", "text/x-python"),
    ("rs", "text/x-rust"),
    ("sh", "application/x-sh"),
    ("svg", "image/svg+xml"),
    ("tar", "application/x-tar"),
    ("toml", "application/toml"),
    ("txt", "text/plain"),
    ("xml", "application/xml"),
    ("yaml", "application/yaml"),
    ("yml", "application/yaml"),
    ("zip", "application/zip"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCategory {
    Input,
    Output,
    Code,
}

impl FileCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FileCategory::Input => "input",
            FileCategory::Output => "output",
            FileCategory::Code => "code",
        }
    }
}

/// MIME type for `path` from its extension.
pub fn guess_mime_type(path: &Path) -> &'static str {
    path.extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_ascii_lowercase)
        .and_then(|extension| {
            MIME_TYPES
                .iter()
                .find(|(known, _)| *known == extension)
                .map(|(_, mime)| *mime)
        })
        .unwrap_or(DEFAULT_MIME_TYPE)
}

/// Accepts `type/subtype` with no whitespace.
pub fn valid_mime_type(mime: &str) -> bool {
    match mime.split_once('/') {
        Some((kind, subtype)) => {
            !kind.is_empty()
                && !subtype.is_empty()
                && !subtype.contains('/')
                && !mime.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Builds the registration body for `path`.
///
/// Missing and zero-sized files are rejected.
pub fn describe_file(
    path: &Path,
    category: FileCategory,
    mime: Option<&str>,
    name: Option<&str>,
    run: &str,
    storage_id: Option<&str>,
) -> Result<Value, String> {
    if !path.is_file() {
        return Err(format!("File {} does not exist", path.display()));
    }
    if let Some(mime) = mime.filter(|mime| !valid_mime_type(mime)) {
        return Err(format!("Invalid MIME type '{mime}' specified"));
    }

    let metadata =
        fs::metadata(path).map_err(|e| format!("Unable to read {}: {e}", path.display()))?;
    if metadata.len() == 0 {
        return Err(format!(
            "Saving zero-sized files is not supported: {}",
            path.display()
        ));
    }
    let checksum =
        sha256_file(path).map_err(|e| format!("Unable to read {}: {e}", path.display()))?;
    let original_path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let name = name.map(str::to_string).unwrap_or_else(|| {
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    });

    let mut body = json!({
        "name": name,
        "run": run,
        "category": category.as_str(),
        "size": metadata.len(),
        "originalPath": original_path.to_string_lossy(),
        "checksum": checksum,
        "type": mime.unwrap_or_else(|| guess_mime_type(path)),
    });
    if let Some(storage) = storage_id {
        body["storage"] = json!(storage);
    }
    Ok(body)
}
