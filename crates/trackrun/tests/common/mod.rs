// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Common test utilities for integration tests

pub mod mocks;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use filetime::FileTime;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// A token whose `exp` claim lies far in the future.
#[allow(dead_code)]
pub fn valid_token() -> String {
    format!(
        "eyJhbGciOiJIUzI1NiJ9.{}.signature",
        URL_SAFE_NO_PAD.encode(r#"{"sub":"tester","exp":4102444800}"#)
    )
}

/// Sets the mtime of `path` to `age` in the past.
#[allow(dead_code)]
pub fn age_file(path: &Path, age: Duration) {
    let mtime = SystemTime::now() - age;
    filetime::set_file_mtime(path, FileTime::from_system_time(mtime)).expect("set mtime");
}

#[allow(dead_code)]
pub fn set_mtime(path: &Path, secs: i64) {
    filetime::set_file_mtime(path, FileTime::from_unix_time(secs, 0)).expect("set mtime");
}
