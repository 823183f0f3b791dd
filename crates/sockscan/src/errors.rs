// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors surfaced by the background socket scanner.
///
/// Only lifecycle misuse and bad configuration reach callers; scan-loop
/// faults are logged and retried internally.
#[derive(Debug, thiserror::Error)]
pub enum ScannerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Background scanner already running")]
    AlreadyRunning,

    #[error("Background scanner not running")]
    NotRunning,
}
