// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Rate-limited background enumeration of per-process socket descriptors.
//!
//! A full pass over every monitored process's open descriptors is expensive,
//! so it runs on a single long-lived background task paced by a periodic
//! gate. Each completed pass is published as a double-buffered snapshot that
//! consumers copy out without ever waiting on the scan itself, and a
//! feedback law re-tunes the gate after every pass so the wall-clock cost of
//! a pass converges on a configured target.
//!
//! The enumeration itself is pluggable: callers hand the scanner a
//! [`walker::ProcWalker`] implementation and drive it through
//! [`scanner::BackgroundScanner`]'s `start`/`stop`/`snapshot` operations.

pub mod config;
pub mod errors;
pub mod rate;
pub mod scanner;
pub mod walker;
