// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Contract between the scanner and the platform-specific enumeration code.

use crate::rate::Gate;
use async_trait::async_trait;
use fnv::FnvBuildHasher;

/// Metadata for the process that owns a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proc {
    pub pid: u32,
    pub name: String,
}

/// Socket inode to owning-process mapping produced by one full pass.
///
/// Published snapshots hand this out behind an `Arc` and never mutate it, so
/// a walker must build a fresh map on every call rather than updating the
/// previous one in place.
pub type SocketMap = hashbrown::HashMap<u64, Proc, FnvBuildHasher>;

/// Error reported by a walker when a pass fails. The scanner logs these and
/// retries; they never reach snapshot consumers.
#[derive(Debug, thiserror::Error)]
pub enum WalkError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("enumeration failed: {0}")]
    Enumeration(String),
}

/// One full enumeration pass over all monitored processes' socket
/// descriptors.
///
/// Implementations must await one [`Gate`] tick before each block of at most
/// `block_size` descriptors, append serialized records only into `buf`, and
/// return a freshly built [`SocketMap`] per call. A walker must remain
/// callable after a failed pass.
#[async_trait]
pub trait ProcWalker: Send + Sync {
    async fn walk(
        &self,
        buf: &mut Vec<u8>,
        gate: &mut Gate,
        block_size: u64,
    ) -> Result<SocketMap, WalkError>;
}
