// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Seam to the upstream node.
//!
//! The materializer needs "fetch the full index for file X" during bootstrap
//! and the reconciliation engine needs "send this repair request". Both go
//! through this object-safe trait so the components can be driven by a mock
//! in tests and by the live TCP client in production.

use futures::future::BoxFuture;

use crate::block::{Block, RepairRequest};
use crate::error::Result;
use crate::store::FileKey;

pub trait UpstreamRef: Send + Sync {
    /// Complete current index for `key`: every allocated index block, with
    /// its pointer carried in the envelope. Bounded by the caller's timeout.
    fn fetch_full_index(&self, key: FileKey) -> BoxFuture<'_, Result<Vec<Block>>>;

    /// Queue an out-of-band repair request toward the upstream endpoint.
    fn send_repair(&self, request: RepairRequest) -> BoxFuture<'_, Result<()>>;
}

/// Inert implementation for producer-only replicas and unit tests: an empty
/// index and swallowed repair requests.
#[derive(Debug, Default, Clone)]
pub struct NoOpUpstream;

impl UpstreamRef for NoOpUpstream {
    fn fetch_full_index(&self, _key: FileKey) -> BoxFuture<'_, Result<Vec<Block>>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn send_repair(&self, _request: RepairRequest) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}
