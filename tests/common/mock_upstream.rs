//! Mock upstream that records repair requests and serves a canned index.

use std::sync::Mutex;

use futures::future::BoxFuture;
use waverep::block::{Block, RepairRequest};
use waverep::error::Result;
use waverep::store::FileKey;
use waverep::upstream::UpstreamRef;

#[derive(Default)]
pub struct MockUpstream {
    repairs: Mutex<Vec<RepairRequest>>,
    index: Mutex<Vec<Block>>,
}

impl MockUpstream {
    pub fn new() -> MockUpstream {
        MockUpstream::default()
    }

    /// Configure the index frames returned to full-index fetches.
    #[allow(dead_code)]
    pub fn set_index(&self, blocks: Vec<Block>) {
        *self.index.lock().unwrap() = blocks;
    }

    /// Repair requests received so far.
    #[allow(dead_code)]
    pub fn repairs(&self) -> Vec<RepairRequest> {
        self.repairs.lock().unwrap().clone()
    }
}

impl UpstreamRef for MockUpstream {
    fn fetch_full_index(&self, _key: FileKey) -> BoxFuture<'_, Result<Vec<Block>>> {
        let blocks = self.index.lock().unwrap().clone();
        Box::pin(async move { Ok(blocks) })
    }

    fn send_repair(&self, request: RepairRequest) -> BoxFuture<'_, Result<()>> {
        self.repairs.lock().unwrap().push(request);
        Box::pin(async { Ok(()) })
    }
}
