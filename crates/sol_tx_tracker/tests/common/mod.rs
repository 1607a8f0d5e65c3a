//! Scripted in-memory block source shared by the integration tests.

#![allow(dead_code)]

use serde_json::{json, Value};
use sol_tx_tracker::{BlockPayload, BlockSource, RpcError};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub fn load_fixture(path: &str) -> Value {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../testdata");
    let full = root.join(path);
    let s =
        std::fs::read_to_string(&full).unwrap_or_else(|e| panic!("read {}: {}", full.display(), e));
    serde_json::from_str(&s).unwrap_or_else(|e| panic!("parse {}: {}", path, e))
}

pub fn fixture_block(slot: u64, path: &str) -> BlockPayload {
    BlockPayload::from_result(slot, load_fixture(path)).expect("fixture is a block object")
}

/// One successful transfer per slot unless the slot is scripted otherwise.
pub struct ScriptedSource {
    tip: u64,
    blocks: Mutex<HashMap<u64, BlockPayload>>,
    not_found: Mutex<HashSet<u64>>,
    failing: Mutex<HashSet<u64>>,
    fetches: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(tip: u64) -> Self {
        Self {
            tip,
            blocks: Mutex::default(),
            not_found: Mutex::default(),
            failing: Mutex::default(),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn with_block(self, block: BlockPayload) -> Self {
        self.blocks.lock().unwrap().insert(block.slot, block);
        self
    }

    pub fn with_not_found(self, slots: &[u64]) -> Self {
        self.not_found.lock().unwrap().extend(slots);
        self
    }

    /// Make `slot` fail as if retries were exhausted on a network error.
    pub fn fail(&self, slot: u64) {
        self.failing.lock().unwrap().insert(slot);
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn reply(&self, slot: u64) -> Result<BlockPayload, RpcError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(&slot) {
            return Err(RpcError::Network(format!("connection reset at {slot}")));
        }
        if self.not_found.lock().unwrap().contains(&slot) {
            return Err(RpcError::NotFound(format!("slot {slot} was skipped")));
        }
        if let Some(block) = self.blocks.lock().unwrap().get(&slot) {
            return Ok(block.clone());
        }
        Ok(BlockPayload {
            slot,
            block_time: Some(1_700_000_000 + slot as i64),
            transactions: vec![json!({
                "meta": { "err": null, "fee": 5000 },
                "transaction": {
                    "signatures": [format!("sig-{slot}")],
                    "message": {
                        "accountKeys": ["Payer", "Payee", "11111111111111111111111111111111"],
                        "instructions": [{
                            "program": "system",
                            "programId": "11111111111111111111111111111111",
                            "parsed": { "type": "transfer" }
                        }]
                    }
                }
            })],
            ..Default::default()
        })
    }
}

impl BlockSource for ScriptedSource {
    fn latest_slot(&self) -> impl Future<Output = Result<u64, RpcError>> + Send {
        let tip = self.tip;
        async move { Ok(tip) }
    }

    fn fetch_block(
        &self,
        slot: u64,
    ) -> impl Future<Output = Result<BlockPayload, RpcError>> + Send {
        let reply = self.reply(slot);
        async move { reply }
    }
}
