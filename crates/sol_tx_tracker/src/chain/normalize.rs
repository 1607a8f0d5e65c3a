//! Normalization of raw `getBlock` payloads into transaction records.
//!
//! Tolerant by construction: a transaction without a usable signature is dropped and
//! logged, every other missing field falls back to an absent value.

use crate::chain::classify::{Classifier, InstructionFacts, TxFacts};
use crate::chain::rpc::BlockPayload;
use crate::record::{TransactionRecord, TxStatus};
use serde_json::Value;
use tracing::warn;

/// Convert every well-formed transaction in `block` into a record, in block order.
pub fn normalize(block: &BlockPayload, classifier: &Classifier) -> Vec<TransactionRecord> {
    block
        .transactions
        .iter()
        .enumerate()
        .filter_map(|(index, tx)| {
            let record = normalize_transaction(block.slot, block.block_time, tx, classifier);
            if record.is_none() {
                warn!(slot = block.slot, index, "dropping transaction without signature");
            }
            record
        })
        .collect()
}

/// `None` only when the signature is missing or unusable.
pub fn normalize_transaction(
    slot: u64,
    block_time: Option<i64>,
    tx: &Value,
    classifier: &Classifier,
) -> Option<TransactionRecord> {
    let signature = tx
        .pointer("/transaction/signatures/0")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())?
        .to_string();
    let meta = tx.get("meta").filter(|m| m.is_object());
    let accounts = account_keys(tx, meta);
    let facts = TxFacts {
        instructions: instruction_facts(tx, &accounts),
        logs: log_messages(meta),
    };
    Some(TransactionRecord {
        signature,
        slot,
        block_time,
        status: status_of(meta),
        tx_type: classifier.classify(&facts),
        fee: meta.and_then(|m| m.get("fee")).and_then(Value::as_u64),
        accounts,
    })
}

/// Success only when metadata is present and reports no error.
fn status_of(meta: Option<&Value>) -> TxStatus {
    match meta.map(|m| m.get("err")) {
        Some(None | Some(Value::Null)) => TxStatus::Success,
        _ => TxStatus::Failed,
    }
}

/// Static account keys followed by addresses loaded from lookup tables.
fn account_keys(tx: &Value, meta: Option<&Value>) -> Vec<String> {
    let mut keys: Vec<String> = tx
        .pointer("/transaction/message/accountKeys")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(account_key).collect())
        .unwrap_or_default();
    if let Some(loaded) = meta.and_then(|m| m.get("loadedAddresses")) {
        for section in ["writable", "readonly"] {
            if let Some(arr) = loaded.get(section).and_then(Value::as_array) {
                keys.extend(arr.iter().filter_map(account_key));
            }
        }
    }
    keys
}

/// `jsonParsed` gives `{ "pubkey": .. }` objects, `json` encoding gives bare strings.
fn account_key(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Object(o) => o.get("pubkey").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn instruction_facts(tx: &Value, accounts: &[String]) -> Vec<InstructionFacts> {
    let Some(instructions) = tx
        .pointer("/transaction/message/instructions")
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };
    instructions
        .iter()
        .map(|ix| {
            let program_id = ix
                .get("programId")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| {
                    ix.get("programIdIndex")
                        .and_then(Value::as_u64)
                        .and_then(|i| accounts.get(i as usize).cloned())
                });
            InstructionFacts {
                program_id,
                program: ix.get("program").and_then(Value::as_str).map(str::to_string),
                kind: ix
                    .pointer("/parsed/type")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }
        })
        .collect()
}

fn log_messages(meta: Option<&Value>) -> Vec<String> {
    meta.and_then(|m| m.get("logMessages"))
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
