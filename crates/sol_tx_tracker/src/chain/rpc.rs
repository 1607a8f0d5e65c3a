//! Solana JSON-RPC client with rate limiting, retries, and an optional response cache.

use crate::chain::cache::{CacheError, ResponseCache};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_RPC_URL: &str = "https://api.mainnet-beta.solana.com";
const REQUEST_TIMEOUT_SECS: u64 = 30;
const RATE_LIMIT_MS: u64 = 500;
const MAX_RETRIES: u32 = 5;
const RETRY_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 30_000;
const MAX_SIGNATURES_PER_PAGE: usize = 1000;

/// Server-side codes for slots the node will never serve (skipped, pruned, or
/// outside its ledger window).
const NOT_FOUND_CODES: [i64; 4] = [-32001, -32004, -32007, -32009];
/// Node is behind or temporarily unable to answer.
const TRANSIENT_CODES: [i64; 3] = [-32005, -32014, -32016];

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("network: {0}")]
    Network(String),
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("offline mode: no cached response")]
    OfflineMiss,
    #[error("cancelled")]
    Cancelled,
    #[error("cache: {0}")]
    Cache(#[from] CacheError),
    #[error("http client: {0}")]
    Client(reqwest::Error),
}

impl RpcError {
    /// Network and throttling failures are worth retrying; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, RpcError::Network(_) | RpcError::RateLimited { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RpcError::Network(_) => "network",
            RpcError::RateLimited { .. } => "rate_limited",
            RpcError::NotFound(_) => "not_found",
            RpcError::Protocol(_) => "protocol",
            RpcError::OfflineMiss => "offline_miss",
            RpcError::Cancelled => "cancelled",
            RpcError::Cache(_) => "cache",
            RpcError::Client(_) => "client",
        }
    }

    /// Map a JSON-RPC error object onto the failure taxonomy.
    pub fn from_rpc_code(code: i64, message: &str) -> Self {
        if NOT_FOUND_CODES.contains(&code) {
            RpcError::NotFound(format!("{code}: {message}"))
        } else if code == 429 || code == -32429 {
            RpcError::RateLimited { retry_after: None }
        } else if TRANSIENT_CODES.contains(&code) {
            RpcError::Network(format!("{code}: {message}"))
        } else {
            RpcError::Protocol(format!("{code}: {message}"))
        }
    }
}

impl From<reqwest::Error> for RpcError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            RpcError::Client(e)
        } else if e.is_decode() {
            RpcError::Protocol(e.to_string())
        } else {
            RpcError::Network(e.to_string())
        }
    }
}

/// Exponential backoff with a cap and additive jitter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            base_delay: Duration::from_millis(RETRY_BACKOFF_MS),
            max_delay: Duration::from_millis(MAX_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), before jitter. A server hint
    /// replaces the computed value; both are capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let computed = self
            .base_delay
            .saturating_mul(1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX));
        hint.unwrap_or(computed).min(self.max_delay)
    }

    fn jittered(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let delay = self.delay_for(attempt, hint);
        let spread = (delay.as_millis() / 4) as u64;
        if spread == 0 {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0..=spread);
        (delay + Duration::from_millis(extra)).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails permanently, or the retry budget is spent.
/// Backoff sleeps end early with `Cancelled` when `stop` flips to true.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    stop: Option<&watch::Receiver<bool>>,
    label: &str,
    mut op: F,
) -> Result<T, RpcError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    let mut attempt = 0u32;
    loop {
        let err = match op().await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        if !err.is_transient() || attempt >= policy.max_retries {
            return Err(err);
        }
        let hint = match &err {
            RpcError::RateLimited { retry_after } => *retry_after,
            _ => None,
        };
        let delay = policy.jittered(attempt, hint);
        warn!(
            call = label,
            attempt,
            delay_ms = delay.as_millis() as u64,
            kind = err.kind(),
            error = %err,
            "retrying after transient error"
        );
        match stop {
            Some(stop) => {
                let mut stop = stop.clone();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    Ok(_) = stop.wait_for(|s| *s) => return Err(RpcError::Cancelled),
                }
            }
            None => tokio::time::sleep(delay).await,
        }
        attempt += 1;
    }
}

#[derive(Clone, Debug)]
pub struct RpcConfig {
    pub endpoint: String,
    pub request_timeout: Duration,
    /// Minimum spacing between outgoing requests.
    pub rate_limit: Duration,
    pub retry: RetryPolicy,
    /// Serve only from the response cache; never touch the network.
    pub offline: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_RPC_URL.to_string(),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            rate_limit: Duration::from_millis(RATE_LIMIT_MS),
            retry: RetryPolicy::default(),
            offline: false,
        }
    }
}

/// `getBlock` result for one slot. Transactions stay raw so a single malformed entry
/// cannot fail the whole block.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockPayload {
    #[serde(skip)]
    pub slot: u64,
    #[serde(default)]
    pub block_time: Option<i64>,
    #[serde(default)]
    pub block_height: Option<u64>,
    #[serde(default)]
    pub blockhash: Option<String>,
    #[serde(default)]
    pub parent_slot: Option<u64>,
    #[serde(default)]
    pub transactions: Vec<Value>,
}

impl BlockPayload {
    /// Parse a `getBlock` result object, tagging it with the requested slot.
    pub fn from_result(slot: u64, result: Value) -> Result<Self, RpcError> {
        if !result.is_object() {
            return Err(RpcError::Protocol(format!(
                "getBlock({slot}): expected object, got {result}"
            )));
        }
        let mut block: BlockPayload = serde_json::from_value(result)
            .map_err(|e| RpcError::Protocol(format!("getBlock({slot}): {e}")))?;
        block.slot = slot;
        Ok(block)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignatureInfo {
    pub signature: String,
    pub slot: u64,
    #[serde(default)]
    pub err: Option<Value>,
    #[serde(default)]
    pub memo: Option<String>,
    #[serde(default)]
    pub block_time: Option<i64>,
    #[serde(default)]
    pub confirmation_status: Option<String>,
}

/// Pagination for `getSignaturesForAddress`: newest first, walking back from `before`.
#[derive(Clone, Debug, Default)]
pub struct SignaturePage {
    pub before: Option<String>,
    pub until: Option<String>,
    pub limit: Option<usize>,
}

impl SignaturePage {
    fn to_options(&self) -> Value {
        let mut opts = json!({ "commitment": "finalized" });
        if let Some(before) = &self.before {
            opts["before"] = Value::String(before.clone());
        }
        if let Some(until) = &self.until {
            opts["until"] = Value::String(until.clone());
        }
        if let Some(limit) = self.limit {
            opts["limit"] = json!(limit.clamp(1, MAX_SIGNATURES_PER_PAGE));
        }
        opts
    }
}

/// Where the batch fetcher gets blocks from. Implemented by [`RpcClient`]; tests
/// substitute scripted sources.
pub trait BlockSource: Send + Sync {
    /// Highest finalized slot the node can serve.
    fn latest_slot(&self) -> impl Future<Output = Result<u64, RpcError>> + Send;

    fn fetch_block(
        &self,
        slot: u64,
    ) -> impl Future<Output = Result<BlockPayload, RpcError>> + Send;
}

#[derive(Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    #[serde(default)]
    message: String,
}

/// Parse a `Retry-After` header given in whole seconds.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// JSON-RPC client. Stateless across calls apart from the rate-limit clock.
pub struct RpcClient {
    config: RpcConfig,
    client: Option<reqwest::Client>,
    cache: Option<ResponseCache>,
    stop: Option<watch::Receiver<bool>>,
    last_request: std::sync::Mutex<Option<Instant>>,
    request_count: AtomicU64,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(config: RpcConfig, cache: Option<ResponseCache>) -> Result<Self, RpcError> {
        let client = if config.offline {
            None
        } else {
            Some(
                reqwest::Client::builder()
                    .use_rustls_tls()
                    .timeout(config.request_timeout)
                    .build()
                    .map_err(RpcError::Client)?,
            )
        };
        Ok(Self {
            config,
            client,
            cache,
            stop: None,
            last_request: std::sync::Mutex::new(None),
            request_count: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
        })
    }

    /// Let backoff sleeps observe the service's stop signal.
    pub fn with_stop(mut self, stop: watch::Receiver<bool>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// Requests that actually went over the network.
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    async fn rate_limit(&self) {
        let wait = {
            let last = self
                .last_request
                .lock()
                .map(|g| *g)
                .unwrap_or_else(|poisoned| *poisoned.into_inner());
            last.map(|prev| self.config.rate_limit.saturating_sub(prev.elapsed()))
                .unwrap_or_default()
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        if let Ok(mut last) = self.last_request.lock() {
            *last = Some(Instant::now());
        }
    }

    /// One JSON-RPC round trip, no retries. A `null` result is returned as `Value::Null`.
    async fn call_once(&self, method: &str, params: &Value) -> Result<Value, RpcError> {
        let client = self.client.as_ref().ok_or(RpcError::OfflineMiss)?;
        self.rate_limit().await;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        debug!(method, id, "rpc request");
        let resp = client.post(&self.config.endpoint).json(&body).send().await?;
        self.request_count.fetch_add(1, Ordering::Relaxed);
        let status = resp.status();
        if status.as_u16() == 429 {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            return Err(RpcError::RateLimited { retry_after });
        }
        let text = resp.text().await?;
        if status.is_server_error() {
            return Err(RpcError::Network(format!("status {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(RpcError::Protocol(format!(
                "status {} body {}",
                status.as_u16(),
                text
            )));
        }
        let envelope: RpcEnvelope = serde_json::from_str(&text)
            .map_err(|e| RpcError::Protocol(format!("{method}: invalid envelope: {e}")))?;
        if let Some(err) = envelope.error {
            return Err(RpcError::from_rpc_code(err.code, &err.message));
        }
        Ok(envelope.result.unwrap_or(Value::Null))
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let params = &params;
        with_retry(&self.config.retry, self.stop.as_ref(), method, move || {
            self.call_once(method, params)
        })
        .await
    }

    /// Latest finalized slot (`getSlot`). Unavailable in offline mode.
    pub async fn latest_slot(&self) -> Result<u64, RpcError> {
        if self.config.offline {
            return Err(RpcError::OfflineMiss);
        }
        let result = self.call("getSlot", json!([{ "commitment": "finalized" }])).await?;
        result
            .as_u64()
            .ok_or_else(|| RpcError::Protocol(format!("getSlot: expected integer, got {result}")))
    }

    /// Fetch one finalized block. Skipped or pruned slots surface as `NotFound`.
    pub async fn fetch_block(&self, slot: u64) -> Result<BlockPayload, RpcError> {
        let params = json!([
            slot,
            {
                "encoding": "jsonParsed",
                "transactionDetails": "full",
                "rewards": false,
                "maxSupportedTransactionVersion": 0,
                "commitment": "finalized"
            }
        ]);
        let key = ResponseCache::key_for("getBlock", &params);
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get(&key)? {
                debug!(slot, "cache hit");
                let value: Value = serde_json::from_str(&cached)
                    .map_err(|e| RpcError::Protocol(format!("cached getBlock({slot}): {e}")))?;
                return BlockPayload::from_result(slot, value);
            }
        }
        if self.config.offline {
            return Err(RpcError::OfflineMiss);
        }
        let result = self.call("getBlock", params).await?;
        if result.is_null() {
            return Err(RpcError::NotFound(format!("slot {slot} has no block")));
        }
        let body = self.cache.as_ref().map(|_| result.to_string());
        let block = BlockPayload::from_result(slot, result)?;
        if let (Some(cache), Some(body)) = (&self.cache, body) {
            if let Err(e) = cache.put(&key, "getBlock", &body) {
                warn!(slot, error = %e, "failed to cache block");
            }
        }
        Ok(block)
    }

    /// Signatures touching `address`, newest first (`getSignaturesForAddress`).
    pub async fn fetch_signatures_for_address(
        &self,
        address: &str,
        page: &SignaturePage,
    ) -> Result<Vec<SignatureInfo>, RpcError> {
        if address.trim().is_empty() {
            return Err(RpcError::Protocol("empty address".to_string()));
        }
        let result = self
            .call(
                "getSignaturesForAddress",
                json!([address, page.to_options()]),
            )
            .await?;
        if result.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(result)
            .map_err(|e| RpcError::Protocol(format!("getSignaturesForAddress: {e}")))
    }
}

impl BlockSource for RpcClient {
    fn latest_slot(&self) -> impl Future<Output = Result<u64, RpcError>> + Send {
        RpcClient::latest_slot(self)
    }

    fn fetch_block(
        &self,
        slot: u64,
    ) -> impl Future<Output = Result<BlockPayload, RpcError>> + Send {
        RpcClient::fetch_block(self, slot)
    }
}
