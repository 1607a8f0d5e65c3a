//! Chain access: JSON-RPC client, response cache, normalization, and classification.

mod cache;
pub mod classify;
pub mod normalize;
pub mod rpc;

pub use cache::{CacheError, ResponseCache};
pub use classify::{Classifier, ClassifierRule, Matcher};
pub use normalize::normalize;
pub use rpc::{
    BlockPayload, BlockSource, RetryPolicy, RpcClient, RpcConfig, RpcError, SignatureInfo,
    SignaturePage,
};
