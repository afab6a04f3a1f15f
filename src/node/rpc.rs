//! JSON-RPC client for the node
//!
//! [`NodeRpc`] is the seam the session and the transaction orchestrator
//! talk through. Implementors only provide [`NodeRpc::request`], a single
//! classified round-trip; retry and the typed wallet calls are built on top
//! of it. [`RpcClient`] is the HTTP implementation.

use super::config::NodeEndpoint;
use super::state::SyncStatus;
use crate::backoff::{self, BackoffPolicy};
use crate::error::{RpcError, WalletError, RPC_IN_WARMUP};
use crate::tx::address::Address;
use crate::tx::amount::Amount;
use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Per-call timeout, distinct from the retry ceiling
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Confirmed balance per address
pub type AddressBalances = BTreeMap<String, Amount>;

/// RPC request structure
#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a [Value],
}

/// RPC error object inside a response
#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// Retry budgets applied by [`NodeRpc::call`]
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicies {
    pub unreachable: BackoffPolicy,
    pub busy: BackoffPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            unreachable: BackoffPolicy::network(),
            busy: BackoffPolicy::node_busy(),
        }
    }
}

impl RetryPolicies {
    pub fn none() -> Self {
        Self {
            unreachable: BackoffPolicy::none(),
            busy: BackoffPolicy::none(),
        }
    }
}

/// One output of a `z_sendmany` call
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SendOutput {
    pub address: String,
    pub amount: Amount,
    /// Hex-encoded memo, shielded outputs only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

/// State of an asynchronous node operation
#[derive(Debug, Clone, PartialEq)]
pub enum OperationStatus {
    Queued,
    Executing,
    Success { txid: String },
    Failed { message: String },
}

impl OperationStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            OperationStatus::Success { .. } | OperationStatus::Failed { .. }
        )
    }
}

/// Authenticated request/response channel to a node
#[async_trait]
pub trait NodeRpc: Send + Sync {
    /// Execute one request and classify its failure. Never retries.
    async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError>;

    fn retry_policies(&self) -> RetryPolicies {
        RetryPolicies::default()
    }

    /// Execute a request, retrying unreachable and busy nodes under their
    /// own budgets. Authentication, malformed and node errors return at once.
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        let policies = self.retry_policies();
        let busy = &policies.busy;

        backoff::retry(
            &policies.unreachable,
            |e: &RpcError| !e.is_unreachable(),
            || {
                let params = params.clone();
                async move {
                    backoff::retry(busy, |e: &RpcError| !e.is_busy(), || {
                        self.request(method, params.clone())
                    })
                    .await
                }
            },
        )
        .await
    }

    /// Single-shot status probe used by the polling loop
    async fn sync_status(&self) -> Result<SyncStatus, RpcError> {
        let info = self.request("getinfo", vec![]).await?;
        let chain = self.request("getblockchaininfo", vec![]).await?;
        parse_sync_status(&info, &chain)
    }

    async fn operation_status(&self, opid: &str) -> Result<OperationStatus, RpcError> {
        let result = self
            .call("z_getoperationstatus", vec![json!([opid])])
            .await?;
        parse_operation_status(&result, opid)
    }

    /// Start a `z_sendmany` operation and return its operation id.
    /// Not retried: a lost response must not send twice.
    async fn send_many(
        &self,
        from: &str,
        outputs: &[SendOutput],
        min_conf: u32,
        fee: Amount,
    ) -> Result<String, RpcError> {
        let outputs =
            serde_json::to_value(outputs).map_err(|e| RpcError::malformed("z_sendmany", e.to_string()))?;
        let result = self
            .request(
                "z_sendmany",
                vec![json!(from), outputs, json!(min_conf), json!(fee)],
            )
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RpcError::malformed("z_sendmany", "expected an operation id"))
    }

    /// Consolidate funds from `from` into `to`. Returns the operation id.
    async fn merge_to_address(
        &self,
        from: &[String],
        to: &str,
        fee: Amount,
    ) -> Result<String, RpcError> {
        // Limits of 0 merge every note and UTXO of the sources
        let result = self
            .request(
                "z_mergetoaddress",
                vec![json!(from), json!(to), json!(fee), json!(0), json!(0)],
            )
            .await?;
        result
            .get("opid")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RpcError::malformed("z_mergetoaddress", "missing opid"))
    }

    /// Node's fee estimate, `None` when it has no data yet
    async fn estimate_fee(&self) -> Result<Option<Amount>, RpcError> {
        let result = self.call("estimatefee", vec![json!(1)]).await?;
        Ok(serde_json::from_value::<Amount>(result)
            .ok()
            .filter(|fee| !fee.is_zero()))
    }

    /// Confirmed spendable balance of every wallet address
    async fn address_balances(&self) -> Result<AddressBalances, RpcError> {
        let utxos = self.call("listunspent", vec![json!(1)]).await?;
        let notes = self.call("z_listunspent", vec![json!(1)]).await?;

        let mut balances = AddressBalances::new();
        accumulate_unspent(&mut balances, "listunspent", &utxos)?;
        accumulate_unspent(&mut balances, "z_listunspent", &notes)?;
        Ok(balances)
    }

    async fn validate_address(&self, address: &Address) -> Result<bool, RpcError> {
        let method = if address.is_shielded() {
            "z_validateaddress"
        } else {
            "validateaddress"
        };
        let result = self.call(method, vec![json!(address.as_str())]).await?;
        Ok(result
            .get("isvalid")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    async fn stop(&self) -> Result<(), RpcError> {
        self.request("stop", vec![]).await.map(|_| ())
    }
}

/// HTTP JSON-RPC client for one endpoint
pub struct RpcClient {
    endpoint: NodeEndpoint,
    client: reqwest::Client,
    request_id: AtomicU64,
    policies: RetryPolicies,
}

impl RpcClient {
    pub fn new(endpoint: NodeEndpoint) -> Result<Self, WalletError> {
        Self::with_timeout(endpoint, DEFAULT_CALL_TIMEOUT)
    }

    pub fn with_timeout(endpoint: NodeEndpoint, timeout: Duration) -> Result<Self, WalletError> {
        let mut builder = reqwest::Client::builder().timeout(timeout);

        // A loopback node is never reached through Tor
        if endpoint.use_tor && !endpoint.is_loopback() {
            let proxy = reqwest::Proxy::all(format!("socks5h://{}", super::config::TOR_PROXY_ADDR))
                .map_err(|e| WalletError::Configuration(format!("Invalid Tor proxy: {}", e)))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| WalletError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            endpoint,
            client,
            request_id: AtomicU64::new(1),
            policies: RetryPolicies::default(),
        })
    }

    pub fn with_policies(mut self, policies: RetryPolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn endpoint(&self) -> &NodeEndpoint {
        &self.endpoint
    }

    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        // Re-read every time: the cookie changes when the node restarts
        if let Some(creds) = self.endpoint.auth.credentials() {
            let encoded = base64::engine::general_purpose::STANDARD.encode(creds);
            if let Ok(value) = HeaderValue::from_str(&format!("Basic {}", encoded)) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }
}

#[async_trait]
impl NodeRpc for RpcClient {
    async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        let request = RpcRequest {
            jsonrpc: "1.0",
            id: self.request_id.fetch_add(1, Ordering::Relaxed),
            method,
            params: &params,
        };

        log::debug!("RPC -> {}", method);

        let response = self
            .client
            .post(self.endpoint.url())
            .headers(self.build_headers())
            .json(&request)
            .send()
            .await
            .map_err(|e| RpcError::Unreachable(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| RpcError::Unreachable(e.to_string()))?;

        classify_response(method, status, &body)
    }

    fn retry_policies(&self) -> RetryPolicies {
        self.policies.clone()
    }
}

/// Turn an HTTP status and body into a result or a classified error.
/// The node answers RPC errors with HTTP 500 and a JSON body, so the body
/// decides unless the status is an auth rejection.
pub fn classify_response(method: &str, status: u16, body: &str) -> Result<Value, RpcError> {
    if status == 401 || status == 403 {
        return Err(RpcError::AuthenticationFailed);
    }

    let parsed: Value = serde_json::from_str(body).map_err(|_| {
        let snippet: String = body.chars().take(200).collect();
        RpcError::malformed(method, format!("HTTP {} with non-JSON body: {}", status, snippet))
    })?;

    if let Some(error) = parsed.get("error").filter(|e| !e.is_null()) {
        let error: RpcErrorObject = serde_json::from_value(error.clone())
            .map_err(|e| RpcError::malformed(method, format!("bad error object: {}", e)))?;
        if error.code == RPC_IN_WARMUP {
            return Err(RpcError::NodeBusy(error.message));
        }
        return Err(RpcError::Node {
            code: error.code,
            message: error.message,
        });
    }

    match parsed.get("result") {
        Some(result) => Ok(result.clone()),
        None => Err(RpcError::malformed(method, "response has no result")),
    }
}

/// Build a [`SyncStatus`] from `getinfo` and `getblockchaininfo`
pub fn parse_sync_status(info: &Value, chain: &Value) -> Result<SyncStatus, RpcError> {
    let blocks = info
        .get("blocks")
        .and_then(Value::as_u64)
        .ok_or_else(|| RpcError::malformed("getinfo", "missing blocks"))?;

    let version_string = match info.get("build").and_then(Value::as_str) {
        Some(build) => build.to_string(),
        None => info
            .get("version")
            .map(|v| v.to_string())
            .unwrap_or_default(),
    };

    let estimated_network_height = chain
        .get("estimatedheight")
        .and_then(Value::as_u64)
        .filter(|h| *h > 0)
        .or_else(|| chain.get("headers").and_then(Value::as_u64))
        .unwrap_or(blocks);

    Ok(SyncStatus {
        current_block_height: blocks,
        estimated_network_height,
        peer_count: info
            .get("connections")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        version_string,
        is_testnet: info
            .get("testnet")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

/// Pick `opid` out of a `z_getoperationstatus` result
pub fn parse_operation_status(result: &Value, opid: &str) -> Result<OperationStatus, RpcError> {
    const METHOD: &str = "z_getoperationstatus";

    let entry = result
        .as_array()
        .and_then(|ops| {
            ops.iter()
                .find(|op| op.get("id").and_then(Value::as_str) == Some(opid))
        })
        .ok_or_else(|| RpcError::malformed(METHOD, format!("operation {} not found", opid)))?;

    let status = entry
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::malformed(METHOD, "missing status"))?;

    match status {
        "queued" => Ok(OperationStatus::Queued),
        "executing" => Ok(OperationStatus::Executing),
        "success" => entry
            .pointer("/result/txid")
            .and_then(Value::as_str)
            .map(|txid| OperationStatus::Success {
                txid: txid.to_string(),
            })
            .ok_or_else(|| RpcError::malformed(METHOD, "successful operation has no txid")),
        "failed" | "cancelled" => Ok(OperationStatus::Failed {
            message: entry
                .pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("operation {}", status)),
        }),
        other => Err(RpcError::malformed(METHOD, format!("unknown status '{}'", other))),
    }
}

fn accumulate_unspent(balances: &mut AddressBalances, method: &str, entries: &Value) -> Result<(), RpcError> {
    let entries = entries
        .as_array()
        .ok_or_else(|| RpcError::malformed(method, "expected an array"))?;

    for entry in entries {
        if entry.get("spendable").and_then(Value::as_bool) == Some(false) {
            continue;
        }
        let Some(address) = entry.get("address").and_then(Value::as_str) else {
            continue;
        };
        let amount: Amount = entry
            .get("amount")
            .cloned()
            .ok_or_else(|| RpcError::malformed(method, "entry has no amount"))
            .and_then(|v| serde_json::from_value(v).map_err(|e| RpcError::malformed(method, e.to_string())))?;

        let total = balances.entry(address.to_string()).or_insert(Amount::ZERO);
        *total = total
            .checked_add(amount)
            .ok_or_else(|| RpcError::malformed(method, "balance overflow"))?;
    }
    Ok(())
}
