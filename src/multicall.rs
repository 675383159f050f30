//! Batched read-only contract calls via Multicall3.
//!
//! Turns N independent view calls into ceil(N / page_size) round-trips while
//! preserving per-call result ordering - callers zip results back against
//! their argument list by index. Every operation takes an optional block
//! height; historical callers pin their reads so state is observed at the
//! block being processed, not at the head. The page transport sits behind
//! [`CallExecutor`] so the aggregator logic is testable without a node.

use alloy_primitives::Address;
use alloy_provider::{Provider, ProviderBuilder};
use alloy_rpc_types::TransactionRequest;
use alloy_sol_types::SolCall;
use tracing::{debug, warn};

use crate::abi::IMulticall3;
use crate::errors::MulticallError;

/// Executes one already-paged list of calls as a single aggregate3 call,
/// at `block` when given and at the latest state otherwise.
#[allow(async_fn_in_trait)]
pub trait CallExecutor {
    async fn execute(
        &self,
        calls: Vec<IMulticall3::Call3>,
        block: Option<u64>,
    ) -> Result<Vec<IMulticall3::Result>, MulticallError>;
}

/// Production executor: one `eth_call` against the Multicall3 contract.
pub struct RpcCallExecutor {
    rpc_url: String,
    multicall_address: Address,
}

impl RpcCallExecutor {
    pub fn new(rpc_url: String, multicall_address: Address) -> Self {
        Self {
            rpc_url,
            multicall_address,
        }
    }
}

impl CallExecutor for RpcCallExecutor {
    async fn execute(
        &self,
        calls: Vec<IMulticall3::Call3>,
        block: Option<u64>,
    ) -> Result<Vec<IMulticall3::Result>, MulticallError> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        let provider = ProviderBuilder::new()
            .connect_http(
                self.rpc_url
                    .parse()
                    .map_err(|e| MulticallError::Transport(format!("bad rpc url: {e}")))?,
            );

        let calldata = IMulticall3::aggregate3Call { calls }.abi_encode();
        let tx = TransactionRequest::default()
            .to(self.multicall_address)
            .input(calldata.into());

        let mut call = provider.call(tx);
        if let Some(height) = block {
            call = call.block(height.into());
        }
        let raw = call
            .await
            .map_err(|e| MulticallError::Transport(e.to_string()))?;

        IMulticall3::aggregate3Call::abi_decode_returns(&raw)
            .map_err(|e| MulticallError::Transport(format!("undecodable aggregate3 return: {e}")))
    }
}

/// Per-call outcome in tolerant mode.
#[derive(Debug, Clone)]
pub struct CallResult<T> {
    pub success: bool,
    pub value: Option<T>,
}

impl<T> CallResult<T> {
    pub fn ok(self) -> Option<T> {
        if self.success {
            self.value
        } else {
            None
        }
    }
}

pub struct Multicall<E> {
    executor: E,
}

impl<E: CallExecutor> Multicall<E> {
    pub fn new(executor: E) -> Self {
        Self { executor }
    }

    /// Strict aggregate against one target: any failed or undecodable call
    /// aborts the whole operation. Used where the caller has no fallback for
    /// partial data.
    pub async fn aggregate<C: SolCall>(
        &self,
        target: Address,
        calls: Vec<C>,
        block: Option<u64>,
        page_size: usize,
    ) -> Result<Vec<C::Return>, MulticallError> {
        let targeted = calls.into_iter().map(|c| (target, c)).collect();
        self.aggregate_multi(targeted, block, page_size).await
    }

    /// Strict aggregate with a per-call target address, for calls that fan
    /// out across many pools in one page.
    pub async fn aggregate_multi<C: SolCall>(
        &self,
        calls: Vec<(Address, C)>,
        block: Option<u64>,
        page_size: usize,
    ) -> Result<Vec<C::Return>, MulticallError> {
        let raw = self.run_pages(&calls, block, page_size).await?;

        let mut out = Vec::with_capacity(raw.len());
        for (index, result) in raw.into_iter().enumerate() {
            if !result.success {
                return Err(MulticallError::CallFailed { index });
            }
            let value = C::abi_decode_returns(&result.returnData).map_err(|e| {
                MulticallError::Decode {
                    index,
                    message: e.to_string(),
                }
            })?;
            out.push(value);
        }
        Ok(out)
    }

    /// Tolerant aggregate: a failing call is reported in place and does not
    /// abort sibling calls or later pages. Used for speculative backfills
    /// (e.g. position ids that may have been burned).
    pub async fn try_aggregate<C: SolCall>(
        &self,
        target: Address,
        calls: Vec<C>,
        block: Option<u64>,
        page_size: usize,
    ) -> Result<Vec<CallResult<C::Return>>, MulticallError> {
        let targeted: Vec<(Address, C)> = calls.into_iter().map(|c| (target, c)).collect();
        let raw = self.run_pages(&targeted, block, page_size).await?;

        let mut out = Vec::with_capacity(raw.len());
        for (index, result) in raw.into_iter().enumerate() {
            if !result.success {
                out.push(CallResult {
                    success: false,
                    value: None,
                });
                continue;
            }
            match C::abi_decode_returns(&result.returnData) {
                Ok(value) => out.push(CallResult {
                    success: true,
                    value: Some(value),
                }),
                Err(e) => {
                    // Undecodable data from a "successful" call is treated
                    // like a failed call in tolerant mode.
                    warn!("dropping call #{index}: undecodable return ({e})");
                    out.push(CallResult {
                        success: false,
                        value: None,
                    });
                }
            }
        }
        Ok(out)
    }

    /// Tolerant aggregate with per-call targets. Token contracts are the
    /// usual callers here: a non-conforming `symbol()` must not sink the
    /// whole metadata backfill.
    pub async fn try_aggregate_multi<C: SolCall>(
        &self,
        calls: Vec<(Address, C)>,
        block: Option<u64>,
        page_size: usize,
    ) -> Result<Vec<CallResult<C::Return>>, MulticallError> {
        let raw = self.run_pages(&calls, block, page_size).await?;

        let mut out = Vec::with_capacity(raw.len());
        for result in raw {
            if !result.success {
                out.push(CallResult {
                    success: false,
                    value: None,
                });
                continue;
            }
            match C::abi_decode_returns(&result.returnData) {
                Ok(value) => out.push(CallResult {
                    success: true,
                    value: Some(value),
                }),
                Err(_) => out.push(CallResult {
                    success: false,
                    value: None,
                }),
            }
        }
        Ok(out)
    }

    /// Chunk, execute page by page, concatenate in caller order. All pages
    /// run at the same pinned block.
    async fn run_pages<C: SolCall>(
        &self,
        calls: &[(Address, C)],
        block: Option<u64>,
        page_size: usize,
    ) -> Result<Vec<IMulticall3::Result>, MulticallError> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }
        let page_size = page_size.max(1);

        let encoded: Vec<IMulticall3::Call3> = calls
            .iter()
            .map(|(target, call)| IMulticall3::Call3 {
                target: *target,
                allowFailure: true,
                callData: call.abi_encode().into(),
            })
            .collect();

        let mut results = Vec::with_capacity(encoded.len());
        for page in encoded.chunks(page_size) {
            let page_results = self.executor.execute(page.to_vec(), block).await?;
            if page_results.len() != page.len() {
                return Err(MulticallError::Transport(format!(
                    "page returned {} results for {} calls",
                    page_results.len(),
                    page.len()
                )));
            }
            results.extend(page_results);
        }
        debug!(
            "multicall: {} calls in {} pages",
            results.len(),
            results.len().div_ceil(page_size)
        );
        Ok(results)
    }
}
