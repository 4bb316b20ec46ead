//! The EVM client capability boundary: the deposit watcher and session-key
//! settlement path only ever need these four operations, so rather than
//! threading a concrete `alloy` provider everywhere, the rest of the crate
//! depends on this narrow trait. A production binary wires `AlloyEvmClient`
//! (backed by `alloy::providers::RootProvider`); tests wire `FakeEvmClient`.
//! Transaction signing and broadcasting for user withdrawals are
//! deliberately out of scope -- this core never custodies a private key for
//! user funds, only (optionally) the operational key used to pay gas for
//! confirmations it initiates itself.

use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{Filter, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use alloy::transports::http::{Client as HttpClient, Http};
use async_trait::async_trait;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct LogFilter {
    pub address: Address,
    pub from_block: u64,
    pub to_block: u64,
    pub topic0: B256,
}

#[derive(Debug, Clone)]
pub struct RawLog {
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
    /// Set by the node when this log was part of a block later orphaned by
    /// a reorg. The watcher must skip these rather than crediting a deposit
    /// that no longer exists on the canonical chain.
    pub removed: bool,
}

#[async_trait]
pub trait EvmClient: Send + Sync {
    async fn suggest_gas_price(&self) -> CoreResult<u128>;
    async fn balance_at(&self, address: Address) -> CoreResult<U256>;
    async fn latest_block(&self) -> CoreResult<u64>;
    async fn filter_logs(&self, filter: &LogFilter) -> CoreResult<Vec<RawLog>>;
    /// Broadcasts a transfer of `amount` to `to`. Out of scope for user
    /// withdrawals (see module docs); used only by confirmation/top-up
    /// flows this core explicitly owns.
    async fn transfer(&self, to: Address, amount: U256) -> CoreResult<B256>;
}

/// keccak256("Transfer(address,address,uint256)") -- the standard ERC-20
/// Transfer event signature the deposit watcher filters on.
pub fn transfer_event_topic0() -> B256 {
    alloy::primitives::keccak256(b"Transfer(address,address,uint256)")
}

/// Decodes an ERC-20 `Transfer(address indexed from, address indexed to, uint256 value)`
/// log into `(from, to, value)`. Returns `Internal` if the log doesn't have
/// the expected shape.
pub fn decode_transfer_log(log: &RawLog) -> CoreResult<(Address, Address, U256)> {
    if log.topics.len() != 3 {
        return Err(CoreError::Internal("malformed Transfer log: expected 3 topics".into()));
    }
    let from = Address::from_word(log.topics[1]);
    let to = Address::from_word(log.topics[2]);
    if log.data.len() != 32 {
        return Err(CoreError::Internal("malformed Transfer log: expected 32-byte data".into()));
    }
    let value = U256::from_be_slice(&log.data);
    Ok((from, to, value))
}

/// Production `EvmClient`: a read-only `RootProvider` handles balance/gas/log
/// queries, and an optional signer (the operational gas key, never a user's)
/// builds a fresh wallet-filled provider per send -- the same per-call
/// construction the reference bridge operator uses rather than caching a
/// signing provider across calls.
pub struct AlloyEvmClient {
    provider: RootProvider<Http<HttpClient>>,
    rpc_url: String,
    signer: Option<PrivateKeySigner>,
}

impl AlloyEvmClient {
    pub fn new(rpc_url: &str, private_key: Option<&str>) -> eyre::Result<Self> {
        use eyre::WrapErr;
        let url = rpc_url.parse().wrap_err("invalid RPC URL")?;
        let provider = ProviderBuilder::new().on_http(url);
        let signer = private_key.map(|pk| pk.parse::<PrivateKeySigner>()).transpose().wrap_err("invalid private key")?;
        Ok(AlloyEvmClient {
            provider,
            rpc_url: rpc_url.to_string(),
            signer,
        })
    }
}

#[async_trait]
impl EvmClient for AlloyEvmClient {
    async fn suggest_gas_price(&self) -> CoreResult<u128> {
        self.provider.get_gas_price().await.map_err(|e| CoreError::Internal(format!("get_gas_price failed: {e}")))
    }

    async fn balance_at(&self, address: Address) -> CoreResult<U256> {
        self.provider.get_balance(address).await.map_err(|e| CoreError::Internal(format!("get_balance failed: {e}")))
    }

    async fn latest_block(&self) -> CoreResult<u64> {
        self.provider.get_block_number().await.map_err(|e| CoreError::Internal(format!("get_block_number failed: {e}")))
    }

    async fn filter_logs(&self, filter: &LogFilter) -> CoreResult<Vec<RawLog>> {
        let rpc_filter = Filter::new().address(filter.address).from_block(filter.from_block).to_block(filter.to_block);
        let logs = self.provider.get_logs(&rpc_filter).await.map_err(|e| CoreError::Internal(format!("get_logs failed: {e}")))?;
        Ok(logs
            .into_iter()
            .map(|log| RawLog {
                block_number: log.block_number.unwrap_or_default(),
                tx_hash: log.transaction_hash.unwrap_or_default(),
                log_index: log.log_index.unwrap_or_default(),
                topics: log.topics().to_vec(),
                data: log.data().data.to_vec(),
                removed: log.removed,
            })
            .collect())
    }

    async fn transfer(&self, to: Address, amount: U256) -> CoreResult<B256> {
        let signer = self.signer.as_ref().ok_or(CoreError::Unavailable)?;
        let wallet = EthereumWallet::from(signer.clone());
        let url = self.rpc_url.parse().map_err(|_| CoreError::Internal("invalid rpc url".into()))?;
        let provider = ProviderBuilder::new().with_recommended_fillers().wallet(wallet).on_http(url);
        let tx = TransactionRequest::default().with_to(to).with_value(amount);
        let pending = provider.send_transaction(tx).await.map_err(|e| CoreError::Internal(format!("send_transaction failed: {e}")))?;
        Ok(*pending.tx_hash())
    }
}
