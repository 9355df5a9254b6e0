//! Chain queries over the node's REST gateway and CometBFT RPC.
//!
//! Protobuf JSON encodes 64-bit integers as strings, so every numeric field accepts either
//! form.

use super::{
    AccountQueryClient, ApplicationQueryClient, BlockQueryClient, ChainError, SessionQueryClient,
    ServiceQueryClient, SharedQueryClient,
};
use crate::types::{
    Application, BlockInfo, RelayMiningDifficulty, Session, SessionHeader, SessionParams,
    SharedParams,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Client, ClientBuilder};
use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use std::time::Duration;
use tracing::debug;

#[derive(Deserialize)]
#[serde(untagged)]
enum NumOrStr {
    Num(u64),
    Str(String),
}

fn de_u64<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    match Option::<NumOrStr>::deserialize(d)? {
        None => Ok(0),
        Some(NumOrStr::Num(n)) => Ok(n),
        Some(NumOrStr::Str(s)) if s.is_empty() => Ok(0),
        Some(NumOrStr::Str(s)) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn de_i64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    let v = de_u64(d)?;
    i64::try_from(v).map_err(serde::de::Error::custom)
}

#[derive(Deserialize)]
struct RawSharedParams {
    #[serde(default, deserialize_with = "de_u64")]
    num_blocks_per_session: u64,
    #[serde(default, deserialize_with = "de_u64")]
    grace_period_end_offset_blocks: u64,
    #[serde(default, deserialize_with = "de_u64")]
    claim_window_open_offset_blocks: u64,
    #[serde(default, deserialize_with = "de_u64")]
    claim_window_close_offset_blocks: u64,
    #[serde(default, deserialize_with = "de_u64")]
    proof_window_open_offset_blocks: u64,
    #[serde(default, deserialize_with = "de_u64")]
    proof_window_close_offset_blocks: u64,
    #[serde(default, deserialize_with = "de_u64")]
    compute_units_to_tokens_multiplier: u64,
    #[serde(default, deserialize_with = "de_u64")]
    compute_unit_cost_granularity: u64,
}

#[derive(Deserialize)]
struct SharedParamsResponse {
    params: RawSharedParams,
}

#[derive(Deserialize)]
struct RawSessionParams {
    #[serde(default, deserialize_with = "de_u64")]
    num_suppliers_per_session: u64,
}

#[derive(Deserialize)]
struct SessionParamsResponse {
    params: RawSessionParams,
}

#[derive(Deserialize)]
struct RawSessionHeader {
    #[serde(default)]
    application_address: String,
    #[serde(default)]
    service_id: String,
    #[serde(default)]
    session_id: String,
    #[serde(default, deserialize_with = "de_i64")]
    session_start_block_height: i64,
    #[serde(default, deserialize_with = "de_i64")]
    session_end_block_height: i64,
}

#[derive(Deserialize)]
struct RawSupplier {
    #[serde(default)]
    operator_address: String,
}

#[derive(Deserialize)]
struct RawSession {
    header: RawSessionHeader,
    #[serde(default)]
    session_id: String,
    #[serde(default, deserialize_with = "de_u64")]
    session_number: u64,
    #[serde(default, deserialize_with = "de_u64")]
    num_blocks_per_session: u64,
    #[serde(default)]
    suppliers: Vec<RawSupplier>,
}

#[derive(Deserialize)]
struct SessionResponse {
    session: RawSession,
}

#[derive(Deserialize)]
struct RawCoin {
    #[serde(default, deserialize_with = "de_u64")]
    amount: u64,
}

#[derive(Deserialize)]
struct RawServiceConfig {
    #[serde(default)]
    service_id: String,
}

#[derive(Deserialize)]
struct RawApplication {
    address: String,
    stake: Option<RawCoin>,
    #[serde(default)]
    service_configs: Vec<RawServiceConfig>,
    #[serde(default)]
    delegatee_gateway_addresses: Vec<String>,
}

#[derive(Deserialize)]
struct ApplicationResponse {
    application: RawApplication,
}

#[derive(Deserialize)]
struct RawPubKey {
    key: String,
}

#[derive(Deserialize)]
struct RawAccount {
    pub_key: Option<RawPubKey>,
}

#[derive(Deserialize)]
struct AccountResponse {
    account: RawAccount,
}

#[derive(Deserialize)]
struct RawDifficulty {
    #[serde(default)]
    service_id: String,
    #[serde(default, deserialize_with = "de_u64")]
    block_height: u64,
    #[serde(default, deserialize_with = "de_u64")]
    num_relays_ema: u64,
    #[serde(default)]
    target_hash: String,
}

#[derive(Deserialize)]
struct DifficultyResponse {
    relay_difficulty: RawDifficulty,
}

#[derive(Deserialize)]
struct RawService {
    #[serde(default, deserialize_with = "de_u64")]
    compute_units_per_relay: u64,
}

#[derive(Deserialize)]
struct ServiceResponse {
    service: RawService,
}

#[derive(Deserialize)]
struct RawBlockHeader {
    #[serde(deserialize_with = "de_u64")]
    height: u64,
}

#[derive(Deserialize)]
struct RawBlock {
    header: RawBlockHeader,
}

#[derive(Deserialize)]
struct RawBlockId {
    #[serde(default)]
    hash: String,
}

#[derive(Deserialize)]
struct RawBlockResult {
    block_id: Option<RawBlockId>,
    block: RawBlock,
}

#[derive(Deserialize)]
struct BlockResponse {
    result: RawBlockResult,
}

/// REST/RPC chain client used by the relayer binary.
pub struct RestChainClient {
    client: Client,
    rest_url: String,
    rpc_url: String,
}

impl RestChainClient {
    /// # Errors
    ///
    /// Returns [`ChainError::Query`] if the HTTP client cannot be built.
    pub fn new(rest_url: &str, rpc_url: &str, timeout: Duration) -> Result<Self, ChainError> {
        let client = ClientBuilder::new()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .use_rustls_tls()
            .build()
            .map_err(|e| ChainError::Query(format!("HTTP client build failed: {e}")))?;

        Ok(Self {
            client,
            rest_url: rest_url.trim_end_matches('/').to_string(),
            rpc_url: rpc_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, ChainError> {
        debug!(url, "chain query");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ChainError::Query(sanitize_network_error(&e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ChainError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(ChainError::Query(format!("unexpected status {status} from {url}")));
        }

        response.json::<T>().await.map_err(|e| ChainError::InvalidResponse(e.to_string()))
    }
}

fn sanitize_network_error(error: &reqwest::Error) -> String {
    if error.is_connect() {
        "connection refused or unreachable".to_string()
    } else if error.is_timeout() {
        "connection timed out".to_string()
    } else if error.is_decode() {
        "response decode error".to_string()
    } else {
        "network error".to_string()
    }
}

#[async_trait]
impl SharedQueryClient for RestChainClient {
    async fn get_params(&self) -> Result<SharedParams, ChainError> {
        let url = format!("{}/pokt-network/poktroll/shared/params", self.rest_url);
        let raw: SharedParamsResponse = self.get_json(&url).await?;
        let p = raw.params;
        Ok(SharedParams {
            num_blocks_per_session: p.num_blocks_per_session,
            grace_period_end_offset_blocks: p.grace_period_end_offset_blocks,
            claim_window_open_offset_blocks: p.claim_window_open_offset_blocks,
            claim_window_close_offset_blocks: p.claim_window_close_offset_blocks,
            proof_window_open_offset_blocks: p.proof_window_open_offset_blocks,
            proof_window_close_offset_blocks: p.proof_window_close_offset_blocks,
            compute_units_to_tokens_multiplier: p.compute_units_to_tokens_multiplier,
            compute_unit_cost_granularity: p.compute_unit_cost_granularity.max(1),
        })
    }
}

#[async_trait]
impl SessionQueryClient for RestChainClient {
    async fn get_session(
        &self,
        app_address: &str,
        service_id: &str,
        height: u64,
    ) -> Result<Session, ChainError> {
        let url = format!(
            "{}/pokt-network/poktroll/session/get_session?application_address={app_address}&service_id={service_id}&block_height={height}",
            self.rest_url
        );
        let raw: SessionResponse = self.get_json(&url).await?;
        let s = raw.session;
        Ok(Session {
            header: SessionHeader {
                application_address: s.header.application_address,
                service_id: s.header.service_id,
                session_id: s.header.session_id,
                session_start_block_height: s.header.session_start_block_height,
                session_end_block_height: s.header.session_end_block_height,
            },
            session_id: s.session_id,
            session_number: s.session_number,
            num_blocks_per_session: s.num_blocks_per_session,
            suppliers: s.suppliers.into_iter().map(|s| s.operator_address).collect(),
        })
    }

    async fn get_params(&self) -> Result<SessionParams, ChainError> {
        let url = format!("{}/pokt-network/poktroll/session/params", self.rest_url);
        let raw: SessionParamsResponse = self.get_json(&url).await?;
        Ok(SessionParams { num_suppliers_per_session: raw.params.num_suppliers_per_session })
    }
}

#[async_trait]
impl ApplicationQueryClient for RestChainClient {
    async fn get_application(&self, address: &str) -> Result<Application, ChainError> {
        let url =
            format!("{}/pokt-network/poktroll/application/application/{address}", self.rest_url);
        let raw: ApplicationResponse = self.get_json(&url).await?;
        let app = raw.application;
        Ok(Application {
            address: app.address,
            stake: app.stake.map_or(0, |c| c.amount),
            service_ids: app.service_configs.into_iter().map(|c| c.service_id).collect(),
            delegatee_gateway_addresses: app.delegatee_gateway_addresses,
        })
    }
}

#[async_trait]
impl AccountQueryClient for RestChainClient {
    async fn get_public_key(&self, address: &str) -> Result<Vec<u8>, ChainError> {
        let url = format!("{}/cosmos/auth/v1beta1/accounts/{address}", self.rest_url);
        let raw: AccountResponse = self.get_json(&url).await?;
        let key = raw
            .account
            .pub_key
            .ok_or_else(|| ChainError::NotFound(format!("public key for {address}")))?;
        STANDARD.decode(key.key).map_err(|e| ChainError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl BlockQueryClient for RestChainClient {
    async fn latest_block(&self) -> Result<BlockInfo, ChainError> {
        let url = format!("{}/block", self.rpc_url);
        let raw: BlockResponse = self.get_json(&url).await?;
        Ok(BlockInfo {
            height: raw.result.block.header.height,
            hash: raw.result.block_id.map(|id| id.hash).filter(|h| !h.is_empty()),
        })
    }
}

#[async_trait]
impl ServiceQueryClient for RestChainClient {
    async fn get_relay_mining_difficulty(
        &self,
        service_id: &str,
    ) -> Result<RelayMiningDifficulty, ChainError> {
        let url = format!(
            "{}/pokt-network/poktroll/service/relay_mining_difficulty/{service_id}",
            self.rest_url
        );
        let raw: DifficultyResponse = self.get_json(&url).await?;
        let d = raw.relay_difficulty;
        let target_hash =
            STANDARD.decode(d.target_hash).map_err(|e| ChainError::InvalidResponse(e.to_string()))?;
        Ok(RelayMiningDifficulty {
            service_id: d.service_id,
            block_height: d.block_height,
            num_relays_ema: d.num_relays_ema,
            target_hash,
        })
    }

    async fn get_compute_units_per_relay(&self, service_id: &str) -> Result<u64, ChainError> {
        let url = format!("{}/pokt-network/poktroll/service/service/{service_id}", self.rest_url);
        let raw: ServiceResponse = self.get_json(&url).await?;
        Ok(raw.service.compute_units_per_relay.max(1))
    }
}
