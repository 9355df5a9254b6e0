//! Chain facts consumed by the relayer.
//!
//! Only the fields the relayer reads are modelled. All heights are block heights on the
//! settlement chain.

use super::relay::SessionHeader;
use serde::{Deserialize, Serialize};

/// Protocol-wide parameters governing session and settlement window geometry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedParams {
    pub num_blocks_per_session: u64,
    pub grace_period_end_offset_blocks: u64,
    pub claim_window_open_offset_blocks: u64,
    pub claim_window_close_offset_blocks: u64,
    pub proof_window_open_offset_blocks: u64,
    pub proof_window_close_offset_blocks: u64,
    #[serde(default = "default_compute_units_to_tokens_multiplier")]
    pub compute_units_to_tokens_multiplier: u64,
    #[serde(default = "default_compute_unit_cost_granularity")]
    pub compute_unit_cost_granularity: u64,
}

fn default_compute_units_to_tokens_multiplier() -> u64 {
    42
}

fn default_compute_unit_cost_granularity() -> u64 {
    1
}

impl Default for SharedParams {
    fn default() -> Self {
        Self {
            num_blocks_per_session: 10,
            grace_period_end_offset_blocks: 1,
            claim_window_open_offset_blocks: 1,
            claim_window_close_offset_blocks: 4,
            proof_window_open_offset_blocks: 0,
            proof_window_close_offset_blocks: 4,
            compute_units_to_tokens_multiplier: default_compute_units_to_tokens_multiplier(),
            compute_unit_cost_granularity: default_compute_unit_cost_granularity(),
        }
    }
}

/// First height of the session containing `height`. Height 0 has no session.
#[must_use]
pub fn session_start_height(num_blocks_per_session: u64, height: u64) -> u64 {
    if height == 0 || num_blocks_per_session == 0 {
        return 0;
    }
    1 + ((height - 1) / num_blocks_per_session) * num_blocks_per_session
}

/// Last height of the session containing `height`.
#[must_use]
pub fn session_end_height(num_blocks_per_session: u64, height: u64) -> u64 {
    if height == 0 || num_blocks_per_session == 0 {
        return 0;
    }
    session_start_height(num_blocks_per_session, height) + num_blocks_per_session - 1
}

impl SharedParams {
    #[must_use]
    pub fn session_start_height(&self, height: u64) -> u64 {
        session_start_height(self.num_blocks_per_session, height)
    }

    #[must_use]
    pub fn session_end_height(&self, height: u64) -> u64 {
        session_end_height(self.num_blocks_per_session, height)
    }

    /// Last height at which relays for a session ending at `session_end` are still accepted.
    #[must_use]
    pub fn grace_period_end_height(&self, session_end: u64) -> u64 {
        session_end + self.grace_period_end_offset_blocks
    }

    /// Height at which claims open; a session stops being rewardable here.
    #[must_use]
    pub fn claim_window_open_height(&self, session_end: u64) -> u64 {
        session_end + self.claim_window_open_offset_blocks + 1
    }

    #[must_use]
    pub fn claim_window_close_height(&self, session_end: u64) -> u64 {
        self.claim_window_open_height(session_end) + self.claim_window_close_offset_blocks
    }

    #[must_use]
    pub fn proof_window_open_height(&self, session_end: u64) -> u64 {
        self.claim_window_close_height(session_end) + self.proof_window_open_offset_blocks
    }

    #[must_use]
    pub fn proof_window_close_height(&self, session_end: u64) -> u64 {
        self.proof_window_open_height(session_end) + self.proof_window_close_offset_blocks
    }

    /// Blocks between a session's end and the close of its proof window.
    #[must_use]
    pub fn session_end_to_proof_window_close_blocks(&self) -> u64 {
        self.claim_window_open_offset_blocks +
            self.claim_window_close_offset_blocks +
            self.proof_window_open_offset_blocks +
            self.proof_window_close_offset_blocks
    }
}

/// Session module parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionParams {
    pub num_suppliers_per_session: u64,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self { num_suppliers_per_session: 15 }
    }
}

/// An application/service binding with its supplier set for a height range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub header: SessionHeader,
    pub session_id: String,
    pub session_number: u64,
    pub num_blocks_per_session: u64,
    /// Operator addresses of the suppliers serving this session.
    pub suppliers: Vec<String>,
}

impl Session {
    #[must_use]
    pub fn has_supplier(&self, operator_address: &str) -> bool {
        self.suppliers.iter().any(|s| s == operator_address)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub address: String,
    /// Staked amount in the chain's base denomination.
    pub stake: u64,
    #[serde(default)]
    pub service_ids: Vec<String>,
    /// Gateways allowed to sign relays on the application's behalf.
    #[serde(default)]
    pub delegatee_gateway_addresses: Vec<String>,
}

/// Per-service mining difficulty; a relay is billable iff its hash is below `target_hash`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMiningDifficulty {
    pub service_id: String,
    pub block_height: u64,
    pub num_relays_ema: u64,
    pub target_hash: Vec<u8>,
}

/// Latest block as reported by the chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub height: u64,
    pub hash: Option<String>,
}
