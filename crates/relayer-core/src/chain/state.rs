//! Process-local block height tracking.
//!
//! `BlockHeightState` is the single source of truth for "current height" inside one relayer
//! instance. Block events arrive from pub/sub (possibly out of order or with gaps when a
//! subscriber channel was full), so updates only ever move the height forward.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::trace;

#[derive(Clone, Debug, Default)]
struct ChainTip {
    height: u64,
    hash: Option<String>,
    updated_at: u64,
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Latest observed block height and hash.
///
/// Reads are wait-free (`ArcSwap`); writes are serialized by a short mutex so the
/// monotonic check and the store happen together.
///
/// ```
/// use relayer_core::chain::BlockHeightState;
///
/// let state = BlockHeightState::new();
/// assert!(state.update(10, Some("abc".to_string())));
/// assert!(!state.update(9, None));
/// assert_eq!(state.current_height(), 10);
/// ```
#[derive(Clone)]
pub struct BlockHeightState {
    tip: Arc<ArcSwap<ChainTip>>,
    write_lock: Arc<Mutex<()>>,
}

impl Default for BlockHeightState {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockHeightState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tip: Arc::new(ArcSwap::from_pointee(ChainTip::default())),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    #[inline]
    #[must_use]
    pub fn current_height(&self) -> u64 {
        self.tip.load().height
    }

    #[must_use]
    pub fn current_hash(&self) -> Option<String> {
        self.tip.load().hash.clone()
    }

    /// Seconds since the height last advanced.
    #[must_use]
    pub fn age_seconds(&self) -> u64 {
        current_unix_timestamp().saturating_sub(self.tip.load().updated_at)
    }

    /// Advances to `height` if it is newer than the current one.
    ///
    /// Returns `true` if the height was updated.
    pub fn update(&self, height: u64, hash: Option<String>) -> bool {
        let _guard = self.write_lock.lock();
        if height <= self.tip.load().height {
            return false;
        }
        self.tip.store(Arc::new(ChainTip { height, hash, updated_at: current_unix_timestamp() }));
        trace!(height, "block height advanced");
        true
    }
}
