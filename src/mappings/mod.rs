//! Event fold handlers, one module per contract surface.
//!
//! Every module follows the same three-phase shape: collect (decode matched
//! logs into a typed event enum, grouped per block), prefetch (defer every
//! entity id the batch will touch, resolve unknown ones through multicall,
//! then load), and fold (pure state transitions against the warm cache, in
//! block order and intra-block log-index order). No store or RPC I/O happens
//! inside a fold handler.

pub mod fee_snapshot;
pub mod lending_pair;
pub mod pool;
pub mod position_manager;

use crate::cache::EntityCache;
use crate::chain::{BlockHeader, TxInfo};
use crate::model::Tx;
use crate::store::Store;

/// Record the parent transaction of an event in the overlay. Repeated calls
/// for the same hash overwrite with identical content.
pub(crate) fn record_tx<S: Store>(
    cache: &mut EntityCache<'_, S>,
    header: &BlockHeader,
    tx: &TxInfo,
) -> String {
    let id = tx.id();
    cache.add(Tx {
        id: id.clone(),
        block_number: header.height,
        timestamp: header.time(),
        gas_used: tx.gas_used,
        gas_price: tx.gas_price,
    });
    id
}
