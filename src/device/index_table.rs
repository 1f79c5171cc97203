//! Receiver index table
//!
//! Maps the random 32-bit indices we hand out in handshake messages to the
//! owning peer and to either its in-progress handshake or an established
//! keypair. Lookups take a read lock; allocation and removal are exclusive.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::RngCore;

use crate::error::ProtocolError;
use crate::protocol::Keypair;

/// Random draws before giving up on finding a free index
const MAX_INDEX_ATTEMPTS: usize = 64;

/// What an index currently refers to
#[derive(Clone)]
pub enum IndexTarget {
    Handshake,
    Keypair(Arc<Keypair>),
}

struct IndexEntry<P> {
    peer: Arc<P>,
    target: IndexTarget,
}

pub struct IndexTable<P> {
    table: RwLock<HashMap<u32, IndexEntry<P>>>,
}

impl<P> Default for IndexTable<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> IndexTable<P> {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
        }
    }

    /// Allocate a fresh random index for `peer`'s handshake
    pub fn new_index_for_handshake(&self, peer: &Arc<P>) -> Result<u32, ProtocolError> {
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_INDEX_ATTEMPTS {
            let index = rng.next_u32();
            if self.table.read().contains_key(&index) {
                continue;
            }

            let mut table = self.table.write();
            if table.contains_key(&index) {
                continue;
            }
            table.insert(
                index,
                IndexEntry {
                    peer: Arc::clone(peer),
                    target: IndexTarget::Handshake,
                },
            );
            return Ok(index);
        }

        Err(ProtocolError::IndexExhausted {
            attempts: MAX_INDEX_ATTEMPTS,
        })
    }

    /// Point an existing index at the keypair derived from its handshake
    pub fn swap_index_for_keypair(&self, index: u32, keypair: Arc<Keypair>) {
        if let Some(entry) = self.table.write().get_mut(&index) {
            entry.target = IndexTarget::Keypair(keypair);
        }
    }

    pub fn delete(&self, index: u32) {
        self.table.write().remove(&index);
    }

    pub fn lookup(&self, index: u32) -> Option<(Arc<P>, IndexTarget)> {
        self.table
            .read()
            .get(&index)
            .map(|entry| (Arc::clone(&entry.peer), entry.target.clone()))
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }
}
