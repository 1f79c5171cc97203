//! Per-source token bucket for handshake messages under load
//!
//! IPv4 sources are limited per address, IPv6 sources per /64. Idle
//! buckets are reclaimed by a periodic sweep.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const PACKETS_PER_SECOND: u64 = 20;
pub const PACKETS_BURSTABLE: u64 = 5;
pub const GC_INTERVAL: Duration = Duration::from_secs(1);

const PACKET_COST: u64 = 1_000_000_000 / PACKETS_PER_SECOND;
const MAX_TOKENS: u64 = PACKET_COST * PACKETS_BURSTABLE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SourceKey {
    V4([u8; 4]),
    V6([u8; 8]),
}

impl From<IpAddr> for SourceKey {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(addr) => Self::V4(addr.octets()),
            IpAddr::V6(addr) => {
                let mut prefix = [0u8; 8];
                prefix.copy_from_slice(&addr.octets()[..8]);
                Self::V6(prefix)
            }
        }
    }
}

struct Bucket {
    tokens: u64,
    last: Instant,
}

#[derive(Default)]
pub struct RateLimiter {
    table: RwLock<HashMap<SourceKey, Mutex<Bucket>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the garbage-collection sweep; it ends once the limiter is dropped
    pub fn spawn_gc(self: &Arc<Self>) -> JoinHandle<()> {
        let limiter: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(GC_INTERVAL);
            loop {
                interval.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                limiter.collect_garbage(Instant::now());
            }
        })
    }

    pub fn allow(&self, addr: IpAddr) -> bool {
        self.allow_at(addr, Instant::now())
    }

    fn allow_at(&self, addr: IpAddr, now: Instant) -> bool {
        let key = SourceKey::from(addr);

        if let Some(bucket) = self.table.read().get(&key) {
            let mut bucket = bucket.lock();
            let elapsed = now.saturating_duration_since(bucket.last).as_nanos();
            bucket.tokens = (bucket.tokens as u128 + elapsed).min(MAX_TOKENS as u128) as u64;
            bucket.last = now;
            if bucket.tokens >= PACKET_COST {
                bucket.tokens -= PACKET_COST;
                return true;
            }
            return false;
        }

        self.table.write().entry(key).or_insert_with(|| {
            Mutex::new(Bucket {
                tokens: MAX_TOKENS - PACKET_COST,
                last: now,
            })
        });
        true
    }

    /// Drop buckets idle for longer than the sweep interval
    pub fn collect_garbage(&self, now: Instant) {
        self.table
            .write()
            .retain(|_, bucket| now.saturating_duration_since(bucket.lock().last) <= GC_INTERVAL);
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    pub fn clear(&self) {
        self.table.write().clear();
    }
}
