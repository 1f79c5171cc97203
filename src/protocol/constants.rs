//! Protocol constants

use std::time::Duration;

pub const REKEY_AFTER_MESSAGES: u64 = 1 << 60;
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - (1 << 13);
pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);
pub const REKEY_ATTEMPT_TIME: Duration = Duration::from_secs(90);
pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);
pub const COOKIE_REFRESH_TIME: Duration = Duration::from_secs(120);
pub const HANDSHAKE_INITIATION_RATE: Duration = Duration::from_millis(50);

/// Upper bound (exclusive) of the random jitter added to handshake timers
pub const REKEY_TIMEOUT_JITTER_MAX: Duration = Duration::from_millis(334);

/// Retransmissions before giving up: REKEY_ATTEMPT_TIME / REKEY_TIMEOUT
pub const MAX_TIMER_HANDSHAKES: u32 =
    (REKEY_ATTEMPT_TIME.as_secs() / REKEY_TIMEOUT.as_secs()) as u32;

pub const UNDER_LOAD_AFTER_TIME: Duration = Duration::from_secs(1);
pub const MAX_PEERS: usize = 1 << 16;

pub const QUEUE_STAGED_SIZE: usize = 128;
pub const QUEUE_OUTBOUND_SIZE: usize = 1024;
pub const QUEUE_INBOUND_SIZE: usize = 1024;
pub const QUEUE_HANDSHAKE_SIZE: usize = 1024;

pub const PADDING_MULTIPLE: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_constants() {
        assert_eq!(MAX_TIMER_HANDSHAKES, 18);
        assert_eq!(REJECT_AFTER_MESSAGES, 18_446_744_073_709_543_423);
        assert!(REKEY_AFTER_MESSAGES < REJECT_AFTER_MESSAGES);
    }
}
