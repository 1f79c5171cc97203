//! Per-peer timers
//!
//! [`Timer`] is a single-shot timer driven by its own task. Its state lives
//! behind a mutex as `Idle | Armed(deadline) | Firing { rearm }`, so a
//! callback may re-arm its own timer and [`Timer::del_sync`] can wait for an
//! in-flight callback to finish.
//!
//! [`PeerTimers`] bundles the five timers of a peer; the `timers_*` hooks on
//! [`Peer`] are called by the packet pipeline on protocol events.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::peer::Peer;
use crate::protocol::constants::{
    KEEPALIVE_TIMEOUT, MAX_TIMER_HANDSHAKES, REJECT_AFTER_TIME, REKEY_TIMEOUT,
    REKEY_TIMEOUT_JITTER_MAX,
};

type TimerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Callback = Box<dyn Fn() -> TimerFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Idle,
    Armed(Instant),
    Firing { rearm: Option<Instant> },
}

struct Shared {
    state: Mutex<TimerState>,
    wake: Notify,
    firing: watch::Sender<bool>,
}

/// One-shot timer with modify/delete semantics
pub struct Timer {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl Timer {
    /// Create an idle timer; must be called inside a tokio runtime
    pub fn new<F, Fut>(callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (firing, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState::Idle),
            wake: Notify::new(),
            firing,
        });
        let callback: Callback = Box::new(move || Box::pin(callback()));
        let task = tokio::spawn(run(Arc::clone(&shared), callback));
        Self { shared, task }
    }

    /// (Re)arm to fire `after` from now
    pub fn modify(&self, after: Duration) {
        let deadline = Instant::now() + after;
        {
            let mut state = self.shared.state.lock();
            *state = match *state {
                TimerState::Firing { .. } => TimerState::Firing {
                    rearm: Some(deadline),
                },
                _ => TimerState::Armed(deadline),
            };
        }
        self.shared.wake.notify_one();
    }

    /// Disarm; a callback already running is not interrupted
    pub fn del(&self) {
        {
            let mut state = self.shared.state.lock();
            *state = match *state {
                TimerState::Firing { .. } => TimerState::Firing { rearm: None },
                _ => TimerState::Idle,
            };
        }
        self.shared.wake.notify_one();
    }

    /// Disarm and wait until no callback is running.
    ///
    /// Must not be called from this timer's own callback.
    pub async fn del_sync(&self) {
        self.del();
        let mut firing = self.shared.firing.subscribe();
        let _ = firing.wait_for(|firing| !*firing).await;
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            *self.shared.state.lock(),
            TimerState::Armed(_) | TimerState::Firing { rearm: Some(_) }
        )
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(shared: Arc<Shared>, callback: Callback) {
    loop {
        let armed = match *shared.state.lock() {
            TimerState::Armed(deadline) => Some(deadline),
            _ => None,
        };

        let Some(deadline) = armed else {
            shared.wake.notified().await;
            continue;
        };

        tokio::select! {
            _ = shared.wake.notified() => continue,
            _ = tokio::time::sleep_until(deadline) => {}
        }

        {
            let mut state = shared.state.lock();
            match *state {
                TimerState::Armed(current) if current <= Instant::now() => {
                    *state = TimerState::Firing { rearm: None };
                    shared.firing.send_replace(true);
                }
                _ => continue,
            }
        }

        callback().await;

        let mut state = shared.state.lock();
        *state = match *state {
            TimerState::Firing {
                rearm: Some(deadline),
            } => TimerState::Armed(deadline),
            _ => TimerState::Idle,
        };
        shared.firing.send_replace(false);
    }
}

/// The timers and retry bookkeeping of one peer
pub struct PeerTimers {
    pub(crate) retransmit_handshake: Timer,
    pub(crate) send_keepalive: Timer,
    pub(crate) new_handshake: Timer,
    pub(crate) zero_key_material: Timer,
    pub(crate) persistent_keepalive: Timer,
    pub(crate) handshake_attempts: AtomicU32,
    pub(crate) need_another_keepalive: AtomicBool,
    pub(crate) sent_last_minute_handshake: AtomicBool,
}

impl PeerTimers {
    pub(crate) fn new(peer: &Weak<Peer>) -> Self {
        Self {
            retransmit_handshake: peer_timer(peer, expired_retransmit_handshake),
            send_keepalive: peer_timer(peer, expired_send_keepalive),
            new_handshake: peer_timer(peer, expired_new_handshake),
            zero_key_material: peer_timer(peer, expired_zero_key_material),
            persistent_keepalive: peer_timer(peer, expired_persistent_keepalive),
            handshake_attempts: AtomicU32::new(0),
            need_another_keepalive: AtomicBool::new(false),
            sent_last_minute_handshake: AtomicBool::new(false),
        }
    }

    fn all(&self) -> [&Timer; 5] {
        [
            &self.retransmit_handshake,
            &self.send_keepalive,
            &self.new_handshake,
            &self.zero_key_material,
            &self.persistent_keepalive,
        ]
    }
}

fn peer_timer<F, Fut>(peer: &Weak<Peer>, expired: F) -> Timer
where
    F: Fn(Arc<Peer>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let peer = peer.clone();
    Timer::new(move || {
        let fired = peer.upgrade().map(&expired);
        async move {
            if let Some(fired) = fired {
                fired.await;
            }
        }
    })
}

fn jitter() -> Duration {
    let max = REKEY_TIMEOUT_JITTER_MAX.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..max))
}

async fn expired_retransmit_handshake(peer: Arc<Peer>) {
    let attempts = peer.timers.handshake_attempts.load(Ordering::Relaxed);
    if attempts > MAX_TIMER_HANDSHAKES {
        tracing::warn!(
            "{} - Handshake did not complete after {} attempts, giving up",
            peer,
            MAX_TIMER_HANDSHAKES + 2
        );
        if peer.timers_active() {
            peer.timers.send_keepalive.del();
        }
        peer.flush_staged_packets();
        if !peer.timers.zero_key_material.is_pending() {
            peer.timers.zero_key_material.modify(REJECT_AFTER_TIME * 3);
        }
        return;
    }

    peer.timers.handshake_attempts.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(
        "{} - Handshake did not complete after {} seconds, retrying (try {})",
        peer,
        REKEY_TIMEOUT.as_secs(),
        attempts + 2
    );
    let _ = peer.send_handshake_initiation(true).await;
}

async fn expired_send_keepalive(peer: Arc<Peer>) {
    peer.send_keepalive();
    if peer.timers.need_another_keepalive.swap(false, Ordering::Relaxed) && peer.timers_active() {
        peer.timers.send_keepalive.modify(KEEPALIVE_TIMEOUT);
    }
}

async fn expired_new_handshake(peer: Arc<Peer>) {
    tracing::debug!(
        "{} - Retrying handshake because we stopped hearing back after {} seconds",
        peer,
        (KEEPALIVE_TIMEOUT + REKEY_TIMEOUT).as_secs()
    );
    let _ = peer.send_handshake_initiation(false).await;
}

async fn expired_zero_key_material(peer: Arc<Peer>) {
    tracing::debug!(
        "{} - Removing all keys, since we haven't received a new one in {} seconds",
        peer,
        (REJECT_AFTER_TIME * 3).as_secs()
    );
    peer.zero_and_flush_all();
}

async fn expired_persistent_keepalive(peer: Arc<Peer>) {
    if peer.persistent_keepalive_interval() > 0 {
        peer.send_keepalive();
    }
}

impl Peer {
    pub(crate) fn timers_active(&self) -> bool {
        self.is_running() && self.device().is_some_and(|device| device.is_up())
    }

    /// Outbound data packet: expect a reply within keepalive + rekey timeout
    pub(crate) fn timers_data_sent(&self) {
        if self.timers_active() && !self.timers.new_handshake.is_pending() {
            self.timers
                .new_handshake
                .modify(KEEPALIVE_TIMEOUT + REKEY_TIMEOUT + jitter());
        }
    }

    /// Inbound data packet: owe the peer a keepalive unless we send first
    pub(crate) fn timers_data_received(&self) {
        if !self.timers_active() {
            return;
        }
        if !self.timers.send_keepalive.is_pending() {
            self.timers.send_keepalive.modify(KEEPALIVE_TIMEOUT);
        } else {
            self.timers.need_another_keepalive.store(true, Ordering::Relaxed);
        }
    }

    pub(crate) fn timers_any_authenticated_packet_sent(&self) {
        if self.timers_active() {
            self.timers.send_keepalive.del();
        }
    }

    pub(crate) fn timers_any_authenticated_packet_received(&self) {
        if self.timers_active() {
            self.timers.new_handshake.del();
        }
    }

    pub(crate) fn timers_handshake_initiated(&self) {
        if self.timers_active() {
            self.timers
                .retransmit_handshake
                .modify(REKEY_TIMEOUT + jitter());
        }
    }

    pub(crate) fn timers_handshake_complete(&self) {
        if self.timers_active() {
            self.timers.retransmit_handshake.del();
        }
        self.timers.handshake_attempts.store(0, Ordering::Relaxed);
        self.timers
            .sent_last_minute_handshake
            .store(false, Ordering::Relaxed);
        *self.last_handshake.lock() = Some(SystemTime::now());
    }

    pub(crate) fn timers_session_derived(&self) {
        if self.timers_active() {
            self.timers.zero_key_material.modify(REJECT_AFTER_TIME * 3);
        }
    }

    /// Any authenticated packet in either direction resets persistent keepalive
    pub(crate) fn timers_any_authenticated_packet_traversal(&self) {
        let interval = self.persistent_keepalive_interval();
        if interval > 0 && self.timers_active() {
            self.timers
                .persistent_keepalive
                .modify(Duration::from_secs(u64::from(interval)));
        }
    }

    pub(crate) fn timers_start(&self) {
        self.timers.handshake_attempts.store(0, Ordering::Relaxed);
        self.timers
            .sent_last_minute_handshake
            .store(false, Ordering::Relaxed);
        self.timers
            .need_another_keepalive
            .store(false, Ordering::Relaxed);
    }

    pub(crate) async fn timers_stop(&self) {
        for timer in self.timers.all() {
            timer.del_sync().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_timer() -> (Timer, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timer = Timer::new(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        (timer, fired)
    }

    async fn advance(d: Duration) {
        tokio::time::sleep(d).await;
        // Let the timer task observe the wake-up
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_at_deadline() {
        let (timer, fired) = counting_timer();
        timer.modify(Duration::from_secs(5));
        assert!(timer.is_pending());

        advance(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        advance(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_pending());

        advance(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_modify_pushes_deadline_back() {
        let (timer, fired) = counting_timer();
        timer.modify(Duration::from_secs(5));
        advance(Duration::from_secs(3)).await;
        timer.modify(Duration::from_secs(5));

        advance(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        advance(Duration::from_secs(3)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_del_cancels() {
        let (timer, fired) = counting_timer();
        timer.modify(Duration::from_secs(1));
        timer.del();
        assert!(!timer.is_pending());

        advance(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_can_rearm_itself() {
        let fired = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Weak<Timer>>>> = Arc::new(Mutex::new(None));

        let counter = Arc::clone(&fired);
        let this = Arc::clone(&slot);
        let timer = Arc::new(Timer::new(move || {
            let counter = Arc::clone(&counter);
            let this = this.lock().clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    if let Some(timer) = this.and_then(|t| t.upgrade()) {
                        timer.modify(Duration::from_secs(1));
                    }
                }
            }
        }));
        *slot.lock() = Some(Arc::downgrade(&timer));

        timer.modify(Duration::from_secs(1));
        for _ in 0..5 {
            advance(Duration::from_secs(1)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert!(!timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_del_sync_waits_for_running_callback() {
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        let timer = Timer::new(move || {
            let flag = Arc::clone(&flag);
            async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                flag.store(true, Ordering::SeqCst);
            }
        });

        timer.modify(Duration::from_millis(10));
        advance(Duration::from_millis(20)).await;
        assert!(!done.load(Ordering::SeqCst));

        timer.del_sync().await;
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..1000 {
            assert!(jitter() < REKEY_TIMEOUT_JITTER_MAX);
        }
    }
}
