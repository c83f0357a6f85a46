//! Bounded pool of headless browser sessions.
//!
//! A session is keyed by its profile directory and shared by every caller
//! that asks for the same profile. The pool never holds more than
//! `max_sessions` sessions, counting ones still launching or closing. When a
//! new profile is requested at the ceiling, an unreferenced session is
//! evicted; if every session is in use the request waits until a lease is
//! dropped.
//!
//! Sessions with no holders are closed by [`SessionPool::sweep_idle`] once
//! idle for `idle_timeout`; [`SessionPool::spawn_reaper`] runs the sweep
//! periodically.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use rehoster_core::browser::{ChromeLauncher, PoolConfig, SessionPool};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = SessionPool::new(Arc::new(ChromeLauncher::new(None)), PoolConfig::default());
//! let _reaper = pool.spawn_reaper();
//! let lease = pool.acquire("/home/me/.config/rehoster/profile").await?;
//! let pattern = regex::Regex::new("videoplayback")?;
//! let url = lease
//!     .session()
//!     .capture_request("https://drive.google.com/file/d/ID/view", &pattern, Duration::from_secs(30))
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod chrome;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

pub use chrome::ChromeLauncher;

/// Default ceiling on concurrent browser instances.
pub const DEFAULT_MAX_SESSIONS: usize = 3;

/// Default idle time after which an unreferenced session is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Default interval between idle sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Browser session errors.
#[derive(Debug, Error)]
pub enum BrowserError {
    /// The browser process could not be started.
    #[error("failed to launch browser for profile {profile}: {reason}")]
    Launch {
        /// Profile directory
        profile: String,
        /// What went wrong
        reason: String,
    },

    /// A command sent to a running browser failed.
    #[error("browser session error: {0}")]
    Session(String),

    /// No matching request was observed in time.
    #[error("no matching request observed within {}s", waited.as_secs())]
    Timeout {
        /// How long we waited
        waited: Duration,
    },
}

impl BrowserError {
    /// Creates a [`BrowserError::Session`].
    #[must_use]
    pub fn session(reason: impl std::fmt::Display) -> Self {
        Self::Session(reason.to_string())
    }
}

/// One live browser instance.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Opens `url` in a new tab and returns the first outbound request URL
    /// matching `pattern`, waiting at most `wait`.
    async fn capture_request(
        &self,
        url: &str,
        pattern: &Regex,
        wait: Duration,
    ) -> Result<String, BrowserError>;

    /// Shuts the browser down.
    async fn close(&self);
}

/// Starts browser instances for a profile directory.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(&self, profile: &str) -> Result<Arc<dyn BrowserSession>, BrowserError>;
}

/// Pool sizing and timers.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

enum SlotState {
    Launching,
    Live(Arc<dyn BrowserSession>),
    /// Evicted or expired; still counts toward the ceiling until the browser is gone.
    Closing,
}

struct Slot {
    state: SlotState,
    ref_count: usize,
    created_at: Instant,
    idle_since: Option<Instant>,
}

impl Slot {
    fn is_idle(&self) -> bool {
        self.ref_count == 0 && matches!(self.state, SlotState::Live(_))
    }

    /// Marks a live slot as closing and hands back its session.
    fn begin_close(&mut self) -> Option<Arc<dyn BrowserSession>> {
        match std::mem::replace(&mut self.state, SlotState::Closing) {
            SlotState::Live(session) => {
                self.idle_since = None;
                Some(session)
            }
            other => {
                self.state = other;
                None
            }
        }
    }
}

struct Inner {
    launcher: Arc<dyn SessionLauncher>,
    config: PoolConfig,
    slots: Mutex<HashMap<String, Slot>>,
    released: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops the slot for `profile` if it is in `wanted` state, then wakes waiters.
    fn release_slot(&self, profile: &str, wanted: fn(&SlotState) -> bool) {
        {
            let mut slots = self.lock();
            if slots.get(profile).is_some_and(|slot| wanted(&slot.state)) {
                slots.remove(profile);
            }
        }
        self.released.notify_waiters();
    }
}

/// Holds a `Launching` slot; dropping it before [`Self::complete`] frees the slot.
struct LaunchReservation<'a> {
    inner: &'a Inner,
    profile: &'a str,
    armed: bool,
}

impl LaunchReservation<'_> {
    fn complete(mut self, session: &Arc<dyn BrowserSession>) {
        if let Some(slot) = self.inner.lock().get_mut(self.profile) {
            slot.state = SlotState::Live(Arc::clone(session));
        }
        self.armed = false;
        self.inner.released.notify_waiters();
    }
}

impl Drop for LaunchReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(profile = self.profile, "browser launch did not complete, releasing slot");
            self.inner
                .release_slot(self.profile, |state| matches!(state, SlotState::Launching));
        }
    }
}

enum Step {
    Ready(Arc<dyn BrowserSession>),
    Launch,
    Evict(String, Arc<dyn BrowserSession>),
    Wait,
}

/// Shared, cloneable handle to the pool.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("config", &self.inner.config)
            .field("live", &self.live_count())
            .finish()
    }
}

impl SessionPool {
    /// Creates an empty pool. A `max_sessions` of zero is treated as one.
    #[must_use]
    pub fn new(launcher: Arc<dyn SessionLauncher>, mut config: PoolConfig) -> Self {
        config.max_sessions = config.max_sessions.max(1);
        Self {
            inner: Arc::new(Inner {
                launcher,
                config,
                slots: Mutex::new(HashMap::new()),
                released: Notify::new(),
            }),
        }
    }

    /// Sessions currently held, launching or closing.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Holders of the session for `profile`, if one exists.
    #[must_use]
    pub fn ref_count(&self, profile: &str) -> Option<usize> {
        self.inner.lock().get(profile).map(|slot| slot.ref_count)
    }

    /// Returns a lease on the session for `profile`, launching it if needed.
    ///
    /// Cancelling the returned future never leaks a slot: an unfinished
    /// launch gives its slot back, and an eviction already under way runs
    /// to completion on its own task.
    ///
    /// # Errors
    ///
    /// [`BrowserError::Launch`] if a new browser fails to start.
    #[instrument(skip(self))]
    pub async fn acquire(&self, profile: &str) -> Result<SessionLease, BrowserError> {
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a release in between is not lost.
            notified.as_mut().enable();

            match self.next_step(profile) {
                Step::Ready(session) => {
                    return Ok(SessionLease {
                        inner: Arc::clone(&self.inner),
                        profile: profile.to_string(),
                        session,
                    });
                }
                Step::Launch => return self.launch(profile).await,
                Step::Evict(victim, session) => {
                    self.close_all(vec![(victim, session)]).await;
                }
                Step::Wait => {
                    debug!("pool at capacity, waiting for a release");
                    notified.await;
                }
            }
        }
    }

    fn next_step(&self, profile: &str) -> Step {
        let mut slots = self.inner.lock();

        if let Some(slot) = slots.get_mut(profile) {
            return match &slot.state {
                SlotState::Live(session) => {
                    let session = Arc::clone(session);
                    slot.ref_count += 1;
                    slot.idle_since = None;
                    Step::Ready(session)
                }
                SlotState::Launching | SlotState::Closing => Step::Wait,
            };
        }

        if slots.len() < self.inner.config.max_sessions {
            slots.insert(
                profile.to_string(),
                Slot {
                    state: SlotState::Launching,
                    ref_count: 1,
                    created_at: Instant::now(),
                    idle_since: None,
                },
            );
            return Step::Launch;
        }

        // At the ceiling: evict the longest-idle unreferenced session.
        let victim = slots
            .iter()
            .filter(|(_, slot)| slot.is_idle())
            .min_by_key(|(_, slot)| (slot.idle_since, slot.created_at))
            .map(|(key, _)| key.clone());
        let Some(key) = victim else {
            return Step::Wait;
        };

        match slots.get_mut(&key).and_then(Slot::begin_close) {
            Some(session) => {
                info!(evicted = %key, "evicting idle browser session at pool ceiling");
                Step::Evict(key, session)
            }
            None => Step::Wait,
        }
    }

    async fn launch(&self, profile: &str) -> Result<SessionLease, BrowserError> {
        let reservation = LaunchReservation {
            inner: self.inner.as_ref(),
            profile,
            armed: true,
        };
        info!(profile, "launching browser session");
        let session = self.inner.launcher.launch(profile).await?;
        reservation.complete(&session);

        Ok(SessionLease {
            inner: Arc::clone(&self.inner),
            profile: profile.to_string(),
            session,
        })
    }

    /// Closes each session on its own task and waits for all of them.
    ///
    /// The slots stay in the map as `Closing` until their browser is shut
    /// down, so a cancelled caller cannot let the pool overshoot its ceiling.
    async fn close_all(&self, closing: Vec<(String, Arc<dyn BrowserSession>)>) {
        let tasks: Vec<JoinHandle<()>> = closing
            .into_iter()
            .map(|(profile, session)| {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    session.close().await;
                    inner.release_slot(&profile, |state| matches!(state, SlotState::Closing));
                })
            })
            .collect();

        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "browser close task failed");
            }
        }
    }

    /// Takes every unreferenced session matching `expired` out of service.
    fn begin_close_where(
        &self,
        expired: impl Fn(&Slot) -> bool,
    ) -> Vec<(String, Arc<dyn BrowserSession>)> {
        let mut slots = self.inner.lock();
        slots
            .iter_mut()
            .filter(|(_, slot)| slot.is_idle() && expired(&**slot))
            .filter_map(|(key, slot)| Some((key.clone(), slot.begin_close()?)))
            .collect()
    }

    /// Closes sessions unreferenced for at least `idle_timeout`.
    ///
    /// Returns how many were closed.
    pub async fn sweep_idle(&self) -> usize {
        let timeout = self.inner.config.idle_timeout;
        let expired = self
            .begin_close_where(|slot| slot.idle_since.is_some_and(|since| since.elapsed() >= timeout));

        for (profile, _) in &expired {
            info!(profile, "closing idle browser session");
        }
        let closed = expired.len();
        self.close_all(expired).await;
        closed
    }

    /// Runs [`Self::sweep_idle`] every `sweep_interval` until aborted.
    #[must_use]
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.inner.config.sweep_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let closed = pool.sweep_idle().await;
                debug!(closed, "idle sweep finished");
            }
        })
    }

    /// Closes every session that has no holders.
    pub async fn shutdown(&self) {
        let idle = self.begin_close_where(|_| true);
        self.close_all(idle).await;

        let remaining = self.live_count();
        if remaining > 0 {
            warn!(remaining, "browser sessions still leased at shutdown");
        }
    }
}

/// A counted reference to a pooled session; dropping it releases the count.
pub struct SessionLease {
    inner: Arc<Inner>,
    profile: String,
    session: Arc<dyn BrowserSession>,
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

impl SessionLease {
    #[must_use]
    pub fn session(&self) -> &Arc<dyn BrowserSession> {
        &self.session
    }

    #[must_use]
    pub fn profile(&self) -> &str {
        &self.profile
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        {
            let mut slots = self.inner.lock();
            if let Some(slot) = slots.get_mut(&self.profile) {
                slot.ref_count = slot.ref_count.saturating_sub(1);
                if slot.ref_count == 0 {
                    slot.idle_since = Some(Instant::now());
                }
            }
        }
        self.inner.released.notify_waiters();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Counters {
        launched: AtomicUsize,
        live: AtomicUsize,
        peak: AtomicUsize,
        closed: AtomicUsize,
    }

    struct FakeSession {
        counters: Arc<Counters>,
        close_delay: Duration,
    }

    #[async_trait]
    impl BrowserSession for FakeSession {
        async fn capture_request(
            &self,
            url: &str,
            _pattern: &Regex,
            _wait: Duration,
        ) -> Result<String, BrowserError> {
            Ok(format!("{url}#captured"))
        }

        async fn close(&self) {
            tokio::time::sleep(self.close_delay).await;
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeLauncher {
        counters: Arc<Counters>,
        fail: bool,
        launch_delay: Duration,
        close_delay: Duration,
    }

    impl FakeLauncher {
        fn new(counters: Arc<Counters>) -> Self {
            Self {
                counters,
                fail: false,
                launch_delay: Duration::from_millis(5),
                close_delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl SessionLauncher for FakeLauncher {
        async fn launch(&self, profile: &str) -> Result<Arc<dyn BrowserSession>, BrowserError> {
            tokio::time::sleep(self.launch_delay).await;
            if self.fail {
                return Err(BrowserError::Launch {
                    profile: profile.to_string(),
                    reason: "no chrome".to_string(),
                });
            }
            self.counters.launched.fetch_add(1, Ordering::SeqCst);
            let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.peak.fetch_max(live, Ordering::SeqCst);
            Ok(Arc::new(FakeSession {
                counters: Arc::clone(&self.counters),
                close_delay: self.close_delay,
            }))
        }
    }

    fn pool(max_sessions: usize) -> (SessionPool, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let launcher = FakeLauncher::new(Arc::clone(&counters));
        (pool_with(max_sessions, launcher), counters)
    }

    fn pool_with(max_sessions: usize, launcher: FakeLauncher) -> SessionPool {
        let config = PoolConfig {
            max_sessions,
            idle_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(300),
        };
        SessionPool::new(Arc::new(launcher), config)
    }

    #[tokio::test]
    async fn test_same_profile_shares_one_session() {
        let (pool, counters) = pool(3);

        let a = pool.acquire("p1").await.unwrap();
        let b = pool.acquire("p1").await.unwrap();

        assert_eq!(counters.launched.load(Ordering::SeqCst), 1);
        assert_eq!(pool.ref_count("p1"), Some(2));
        drop(a);
        assert_eq!(pool.ref_count("p1"), Some(1));
        drop(b);
        assert_eq!(pool.ref_count("p1"), Some(0));
    }

    #[tokio::test]
    async fn test_concurrent_first_acquires_launch_once() {
        let (pool, counters) = pool(3);

        let (a, b) = tokio::join!(pool.acquire("p1"), pool.acquire("p1"));
        a.unwrap();
        b.unwrap();

        assert_eq!(counters.launched.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fourth_session_waits_for_release() {
        let (pool, counters) = pool(3);
        let a = pool.acquire("a").await.unwrap();
        let _b = pool.acquire("b").await.unwrap();
        let _c = pool.acquire("c").await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("d").await.map(|lease| lease.profile().to_string()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert_eq!(pool.live_count(), 3);

        drop(a);
        let profile = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(profile, "d");
        assert_eq!(pool.live_count(), 3);
        assert!(pool.ref_count("a").is_none());
        assert_eq!(counters.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_idle_session_evicted_at_ceiling() {
        let (pool, counters) = pool(1);
        drop(pool.acquire("a").await.unwrap());

        let _b = pool.acquire("b").await.unwrap();

        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
        assert!(pool.ref_count("a").is_none());
        assert_eq!(pool.ref_count("b"), Some(1));
    }

    #[tokio::test]
    async fn test_launch_failure_frees_slot() {
        let launcher = FakeLauncher {
            fail: true,
            ..FakeLauncher::new(Arc::new(Counters::default()))
        };
        let pool = pool_with(DEFAULT_MAX_SESSIONS, launcher);

        let err = pool.acquire("p").await.unwrap_err();

        assert!(matches!(err, BrowserError::Launch { .. }));
        assert_eq!(pool.live_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_launch_releases_its_slot() {
        let counters = Arc::new(Counters::default());
        let launcher = FakeLauncher {
            launch_delay: Duration::from_millis(200),
            ..FakeLauncher::new(Arc::clone(&counters))
        };
        let pool = pool_with(1, launcher);

        let cancelled = tokio::time::timeout(Duration::from_millis(20), pool.acquire("p")).await;
        assert!(cancelled.is_err());
        assert_eq!(pool.live_count(), 0);
        assert!(pool.ref_count("p").is_none());

        let again = tokio::time::timeout(Duration::from_secs(2), pool.acquire("p"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pool.ref_count("p"), Some(1));
        drop(again);

        let other = tokio::time::timeout(Duration::from_secs(2), pool.acquire("q"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(other.profile(), "q");
        assert_eq!(counters.launched.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_eviction_in_progress_still_counts_toward_ceiling() {
        let counters = Arc::new(Counters::default());
        let launcher = FakeLauncher {
            close_delay: Duration::from_millis(100),
            ..FakeLauncher::new(Arc::clone(&counters))
        };
        let pool = pool_with(1, launcher);
        drop(pool.acquire("a").await.unwrap());

        let use_once = |profile: &'static str| {
            let pool = pool.clone();
            async move {
                drop(pool.acquire(profile).await.unwrap());
            }
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(use_once("b"), use_once("c"));
        })
        .await
        .unwrap();

        assert_eq!(counters.peak.load(Ordering::SeqCst), 1);
        assert_eq!(counters.launched.load(Ordering::SeqCst), 3);
        assert_eq!(pool.live_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_evictor_still_finishes_close() {
        let counters = Arc::new(Counters::default());
        let launcher = FakeLauncher {
            close_delay: Duration::from_millis(100),
            ..FakeLauncher::new(Arc::clone(&counters))
        };
        let pool = pool_with(1, launcher);
        drop(pool.acquire("a").await.unwrap());

        let cancelled = tokio::time::timeout(Duration::from_millis(20), pool.acquire("b")).await;
        assert!(cancelled.is_err());
        assert_eq!(pool.live_count(), 1);

        let lease = tokio::time::timeout(Duration::from_secs(2), pool.acquire("b"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.profile(), "b");
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
        assert_eq!(counters.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_closes_only_expired_idle_sessions() {
        let (pool, counters) = pool(3);
        drop(pool.acquire("idle").await.unwrap());
        let _held = pool.acquire("held").await.unwrap();

        assert_eq!(pool.sweep_idle().await, 0);
        tokio::time::advance(Duration::from_secs(601)).await;
        assert_eq!(pool.sweep_idle().await, 1);

        assert!(pool.ref_count("idle").is_none());
        assert_eq!(pool.ref_count("held"), Some(1));
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_unheld_sessions() {
        let (pool, counters) = pool(3);
        drop(pool.acquire("a").await.unwrap());
        drop(pool.acquire("b").await.unwrap());

        pool.shutdown().await;

        assert_eq!(pool.live_count(), 0);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 2);
    }
}
