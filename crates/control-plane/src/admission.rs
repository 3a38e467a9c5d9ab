use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::api::RateLimitSettings;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::config::AdmissionConfig;
use crate::persistence::bans::{self, BanOrigin, NewBan};
use crate::persistence::{self as db, settings as settings_store};
use crate::rate_limit::RateLimitDecision;

const AUTO_BAN_REASON: &str = "rate limit violations exceeded";

/// Fixed-window rate limiter that escalates repeat offenders to a ban.
///
/// Per-client counters and the ban cache live in memory; the durable ban
/// table is the source of truth. Whenever the cache says "banned", the
/// verdict is re-checked against the store before it is treated as final, so
/// an operator lifting a ban there takes effect without a restart.
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

struct Inner {
    db: db::Db,
    settings: RwLock<RateLimitSettings>,
    counters: DashMap<String, ClientCounter>,
    ban_cache: DashMap<String, CachedBan>,
    cleanup_interval: Duration,
    last_cleanup: Mutex<Instant>,
}

#[derive(Debug, Clone, Copy)]
struct ClientCounter {
    count: u32,
    window_ends_at: Instant,
    violations: u32,
}

#[derive(Debug, Clone, Copy)]
struct CachedBan {
    expires_at: Option<Instant>,
}

impl AdmissionController {
    pub fn new(db: db::Db, config: &AdmissionConfig) -> Self {
        let settings = RateLimitSettings {
            limit: config.limit,
            window_secs: config.window_secs,
            violation_limit: config.violation_limit,
            ban_duration_secs: config.ban_duration_secs,
        };
        Self {
            inner: Arc::new(Inner {
                db,
                settings: RwLock::new(settings),
                counters: DashMap::new(),
                ban_cache: DashMap::new(),
                cleanup_interval: Duration::from_secs(config.cleanup_interval_secs),
                last_cleanup: Mutex::new(Instant::now()),
            }),
        }
    }

    pub fn current_settings(&self) -> RateLimitSettings {
        *self.inner.settings.read().expect("settings lock poisoned")
    }

    pub fn apply_settings(&self, settings: RateLimitSettings) {
        *self.inner.settings.write().expect("settings lock poisoned") = settings;
    }

    /// Full admission check for one request: window bookkeeping, auto-ban
    /// escalation (persisted durably exactly once), and reconciliation of
    /// cached ban verdicts against the durable table.
    pub async fn check(&self, client_ip: &str) -> RateLimitDecision {
        let decision = self.check_local(client_ip, Instant::now());

        if decision.newly_banned {
            let settings = self.current_settings();
            let expires_at =
                Utc::now() + ChronoDuration::seconds(settings.ban_duration_secs as i64);
            self.persist_auto_ban(client_ip, expires_at).await;
            return decision;
        }

        if decision.banned {
            match bans::is_banned(&self.inner.db, client_ip).await {
                Ok(true) => decision,
                Ok(false) => {
                    info!(ip = client_ip, "ban lifted in durable store, clearing local state");
                    self.clear_client(client_ip);
                    self.check_local(client_ip, Instant::now())
                }
                Err(err) => {
                    // Store unavailable: the local verdict stands rather than
                    // letting a possibly-banned client through.
                    warn!(ip = client_ip, ?err, "ban reconciliation failed");
                    decision
                }
            }
        } else {
            decision
        }
    }

    /// In-memory admission decision. Split out (and clocked explicitly) so
    /// the window and escalation rules are testable without a database.
    fn check_local(&self, client_ip: &str, now: Instant) -> RateLimitDecision {
        self.maybe_cleanup(now);

        if let Some(ban) = self.inner.ban_cache.get(client_ip).map(|b| *b) {
            match ban.expires_at {
                Some(expires_at) if now >= expires_at => {
                    self.inner.ban_cache.remove(client_ip);
                }
                _ => {
                    let limit = self.current_settings().limit as usize;
                    return RateLimitDecision::banned(false, limit);
                }
            }
        }

        let settings = self.current_settings();
        if settings.limit == 0 {
            // Rate limiting disabled; always admit.
            return RateLimitDecision::allowed(0, 0, Duration::ZERO);
        }
        let window = Duration::from_secs(settings.window_secs);
        let limit = settings.limit as usize;

        let mut entry = self
            .inner
            .counters
            .entry(client_ip.to_string())
            .or_insert(ClientCounter {
                count: 0,
                window_ends_at: now + window,
                violations: 0,
            });

        if entry.count == 0 || now >= entry.window_ends_at {
            // Fresh window; the violation counter deliberately survives the
            // reset so slow-burn offenders still escalate.
            entry.count = 1;
            entry.window_ends_at = now + window;
            let reset_after = window;
            return RateLimitDecision::allowed(limit, limit.saturating_sub(1), reset_after);
        }

        entry.count += 1;
        let reset_after = entry.window_ends_at.saturating_duration_since(now);

        if entry.count as usize > limit {
            entry.violations += 1;
            if entry.violations >= settings.violation_limit {
                drop(entry);
                self.inner.counters.remove(client_ip);
                self.inner.ban_cache.insert(
                    client_ip.to_string(),
                    CachedBan {
                        expires_at: Some(now + Duration::from_secs(settings.ban_duration_secs)),
                    },
                );
                return RateLimitDecision::banned(true, limit);
            }
            return RateLimitDecision::limited(limit, reset_after);
        }

        let remaining = limit.saturating_sub(entry.count as usize);
        RateLimitDecision::allowed(limit, remaining, reset_after)
    }

    async fn persist_auto_ban(&self, client_ip: &str, expires_at: DateTime<Utc>) {
        crate::metrics::record_auto_ban();
        let ban = NewBan {
            ip: client_ip.to_string(),
            reason: Some(AUTO_BAN_REASON.to_string()),
            source: BanOrigin::Auto,
            banned_by: Some("admission-controller".to_string()),
            expires_at: Some(expires_at),
        };
        if let Err(err) = bans::upsert_ban(&self.inner.db, ban).await {
            // The in-memory ban still denies this process; losing the durable
            // record only costs persistence across restarts.
            warn!(ip = client_ip, ?err, "failed to persist automatic ban");
        } else {
            info!(ip = client_ip, %expires_at, "client automatically banned");
        }
    }

    /// Seeds the ban cache, e.g. after an operator issues a manual ban.
    pub fn seed_ban(&self, client_ip: &str, expires_at: Option<DateTime<Utc>>) {
        let expires_at = expires_at.and_then(|at| {
            let delta = at - Utc::now();
            delta.to_std().ok().map(|d| Instant::now() + d)
        });
        self.inner
            .ban_cache
            .insert(client_ip.to_string(), CachedBan { expires_at });
    }

    /// Drops all local state for a client, typically after an unban.
    pub fn clear_client(&self, client_ip: &str) {
        self.inner.ban_cache.remove(client_ip);
        self.inner.counters.remove(client_ip);
    }

    fn maybe_cleanup(&self, now: Instant) {
        {
            let mut last = self.inner.last_cleanup.lock().expect("cleanup lock poisoned");
            if now.duration_since(*last) < self.inner.cleanup_interval {
                return;
            }
            *last = now;
        }

        self.inner.counters.retain(|_, c| now < c.window_ends_at);
        self.inner.ban_cache.retain(|_, b| match b.expires_at {
            Some(expires_at) => now < expires_at,
            None => true,
        });
    }
}

/// Best-effort hot reload of the durable rate-limit settings row. Fetch
/// failures keep the last-known values; the request pipeline never depends
/// on this loop succeeding.
pub async fn settings_refresh_loop(controller: AdmissionController, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        match settings_store::get_rate_limit_settings(&controller.inner.db).await {
            Ok(settings) => {
                if settings != controller.current_settings() {
                    info!(
                        limit = settings.limit,
                        window_secs = settings.window_secs,
                        violation_limit = settings.violation_limit,
                        "rate limit settings updated from durable store"
                    );
                }
                controller.apply_settings(settings);
            }
            Err(err) => {
                warn!(?err, "rate limit settings refresh failed, keeping last-known values");
            }
        }
    }
}

#[allow(dead_code)]
fn _assert_controller_bounds() {
    fn assert_bounds<T: Clone + Send + Sync + 'static>() {}
    assert_bounds::<AdmissionController>();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::migrations;

    async fn controller_with(limit: u32, window_secs: u64, violation_limit: u32) -> AdmissionController {
        let pool = migrations::init_pool("sqlite::memory:").await.unwrap();
        migrations::run_migrations(&pool).await.unwrap();
        let config = AdmissionConfig {
            limit,
            window_secs,
            violation_limit,
            ban_duration_secs: 3600,
            settings_refresh_secs: 60,
            cleanup_interval_secs: 300,
        };
        AdmissionController::new(pool, &config)
    }

    #[tokio::test]
    async fn requests_over_the_window_limit_are_denied() {
        let controller = controller_with(2, 60, 100).await;
        let now = Instant::now();

        assert!(controller.check_local("10.0.0.1", now).allowed);
        assert!(controller.check_local("10.0.0.1", now).allowed);

        let third = controller.check_local("10.0.0.1", now);
        assert!(!third.allowed);
        assert!(!third.banned);
        assert!(third.retry_after.is_some());
    }

    #[tokio::test]
    async fn window_expiry_resets_the_counter() {
        let controller = controller_with(2, 60, 100).await;
        let now = Instant::now();

        for _ in 0..3 {
            controller.check_local("10.0.0.1", now);
        }
        assert!(!controller.check_local("10.0.0.1", now).allowed);

        let later = now + Duration::from_secs(61);
        let fresh = controller.check_local("10.0.0.1", later);
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, 1, "new window starts from one request");
    }

    #[tokio::test]
    async fn clients_are_tracked_independently() {
        let controller = controller_with(1, 60, 100).await;
        let now = Instant::now();

        assert!(controller.check_local("10.0.0.1", now).allowed);
        assert!(!controller.check_local("10.0.0.1", now).allowed);
        assert!(controller.check_local("10.0.0.2", now).allowed);
    }

    #[tokio::test]
    async fn violation_threshold_reports_newly_banned_exactly_once() {
        let controller = controller_with(1, 60, 3).await;
        let now = Instant::now();

        // Request 1 fills the window; 2-3 are violations one and two.
        assert!(controller.check_local("10.0.0.1", now).allowed);
        assert!(!controller.check_local("10.0.0.1", now).banned);
        assert!(!controller.check_local("10.0.0.1", now).banned);

        let banning = controller.check_local("10.0.0.1", now);
        assert!(banning.banned);
        assert!(banning.newly_banned);

        let after = controller.check_local("10.0.0.1", now);
        assert!(after.banned);
        assert!(!after.newly_banned, "newly_banned reported once");
    }

    #[tokio::test]
    async fn cached_ban_expires_with_its_duration() {
        let controller = controller_with(1, 1, 1).await;
        let now = Instant::now();

        controller.check_local("10.0.0.1", now);
        let banned = controller.check_local("10.0.0.1", now);
        assert!(banned.newly_banned);

        let after_expiry = now + Duration::from_secs(3601);
        let decision = controller.check_local("10.0.0.1", after_expiry);
        assert!(decision.allowed, "expired cached ban no longer denies");
    }

    #[tokio::test]
    async fn newly_banned_is_persisted_durably() {
        let controller = controller_with(1, 60, 1).await;

        controller.check("10.0.0.9").await;
        let decision = controller.check("10.0.0.9").await;
        assert!(decision.banned && decision.newly_banned);

        assert!(bans::is_banned(&controller.inner.db, "10.0.0.9").await.unwrap());
    }

    #[tokio::test]
    async fn lifted_ban_is_honored_on_the_next_check() {
        let controller = controller_with(1, 60, 1).await;

        controller.check("10.0.0.9").await;
        assert!(controller.check("10.0.0.9").await.newly_banned);
        assert!(controller.check("10.0.0.9").await.banned);

        // Operator lifts the ban directly in the durable store.
        bans::delete_ban(&controller.inner.db, "10.0.0.9").await.unwrap();

        let decision = controller.check("10.0.0.9").await;
        assert!(decision.allowed, "durable store wins over the cache");
    }

    #[tokio::test]
    async fn zero_limit_disables_rate_limiting() {
        let controller = controller_with(0, 60, 1).await;
        let now = Instant::now();
        for _ in 0..100 {
            assert!(controller.check_local("10.0.0.1", now).allowed);
        }
    }

    #[tokio::test]
    async fn settings_can_be_hot_swapped() {
        let controller = controller_with(100, 60, 5).await;
        controller.apply_settings(RateLimitSettings {
            limit: 1,
            window_secs: 60,
            violation_limit: 5,
            ban_duration_secs: 3600,
        });

        let now = Instant::now();
        assert!(controller.check_local("10.0.0.1", now).allowed);
        assert!(!controller.check_local("10.0.0.1", now).allowed);
    }
}
