//! Lease lock service with background heartbeat.
//!
//! Every mutation of a lock record is a version compare-and-swap against the
//! [`LockStore`]. A clock-skew margin is applied asymmetrically: acquisition
//! treats a foreign lease as expired only once `expires_at < now - skew`,
//! while refresh requires `expires_at > now + skew`, so a holder must renew
//! comfortably before any other instance could consider the lease stale.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use sweep_core::defaults::{CLOCK_SKEW_SECS, LOCK_HEARTBEAT_SECS, LOCK_LEASE_SECS};
use sweep_core::{Error, LeaseGrant, LockRecord, LockStore, Result};

fn chrono_duration(d: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d)
        .map_err(|e| Error::Config(format!("duration {d:?} out of range: {e}")))
}

fn shifted(at: DateTime<Utc>, d: Duration, forward: bool) -> Result<DateTime<Utc>> {
    let delta = chrono_duration(d)?;
    let moved = if forward {
        at.checked_add_signed(delta)
    } else {
        at.checked_sub_signed(delta)
    };
    moved.ok_or_else(|| Error::Config(format!("duration {d:?} moves {at} out of range")))
}

/// Options for [`LockService::acquire_lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Lease length written on acquire and on every refresh.
    pub lease: Duration,
    /// Heartbeat cadence. Should be well under `lease - 2 * skew`.
    pub heartbeat_interval: Duration,
    /// Deliver a [`LockLoss`] through the lease's loss signal.
    pub notify_on_loss: bool,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(LOCK_LEASE_SECS),
            heartbeat_interval: Duration::from_secs(LOCK_HEARTBEAT_SECS),
            notify_on_loss: true,
        }
    }
}

/// Why a held lease stopped being ours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLoss {
    pub name: String,
    pub reason: String,
}

/// A held lock kept alive by a heartbeat task.
///
/// Dropping a `Lease` stops the heartbeat but does not release the record;
/// use [`LockService::release_lease`] for that.
pub struct Lease {
    name: String,
    instance_id: String,
    version: Arc<AtomicI64>,
    lost: Arc<AtomicBool>,
    stop: CancellationToken,
    heartbeat: Option<JoinHandle<()>>,
    loss_rx: Option<oneshot::Receiver<LockLoss>>,
}

impl Lease {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Latest version written by us.
    pub fn version(&self) -> i64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Whether the heartbeat observed a non-transient refresh failure.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// One-shot loss signal. `None` if not requested or already taken.
    pub fn take_loss_signal(&mut self) -> Option<oneshot::Receiver<LockLoss>> {
        self.loss_rx.take()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Lease lifecycle over a [`LockStore`].
#[derive(Clone)]
pub struct LockService {
    store: Arc<dyn LockStore>,
    skew: Duration,
}

impl LockService {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self {
            store,
            skew: Duration::from_secs(CLOCK_SKEW_SECS),
        }
    }

    /// Override the clock-skew margin.
    pub fn with_skew_margin(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    pub fn skew_margin(&self) -> Duration {
        self.skew
    }

    /// Try to take `name` for `lease`. `Ok(false)` means someone else holds it
    /// or won a concurrent race; that is never an error.
    pub async fn try_acquire_lock(
        &self,
        name: &str,
        instance_id: &str,
        lease: Duration,
    ) -> Result<bool> {
        Ok(self.try_acquire_version(name, instance_id, lease).await?.is_some())
    }

    /// Acquire and return the version we now hold.
    async fn try_acquire_version(
        &self,
        name: &str,
        instance_id: &str,
        lease: Duration,
    ) -> Result<Option<i64>> {
        let now = Utc::now();
        let safe_now = shifted(now, self.skew, false)?;
        let grant = LeaseGrant {
            owner_instance_id: instance_id.to_string(),
            acquired_at: now,
            expires_at: shifted(now, lease, true)?,
        };

        match self.store.find(name).await? {
            None => match self.store.insert(name, &grant).await {
                Ok(record) => Ok(Some(record.version)),
                Err(e) if e.is_contention() => {
                    debug!(
                        subsystem = "jobs",
                        component = "lock",
                        op = "acquire",
                        lock_name = name,
                        "Lost first-time insert race"
                    );
                    Ok(None)
                }
                Err(e) => Err(e),
            },
            Some(existing) if existing.expires_at > safe_now => {
                debug!(
                    subsystem = "jobs",
                    component = "lock",
                    op = "acquire",
                    lock_name = name,
                    holder = %existing.owner_instance_id,
                    expires_at = %existing.expires_at,
                    "Lock held by another owner"
                );
                Ok(None)
            }
            Some(existing) => {
                let taken = self
                    .store
                    .take_over(name, existing.version, safe_now, &grant)
                    .await?;
                if taken {
                    debug!(
                        subsystem = "jobs",
                        component = "lock",
                        op = "take_over",
                        lock_name = name,
                        previous_owner = %existing.owner_instance_id,
                        lock_version = existing.version + 1,
                        "Took over expired lock"
                    );
                    Ok(Some(existing.version + 1))
                } else {
                    debug!(
                        subsystem = "jobs",
                        component = "lock",
                        op = "take_over",
                        lock_name = name,
                        "Lost take-over race"
                    );
                    Ok(None)
                }
            }
        }
    }

    /// Extend our lease, classifying any failure:
    /// missing → `LockNotFound`, expired → `LockExpired`,
    /// stale version → `VersionMismatch`, new owner → `LockAlreadyAcquired`.
    pub async fn refresh_lock(
        &self,
        name: &str,
        instance_id: &str,
        lease: Duration,
        expected_version: i64,
    ) -> Result<()> {
        let now = Utc::now();
        let safe_now = shifted(now, self.skew, true)?;
        let expires_at = shifted(now, lease, true)?;

        if self
            .store
            .refresh(name, instance_id, expected_version, safe_now, expires_at)
            .await?
        {
            return Ok(());
        }

        match self.store.find(name).await? {
            None => Err(Error::LockNotFound(name.to_string())),
            Some(record) if record.expires_at <= safe_now => {
                Err(Error::LockExpired(name.to_string()))
            }
            Some(record) if record.version != expected_version => Err(Error::VersionMismatch {
                name: name.to_string(),
                expected: expected_version,
                actual: record.version,
            }),
            Some(_) => Err(Error::LockAlreadyAcquired(name.to_string())),
        }
    }

    /// Soft release: push `expires_at` into the past and bump the version.
    /// A missing record counts as already released.
    pub async fn release_lock(
        &self,
        name: &str,
        instance_id: &str,
        expected_version: i64,
    ) -> Result<()> {
        let expires_at = shifted(Utc::now(), self.skew, false)?;

        if self
            .store
            .release(name, instance_id, expected_version, expires_at)
            .await?
        {
            return Ok(());
        }

        match self.store.find(name).await? {
            None => Ok(()),
            Some(record) if record.version != expected_version => Err(Error::VersionMismatch {
                name: name.to_string(),
                expected: expected_version,
                actual: record.version,
            }),
            Some(record) if record.owner_instance_id != instance_id => {
                Err(Error::LockAlreadyAcquired(name.to_string()))
            }
            // Record changed between the update and the re-read.
            Some(record) => Err(Error::VersionMismatch {
                name: name.to_string(),
                expected: expected_version,
                actual: record.version,
            }),
        }
    }

    pub async fn get_lock_info(&self, name: &str) -> Result<LockRecord> {
        self.store
            .find(name)
            .await?
            .ok_or_else(|| Error::LockNotFound(name.to_string()))
    }

    /// Acquire `name` and keep it alive with a heartbeat task.
    ///
    /// Returns `Ok(None)` when the lock is held elsewhere.
    pub async fn acquire_lock(
        &self,
        name: &str,
        instance_id: &str,
        options: LockOptions,
    ) -> Result<Option<Lease>> {
        let Some(version) = self
            .try_acquire_version(name, instance_id, options.lease)
            .await?
        else {
            return Ok(None);
        };

        let version = Arc::new(AtomicI64::new(version));
        let lost = Arc::new(AtomicBool::new(false));
        let stop = CancellationToken::new();
        let (loss_tx, loss_rx) = if options.notify_on_loss {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let heartbeat = Heartbeat {
            service: self.clone(),
            name: name.to_string(),
            instance_id: instance_id.to_string(),
            options,
            version: version.clone(),
            lost: lost.clone(),
            stop: stop.clone(),
            loss_tx,
        };
        let handle = tokio::spawn(heartbeat.run());

        info!(
            subsystem = "jobs",
            component = "lock",
            op = "acquire",
            lock_name = name,
            instance_id,
            lock_version = version.load(Ordering::SeqCst),
            lease_secs = options.lease.as_secs(),
            "Lock acquired"
        );

        Ok(Some(Lease {
            name: name.to_string(),
            instance_id: instance_id.to_string(),
            version,
            lost,
            stop,
            heartbeat: Some(handle),
            loss_rx,
        }))
    }

    /// Stop the heartbeat and release the lock unless it was lost.
    pub async fn release_lease(&self, mut lease: Lease) -> Result<()> {
        lease.stop.cancel();
        if let Some(handle) = lease.heartbeat.take() {
            if let Err(e) = handle.await {
                warn!(
                    subsystem = "jobs",
                    component = "heartbeat",
                    lock_name = %lease.name,
                    error = %e,
                    "Heartbeat task ended abnormally"
                );
            }
        }

        if lease.is_lost() {
            debug!(
                subsystem = "jobs",
                component = "lock",
                op = "release",
                lock_name = %lease.name,
                "Lock was lost, skipping release"
            );
            return Ok(());
        }

        let version = lease.version();
        self.release_lock(&lease.name, &lease.instance_id, version)
            .await?;
        info!(
            subsystem = "jobs",
            component = "lock",
            op = "release",
            lock_name = %lease.name,
            instance_id = %lease.instance_id,
            lock_version = version + 1,
            "Lock released"
        );
        Ok(())
    }
}

struct Heartbeat {
    service: LockService,
    name: String,
    instance_id: String,
    options: LockOptions,
    version: Arc<AtomicI64>,
    lost: Arc<AtomicBool>,
    stop: CancellationToken,
    loss_tx: Option<oneshot::Sender<LockLoss>>,
}

impl Heartbeat {
    async fn run(mut self) {
        let period = self.options.heartbeat_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let expected = self.version.load(Ordering::SeqCst);
            match self
                .service
                .refresh_lock(&self.name, &self.instance_id, self.options.lease, expected)
                .await
            {
                Ok(()) => {
                    self.version.store(expected + 1, Ordering::SeqCst);
                    trace!(
                        subsystem = "jobs",
                        component = "heartbeat",
                        lock_name = %self.name,
                        lock_version = expected + 1,
                        "Lease refreshed"
                    );
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        subsystem = "jobs",
                        component = "heartbeat",
                        lock_name = %self.name,
                        error = %e,
                        "Lease refresh failed, retrying next tick"
                    );
                }
                Err(e) => {
                    self.lost.store(true, Ordering::SeqCst);
                    warn!(
                        subsystem = "jobs",
                        component = "heartbeat",
                        lock_name = %self.name,
                        instance_id = %self.instance_id,
                        error = %e,
                        "Lock lost"
                    );
                    if let Some(tx) = self.loss_tx.take() {
                        let _ = tx.send(LockLoss {
                            name: self.name.clone(),
                            reason: e.to_string(),
                        });
                    }
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sweep_db::MemoryLockStore;

    const LOCK: &str = "cleanup_jobs";

    fn service(store: &MemoryLockStore) -> LockService {
        LockService::new(Arc::new(store.clone()))
    }

    fn expired_record(owner: &str, version: i64) -> LockRecord {
        let past = Utc::now() - chrono::Duration::minutes(5);
        LockRecord {
            name: LOCK.to_string(),
            owner_instance_id: owner.to_string(),
            acquired_at: past - chrono::Duration::minutes(1),
            expires_at: past,
            version,
        }
    }

    #[tokio::test]
    async fn test_unrepresentable_lease_is_config_error() {
        let store = MemoryLockStore::new();
        let err = service(&store)
            .try_acquire_lock(LOCK, "a", Duration::from_secs(100_000_000_000_000))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err:?}");
        assert!(store.snapshot(LOCK).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_first_acquire_succeeds_exactly_once() {
        let store = MemoryLockStore::new();
        let svc = service(&store);

        let mut handles = Vec::new();
        for i in 0..16 {
            let svc = svc.clone();
            handles.push(tokio::spawn(async move {
                svc.try_acquire_lock(LOCK, &format!("i-{i}"), Duration::from_secs(60))
                    .await
            }));
        }

        let mut acquired = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                acquired += 1;
            }
        }
        assert_eq!(acquired, 1);
        assert_eq!(store.snapshot(LOCK).unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_active_lock_is_not_acquired_by_others() {
        let store = MemoryLockStore::new();
        let svc = service(&store);
        assert!(svc
            .try_acquire_lock(LOCK, "a", Duration::from_secs(60))
            .await
            .unwrap());

        for other in ["b", "c", "a"] {
            assert!(!svc
                .try_acquire_lock(LOCK, other, Duration::from_secs(60))
                .await
                .unwrap());
        }
        assert_eq!(store.snapshot(LOCK).unwrap().owner_instance_id, "a");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_expired_take_over_has_single_winner() {
        let store = MemoryLockStore::new();
        store.seed(expired_record("dead", 7));
        let svc = service(&store);

        let mut handles = Vec::new();
        for i in 0..8 {
            let svc = svc.clone();
            handles.push(tokio::spawn(async move {
                let id = format!("i-{i}");
                let won = svc
                    .try_acquire_lock(LOCK, &id, Duration::from_secs(60))
                    .await
                    .unwrap();
                (id, won)
            }));
        }

        let mut winners = Vec::new();
        for handle in handles {
            let (id, won) = handle.await.unwrap();
            if won {
                winners.push(id);
            }
        }
        assert_eq!(winners.len(), 1);
        let record = store.snapshot(LOCK).unwrap();
        assert_eq!(record.version, 8);
        assert_eq!(record.owner_instance_id, winners[0]);
    }

    #[tokio::test]
    async fn test_refresh_with_stale_version_is_mismatch() {
        let store = MemoryLockStore::new();
        let svc = service(&store);
        let lease = Duration::from_secs(60);
        assert!(svc.try_acquire_lock(LOCK, "a", lease).await.unwrap());

        svc.refresh_lock(LOCK, "a", lease, 1).await.unwrap();
        assert_eq!(store.snapshot(LOCK).unwrap().version, 2);

        let err = svc.refresh_lock(LOCK, "a", lease, 1).await.unwrap_err();
        assert!(
            matches!(err, Error::VersionMismatch { expected: 1, actual: 2, .. }),
            "got {err:?}"
        );
        assert_eq!(store.snapshot(LOCK).unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_refresh_expired_lease_is_lock_expired() {
        let store = MemoryLockStore::new();
        store.seed(expired_record("a", 3));
        let svc = service(&store);

        let err = svc
            .refresh_lock(LOCK, "a", Duration::from_secs(60), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockExpired(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_refresh_by_new_owner_is_already_acquired() {
        let store = MemoryLockStore::new();
        let svc = service(&store);
        assert!(svc
            .try_acquire_lock(LOCK, "a", Duration::from_secs(60))
            .await
            .unwrap());

        let err = svc
            .refresh_lock(LOCK, "b", Duration::from_secs(60), 1)
            .await
            .unwrap_err();
        assert!(err.is_contention(), "got {err:?}");
    }

    #[tokio::test]
    async fn test_refresh_missing_is_not_found() {
        let svc = service(&MemoryLockStore::new());
        let err = svc
            .refresh_lock(LOCK, "a", Duration::from_secs(60), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockNotFound(_)));
    }

    #[tokio::test]
    async fn test_release_by_non_owner_leaves_record_untouched() {
        let store = MemoryLockStore::new();
        let svc = service(&store);
        assert!(svc
            .try_acquire_lock(LOCK, "a", Duration::from_secs(60))
            .await
            .unwrap());
        let before = store.snapshot(LOCK).unwrap();

        let err = svc.release_lock(LOCK, "b", 1).await.unwrap_err();
        assert!(matches!(err, Error::LockAlreadyAcquired(_)), "got {err:?}");
        assert_eq!(store.snapshot(LOCK).unwrap(), before);
    }

    #[tokio::test]
    async fn test_release_with_stale_version_is_mismatch() {
        let store = MemoryLockStore::new();
        let svc = service(&store);
        assert!(svc
            .try_acquire_lock(LOCK, "a", Duration::from_secs(60))
            .await
            .unwrap());

        let err = svc.release_lock(LOCK, "a", 5).await.unwrap_err();
        assert!(matches!(err, Error::VersionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_release_missing_record_is_ok() {
        let svc = service(&MemoryLockStore::new());
        svc.release_lock(LOCK, "a", 1).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_then_reacquire_by_other_instance() {
        let store = MemoryLockStore::new();
        let svc = service(&store);
        assert!(svc
            .try_acquire_lock(LOCK, "a", Duration::from_secs(60))
            .await
            .unwrap());
        svc.release_lock(LOCK, "a", 1).await.unwrap();

        let released = store.snapshot(LOCK).unwrap();
        assert_eq!(released.version, 2);
        assert!(released.expires_at < Utc::now());

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(svc
            .try_acquire_lock(LOCK, "b", Duration::from_secs(60))
            .await
            .unwrap());
        let record = svc.get_lock_info(LOCK).await.unwrap();
        assert_eq!(record.owner_instance_id, "b");
        assert_eq!(record.version, 3);
    }

    #[tokio::test]
    async fn test_get_lock_info_missing() {
        let svc = service(&MemoryLockStore::new());
        let err = svc.get_lock_info(LOCK).await.unwrap_err();
        assert!(matches!(err, Error::LockNotFound(_)));
    }

    fn fast_options() -> LockOptions {
        LockOptions {
            lease: Duration::from_secs(5),
            heartbeat_interval: Duration::from_millis(20),
            notify_on_loss: true,
        }
    }

    #[tokio::test]
    async fn test_heartbeat_advances_version_and_release_uses_latest() {
        let store = MemoryLockStore::new();
        let svc = service(&store).with_skew_margin(Duration::from_millis(100));

        let lease = svc
            .acquire_lock(LOCK, "a", fast_options())
            .await
            .unwrap()
            .expect("lock should be free");
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(lease.version() > 1);
        assert!(!lease.is_lost());

        svc.release_lease(lease).await.unwrap();
        let record = store.snapshot(LOCK).unwrap();
        assert!(record.expires_at < Utc::now());
        assert_eq!(record.owner_instance_id, "a");
    }

    #[tokio::test]
    async fn test_heartbeat_signals_loss_when_lock_is_stolen() {
        let store = MemoryLockStore::new();
        let svc = service(&store).with_skew_margin(Duration::from_millis(100));

        let mut lease = svc
            .acquire_lock(LOCK, "a", fast_options())
            .await
            .unwrap()
            .expect("lock should be free");
        let loss = lease.take_loss_signal().expect("loss signal requested");

        let now = Utc::now();
        store.seed(LockRecord {
            name: LOCK.to_string(),
            owner_instance_id: "thief".to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(60),
            version: 100,
        });

        let signal = tokio::time::timeout(Duration::from_secs(2), loss)
            .await
            .expect("loss should be signalled")
            .expect("sender kept until loss");
        assert_eq!(signal.name, LOCK);
        assert!(lease.is_lost());

        // Not ours anymore: release is skipped and the thief keeps the lock.
        svc.release_lease(lease).await.unwrap();
        let record = store.snapshot(LOCK).unwrap();
        assert_eq!(record.owner_instance_id, "thief");
        assert_eq!(record.version, 100);
    }

    #[tokio::test]
    async fn test_acquire_lock_returns_none_when_held() {
        let store = MemoryLockStore::new();
        let svc = service(&store);
        let _held = svc
            .acquire_lock(LOCK, "a", LockOptions::default())
            .await
            .unwrap()
            .unwrap();

        assert!(svc
            .acquire_lock(LOCK, "b", LockOptions::default())
            .await
            .unwrap()
            .is_none());
    }
}
