//! Resource Pool
//!
//! Owns the fixed arenas of stages and channels. Every acquisition hands out
//! a lease token that unlocks on drop, so an unwinding transfer can never
//! leave a stage or channel locked.
//!
//! # Stage availability
//!
//! ```text
//! request_stage(mode)            : mode matches, !locked, !loaded
//! request_stage_for_transfer(..) : loaded, !locked
//! acquire_stage(id)              : !locked
//! ```
//!
//! A stage that is loaded but unlocked belongs to whoever placed the plate;
//! it is only reachable through `request_stage_for_transfer` or
//! `acquire_stage`. This is why `loaded` must be committed before the
//! placing actor unlocks: otherwise another `request_stage` could claim a
//! stage that already holds a plate.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, trace};

use super::abort::AbortSignal;
use crate::transfer::SchedulerError;

/// Arena index of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageId(pub u8);

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Arena index of a channel (tip number)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u8);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of plate a stage is reserved for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageMode {
    Source,
    Destination,
    Tips,
    Undefined,
}

impl StageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageMode::Source => "SOURCE",
            StageMode::Destination => "DESTINATION",
            StageMode::Tips => "TIPS",
            StageMode::Undefined => "UNDEFINED",
        }
    }
}

impl fmt::Display for StageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Static description of one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub id: StageId,
    pub mode: StageMode,
}

/// Holder of a stage lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOwner {
    /// Plate load/unload by a scheduler or worker
    PlateHandling,
    /// In-well work by one channel
    Channel(ChannelId),
}

/// Point-in-time view of a stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSnapshot {
    pub id: StageId,
    pub mode: StageMode,
    pub locked_by: Option<StageOwner>,
    pub loaded: bool,
    pub plate: Option<String>,
}

impl StageSnapshot {
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }
}

#[derive(Debug)]
struct StageSlot {
    id: StageId,
    mode: StageMode,
    locked_by: Option<StageOwner>,
    loaded: bool,
    plate: Option<String>,
}

#[derive(Debug)]
struct ChannelSlot {
    id: ChannelId,
    locked: bool,
}

#[derive(Debug)]
struct PoolState {
    stages: Vec<StageSlot>,
    channels: Vec<ChannelSlot>,
}

impl PoolState {
    fn stage_mut(&mut self, id: StageId) -> Option<&mut StageSlot> {
        self.stages.iter_mut().find(|s| s.id == id)
    }

    fn channel_mut(&mut self, id: ChannelId) -> Option<&mut ChannelSlot> {
        self.channels.iter_mut().find(|c| c.id == id)
    }
}

/// Stage and channel broker
#[derive(Debug)]
pub struct ResourcePool {
    state: Mutex<PoolState>,
    /// Woken on every release
    released: Notify,
    acquire_timeout: Option<Duration>,
}

impl ResourcePool {
    /// Build a pool with channels numbered `1..=channel_count`.
    pub fn new(
        stages: &[StageSpec],
        channel_count: u8,
        acquire_timeout: Option<Duration>,
    ) -> Arc<Self> {
        let stages = stages
            .iter()
            .map(|spec| StageSlot {
                id: spec.id,
                mode: spec.mode,
                locked_by: None,
                loaded: false,
                plate: None,
            })
            .collect();
        let channels = (1..=channel_count)
            .map(|n| ChannelSlot {
                id: ChannelId(n),
                locked: false,
            })
            .collect();

        Arc::new(Self {
            state: Mutex::new(PoolState { stages, channels }),
            released: Notify::new(),
            acquire_timeout,
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn channel_count(&self) -> u8 {
        self.lock_state().channels.len() as u8
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.lock_state().channels.iter().map(|c| c.id).collect()
    }

    pub fn stage_ids(&self) -> Vec<StageId> {
        self.lock_state().stages.iter().map(|s| s.id).collect()
    }

    pub fn stage_snapshot(&self, id: StageId) -> Option<StageSnapshot> {
        self.lock_state()
            .stages
            .iter()
            .find(|s| s.id == id)
            .map(|s| StageSnapshot {
                id: s.id,
                mode: s.mode,
                locked_by: s.locked_by,
                loaded: s.loaded,
                plate: s.plate.clone(),
            })
    }

    pub fn channel_locked(&self, id: ChannelId) -> Option<bool> {
        self.lock_state()
            .channels
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.locked)
    }

    /// Stage currently holding the plate with this barcode
    pub fn stage_holding(&self, barcode: &str) -> Option<StageId> {
        self.lock_state()
            .stages
            .iter()
            .find(|s| s.loaded && s.plate.as_deref() == Some(barcode))
            .map(|s| s.id)
    }

    /// Lock a free stage of the requested mode for plate loading.
    pub async fn request_stage(
        self: &Arc<Self>,
        mode: StageMode,
        abort: &AbortSignal,
    ) -> Result<StageLease, SchedulerError> {
        let resource = format!("{} stage", mode);
        let id = self
            .wait_for(&resource, abort, |state| {
                let slot = state
                    .stages
                    .iter_mut()
                    .find(|s| s.mode == mode && s.locked_by.is_none() && !s.loaded)?;
                slot.locked_by = Some(StageOwner::PlateHandling);
                Some(slot.id)
            })
            .await?;

        debug!(stage = %id, mode = %mode, "Stage locked for plate handling");
        Ok(StageLease::new(self.clone(), id, StageOwner::PlateHandling))
    }

    /// Lock a specific loaded stage for in-well work by `channel`.
    pub async fn request_stage_for_transfer(
        self: &Arc<Self>,
        channel: ChannelId,
        stage: StageId,
        is_destination: bool,
        abort: &AbortSignal,
    ) -> Result<StageLease, SchedulerError> {
        let expected = if is_destination {
            StageMode::Destination
        } else {
            StageMode::Source
        };
        match self.stage_snapshot(stage) {
            None => return Err(SchedulerError::UnknownResource(format!("stage {}", stage))),
            Some(s) if s.mode != expected => {
                return Err(SchedulerError::UnknownResource(format!(
                    "stage {} is a {} stage, expected {}",
                    stage, s.mode, expected
                )));
            }
            Some(_) => {}
        }

        let owner = StageOwner::Channel(channel);
        let resource = format!("stage {} (channel {})", stage, channel);
        self.wait_for(&resource, abort, |state| {
            let slot = state.stage_mut(stage)?;
            if slot.loaded && slot.locked_by.is_none() {
                slot.locked_by = Some(owner);
                Some(())
            } else {
                None
            }
        })
        .await?;

        trace!(stage = %stage, channel = %channel, "Stage locked for transfer");
        Ok(StageLease::new(self.clone(), stage, owner))
    }

    /// Re-acquire a specific stage, loaded or not, for plate handling.
    pub async fn acquire_stage(
        self: &Arc<Self>,
        stage: StageId,
        abort: &AbortSignal,
    ) -> Result<StageLease, SchedulerError> {
        if self.stage_snapshot(stage).is_none() {
            return Err(SchedulerError::UnknownResource(format!("stage {}", stage)));
        }

        let resource = format!("stage {}", stage);
        self.wait_for(&resource, abort, |state| {
            let slot = state.stage_mut(stage)?;
            if slot.locked_by.is_none() {
                slot.locked_by = Some(StageOwner::PlateHandling);
                Some(())
            } else {
                None
            }
        })
        .await?;

        debug!(stage = %stage, "Stage re-acquired for plate handling");
        Ok(StageLease::new(self.clone(), stage, StageOwner::PlateHandling))
    }

    /// Release a stage. Commit `loaded` on the lease first.
    pub fn unlock_stage(&self, lease: StageLease) {
        lease.release();
    }

    /// Lock any free channel.
    pub async fn request_channel(
        self: &Arc<Self>,
        abort: &AbortSignal,
    ) -> Result<ChannelLease, SchedulerError> {
        let id = self
            .wait_for("channel", abort, |state| {
                let slot = state.channels.iter_mut().find(|c| !c.locked)?;
                slot.locked = true;
                Some(slot.id)
            })
            .await?;

        trace!(channel = %id, "Channel locked");
        Ok(ChannelLease {
            pool: self.clone(),
            id,
            released: false,
        })
    }

    pub fn unlock_channel(&self, lease: ChannelLease) {
        lease.release();
    }

    /// Block until `try_take` succeeds, the run aborts, or the timeout hits.
    ///
    /// The notification is armed before `try_take` runs, so a release that
    /// lands between the check and the wait is never missed.
    async fn wait_for<T>(
        &self,
        resource: &str,
        abort: &AbortSignal,
        mut try_take: impl FnMut(&mut PoolState) -> Option<T>,
    ) -> Result<T, SchedulerError> {
        let started = tokio::time::Instant::now();
        let deadline = self.acquire_timeout.map(|t| started + t);

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let taken = {
                let mut state = self.lock_state();
                try_take(&mut state)
            };
            if let Some(value) = taken {
                return Ok(value);
            }
            abort.check()?;

            tokio::select! {
                _ = &mut notified => {}
                _ = abort.aborted() => return Err(SchedulerError::Aborted),
                _ = sleep_until_deadline(deadline) => {
                    return Err(SchedulerError::AcquireTimeout {
                        resource: resource.to_string(),
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }
        }
    }

    fn release_stage(&self, id: StageId, owner: StageOwner) {
        {
            let mut state = self.lock_state();
            if let Some(slot) = state.stage_mut(id)
                && slot.locked_by == Some(owner)
            {
                slot.locked_by = None;
            }
        }
        trace!(stage = %id, ?owner, "Stage unlocked");
        self.released.notify_waiters();
    }

    fn release_channel(&self, id: ChannelId) {
        {
            let mut state = self.lock_state();
            if let Some(slot) = state.channel_mut(id) {
                slot.locked = false;
            }
        }
        trace!(channel = %id, "Channel unlocked");
        self.released.notify_waiters();
    }

    fn set_loaded(&self, id: StageId, plate: Option<&str>) {
        let mut state = self.lock_state();
        if let Some(slot) = state.stage_mut(id) {
            slot.loaded = plate.is_some();
            slot.plate = plate.map(str::to_string);
        }
    }
}

async fn sleep_until_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Exclusive hold on one stage. Unlocks on drop.
#[derive(Debug)]
pub struct StageLease {
    pool: Arc<ResourcePool>,
    id: StageId,
    owner: StageOwner,
    released: bool,
}

impl StageLease {
    fn new(pool: Arc<ResourcePool>, id: StageId, owner: StageOwner) -> Self {
        Self {
            pool,
            id,
            owner,
            released: false,
        }
    }

    pub fn id(&self) -> StageId {
        self.id
    }

    pub fn owner(&self) -> StageOwner {
        self.owner
    }

    /// Record that `barcode` now physically sits on this stage.
    pub fn mark_loaded(&mut self, barcode: &str) {
        self.pool.set_loaded(self.id, Some(barcode));
    }

    /// Record that the stage is physically empty.
    pub fn mark_unloaded(&mut self) {
        self.pool.set_loaded(self.id, None);
    }

    pub fn is_loaded(&self) -> bool {
        self.pool
            .stage_snapshot(self.id)
            .is_some_and(|s| s.loaded)
    }

    pub fn release(mut self) {
        self.released = true;
        self.pool.release_stage(self.id, self.owner);
    }
}

impl Drop for StageLease {
    fn drop(&mut self) {
        if !self.released {
            self.pool.release_stage(self.id, self.owner);
        }
    }
}

/// Exclusive hold on one channel. Unlocks on drop.
#[derive(Debug)]
pub struct ChannelLease {
    pool: Arc<ResourcePool>,
    id: ChannelId,
    released: bool,
}

impl ChannelLease {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn release(mut self) {
        self.released = true;
        self.pool.release_channel(self.id);
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        if !self.released {
            self.pool.release_channel(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool(channels: u8) -> Arc<ResourcePool> {
        ResourcePool::new(
            &[
                StageSpec {
                    id: StageId(1),
                    mode: StageMode::Destination,
                },
                StageSpec {
                    id: StageId(2),
                    mode: StageMode::Source,
                },
                StageSpec {
                    id: StageId(3),
                    mode: StageMode::Source,
                },
            ],
            channels,
            None,
        )
    }

    #[tokio::test]
    async fn test_request_stage_respects_mode() {
        let pool = pool(2);
        let abort = AbortSignal::new();

        let dest = pool.request_stage(StageMode::Destination, &abort).await.unwrap();
        assert_eq!(dest.id(), StageId(1));

        let src = pool.request_stage(StageMode::Source, &abort).await.unwrap();
        assert_eq!(src.id(), StageId(2));
        let src2 = pool.request_stage(StageMode::Source, &abort).await.unwrap();
        assert_eq!(src2.id(), StageId(3));
    }

    #[tokio::test]
    async fn test_loaded_stage_is_not_handed_out_again() {
        let pool = pool(2);
        let abort = AbortSignal::new();

        let mut lease = pool.request_stage(StageMode::Destination, &abort).await.unwrap();
        lease.mark_loaded("D1");
        pool.unlock_stage(lease);

        let snap = pool.stage_snapshot(StageId(1)).unwrap();
        assert!(snap.loaded);
        assert!(!snap.is_locked());
        assert_eq!(snap.plate.as_deref(), Some("D1"));
        assert_eq!(pool.stage_holding("D1"), Some(StageId(1)));

        let second = tokio::time::timeout(
            Duration::from_millis(50),
            pool.request_stage(StageMode::Destination, &abort),
        )
        .await;
        assert!(second.is_err(), "loaded stage must not satisfy request_stage");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_loaded_committed_before_unlock_is_visible_to_waiter() {
        let pool = pool(2);
        let abort = AbortSignal::new();

        let mut lease = pool.request_stage(StageMode::Source, &abort).await.unwrap();
        let id = lease.id();

        let waiter = {
            let pool = pool.clone();
            let abort = abort.clone();
            tokio::spawn(async move {
                let lease = pool
                    .request_stage_for_transfer(ChannelId(1), id, false, &abort)
                    .await
                    .unwrap();
                let snap = pool.stage_snapshot(lease.id()).unwrap();
                (snap.loaded, snap.locked_by)
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        lease.mark_loaded("P1");
        pool.unlock_stage(lease);

        let (loaded, owner) = waiter.await.unwrap();
        assert!(loaded);
        assert_eq!(owner, Some(StageOwner::Channel(ChannelId(1))));
    }

    #[tokio::test]
    async fn test_transfer_request_rejects_wrong_mode() {
        let pool = pool(1);
        let abort = AbortSignal::new();
        let err = pool
            .request_stage_for_transfer(ChannelId(1), StageId(1), false, &abort)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_RESOURCE");
    }

    #[tokio::test]
    async fn test_lease_drop_releases() {
        let pool = pool(1);
        let abort = AbortSignal::new();

        {
            let lease = pool.request_channel(&abort).await.unwrap();
            assert_eq!(pool.channel_locked(lease.id()), Some(true));
        }
        assert_eq!(pool.channel_locked(ChannelId(1)), Some(false));

        {
            let _stage = pool.acquire_stage(StageId(2), &abort).await.unwrap();
            assert!(pool.stage_snapshot(StageId(2)).unwrap().is_locked());
        }
        assert!(!pool.stage_snapshot(StageId(2)).unwrap().is_locked());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_channel_mutual_exclusion() {
        let pool = pool(3);
        let abort = AbortSignal::new();
        let holders: Arc<Vec<AtomicUsize>> = Arc::new((0..4).map(|_| AtomicUsize::new(0)).collect());

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..24 {
            let pool = pool.clone();
            let abort = abort.clone();
            let holders = holders.clone();
            tasks.spawn(async move {
                let lease = pool.request_channel(&abort).await.unwrap();
                let slot = &holders[lease.id().0 as usize];
                assert_eq!(slot.fetch_add(1, Ordering::SeqCst), 0, "channel double-booked");
                tokio::time::sleep(Duration::from_millis(2)).await;
                slot.fetch_sub(1, Ordering::SeqCst);
                pool.unlock_channel(lease);
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap();
        }
        for id in pool.channel_ids() {
            assert_eq!(pool.channel_locked(id), Some(false));
        }
    }

    #[tokio::test]
    async fn test_abort_interrupts_wait() {
        let pool = pool(1);
        let abort = AbortSignal::new();
        let _held = pool.request_channel(&abort).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            let abort = abort.clone();
            tokio::spawn(async move { pool.request_channel(&abort).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        abort.request_abort();

        let res = waiter.await.unwrap();
        assert!(matches!(res, Err(SchedulerError::Aborted)));
    }

    #[tokio::test]
    async fn test_acquire_timeout() {
        let pool = ResourcePool::new(
            &[StageSpec {
                id: StageId(1),
                mode: StageMode::Source,
            }],
            1,
            Some(Duration::from_millis(20)),
        );
        let abort = AbortSignal::new();
        let _held = pool.request_stage(StageMode::Source, &abort).await.unwrap();

        let err = pool
            .request_stage(StageMode::Source, &abort)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ACQUIRE_TIMEOUT");
    }
}
