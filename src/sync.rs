//! Explicit fences ordering display-server rendering before GPU sampling.
//!
//! Every frame that samples freshly damaged windows triggers a fence on the
//! display side and makes the GPU wait for it before the first bind. A small
//! ring of fences is recycled: after a frame, the oldest fences are finished
//! and reset so they are ready again when the ring wraps around.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace, warn};

/// Fences in the ring.
pub const FENCE_COUNT: usize = 4;

/// Fences recycled per frame.
const FENCES_PER_UPDATE: usize = if FENCE_COUNT - 1 < 2 { FENCE_COUNT - 1 } else { 2 };

pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceHandle(pub u32);

/// Pending display-server round trip started by a fence reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundtripCookie(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    Unsignaled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Signaled,
    TimedOut,
    Failed,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to create a fence: {0}")]
    Create(String),
    #[error("explicit sync is not supported by the backend")]
    Unsupported,
}

/// Fence primitives of the platform.
pub trait FenceBackend {
    fn create_fence(&mut self) -> Result<FenceHandle, SyncError>;
    /// Asks the display server to signal the fence once its queued rendering is done.
    fn trigger(&mut self, fence: FenceHandle);
    /// Makes subsequent GPU commands wait for the fence.
    fn insert_wait(&mut self, fence: FenceHandle);
    fn status(&mut self, fence: FenceHandle) -> FenceStatus;
    fn client_wait(&mut self, fence: FenceHandle, timeout: Duration) -> WaitResult;
    fn reset(&mut self, fence: FenceHandle) -> RoundtripCookie;
    fn finish_roundtrip(&mut self, cookie: RoundtripCookie);
    fn destroy_fence(&mut self, fence: FenceHandle);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Ready,
    TriggerSent,
    Waiting,
    Done,
    Resetting,
}

#[derive(Debug)]
pub struct SyncObject {
    fence: FenceHandle,
    state: SyncState,
    cookie: Option<RoundtripCookie>,
}

impl SyncObject {
    pub fn new(backend: &mut dyn FenceBackend) -> Result<Self, SyncError> {
        Ok(Self {
            fence: backend.create_fence()?,
            state: SyncState::Ready,
            cookie: None,
        })
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn fence(&self) -> FenceHandle {
        self.fence
    }

    pub fn trigger(&mut self, backend: &mut dyn FenceBackend) {
        if self.state == SyncState::Resetting {
            self.finish_resetting(backend);
        }
        if self.state != SyncState::Ready {
            debug!(fence = self.fence.0, state = ?self.state, "fence is busy, not triggering");
            return;
        }
        backend.trigger(self.fence);
        self.state = SyncState::TriggerSent;
    }

    pub fn wait(&mut self, backend: &mut dyn FenceBackend) {
        if self.state != SyncState::TriggerSent {
            return;
        }
        backend.insert_wait(self.fence);
        self.state = SyncState::Waiting;
    }

    /// Blocks until the fence signals or `timeout` passes. Returns whether it signaled.
    pub fn finish(&mut self, backend: &mut dyn FenceBackend, timeout: Duration) -> bool {
        if self.state == SyncState::Done {
            return true;
        }
        let signaled = match backend.status(self.fence) {
            FenceStatus::Signaled => true,
            FenceStatus::Unsignaled => match backend.client_wait(self.fence, timeout) {
                WaitResult::Signaled => true,
                WaitResult::TimedOut => {
                    warn!(fence = self.fence.0, ?timeout, "Timed out waiting for fence");
                    false
                }
                WaitResult::Failed => {
                    warn!(fence = self.fence.0, "Waiting for fence failed");
                    false
                }
            },
        };
        if signaled {
            self.state = SyncState::Done;
        }
        signaled
    }

    pub fn reset(&mut self, backend: &mut dyn FenceBackend) {
        if self.state != SyncState::Done {
            return;
        }
        self.cookie = Some(backend.reset(self.fence));
        self.state = SyncState::Resetting;
    }

    pub fn finish_resetting(&mut self, backend: &mut dyn FenceBackend) {
        if self.state != SyncState::Resetting {
            return;
        }
        if let Some(cookie) = self.cookie.take() {
            backend.finish_roundtrip(cookie);
        }
        self.state = SyncState::Ready;
    }

    pub fn destroy(self, backend: &mut dyn FenceBackend) {
        if let Some(cookie) = self.cookie {
            backend.finish_roundtrip(cookie);
        }
        backend.destroy_fence(self.fence);
    }
}

/// Ring of [`FENCE_COUNT`] fences used round-robin, one per frame.
#[derive(Debug)]
pub struct SyncManager {
    fences: Vec<SyncObject>,
    next: usize,
    current: Option<usize>,
    timeout: Duration,
}

impl SyncManager {
    pub fn new(backend: &mut dyn FenceBackend, timeout: Duration) -> Result<Self, SyncError> {
        let mut fences = Vec::with_capacity(FENCE_COUNT);
        for _ in 0..FENCE_COUNT {
            match SyncObject::new(backend) {
                Ok(fence) => fences.push(fence),
                Err(err) => {
                    for fence in fences {
                        fence.destroy(backend);
                    }
                    return Err(err);
                }
            }
        }
        debug!("created {FENCE_COUNT} sync fences");
        Ok(Self {
            fences,
            next: 0,
            current: None,
            timeout,
        })
    }

    pub fn next_fence(&mut self) -> &mut SyncObject {
        let index = self.next;
        self.next = (self.next + 1) % FENCE_COUNT;
        self.current = Some(index);
        &mut self.fences[index]
    }

    /// The fence handed out by the last [`SyncManager::next_fence`].
    pub fn current_fence(&mut self) -> Option<&mut SyncObject> {
        self.current.map(|index| &mut self.fences[index])
    }

    pub fn fences(&self) -> &[SyncObject] {
        &self.fences
    }

    /// Recycles the fences that will be handed out next. Returns false when a
    /// fence failed to signal in time.
    pub fn update_fences(&mut self, backend: &mut dyn FenceBackend) -> bool {
        profiling::scope!("update_fences");
        for offset in 0..FENCES_PER_UPDATE {
            let index = (self.next + offset) % FENCE_COUNT;
            let fence = &mut self.fences[index];
            trace!(index, state = ?fence.state(), "updating fence");
            match fence.state() {
                SyncState::Ready => {}
                SyncState::TriggerSent | SyncState::Waiting => {
                    if !fence.finish(backend, self.timeout) {
                        return false;
                    }
                    fence.reset(backend);
                }
                SyncState::Done => fence.reset(backend),
                SyncState::Resetting => fence.finish_resetting(backend),
            }
        }
        true
    }

    pub fn destroy(self, backend: &mut dyn FenceBackend) {
        for fence in self.fences {
            fence.destroy(backend);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessFences;

    const ALL_STATES: [SyncState; 5] = [
        SyncState::Ready,
        SyncState::TriggerSent,
        SyncState::Waiting,
        SyncState::Done,
        SyncState::Resetting,
    ];

    fn in_state(fences: &mut HeadlessFences, state: SyncState) -> SyncObject {
        let mut fence = SyncObject::new(fences).unwrap();
        match state {
            SyncState::Ready => {}
            SyncState::TriggerSent => fence.trigger(fences),
            SyncState::Waiting => {
                fence.trigger(fences);
                fence.wait(fences);
            }
            SyncState::Done => {
                fence.trigger(fences);
                assert!(fence.finish(fences, DEFAULT_FENCE_TIMEOUT));
            }
            SyncState::Resetting => {
                fence.trigger(fences);
                assert!(fence.finish(fences, DEFAULT_FENCE_TIMEOUT));
                fence.reset(fences);
            }
        }
        assert_eq!(fence.state(), state);
        fence
    }

    #[test]
    fn test_every_operation_is_defined_in_every_state() {
        type Op = fn(&mut SyncObject, &mut HeadlessFences);
        let ops: [(&str, Op); 5] = [
            ("trigger", |f, b| f.trigger(b)),
            ("wait", |f, b| f.wait(b)),
            ("finish", |f, b| {
                f.finish(b, DEFAULT_FENCE_TIMEOUT);
            }),
            ("reset", |f, b| f.reset(b)),
            ("finish_resetting", |f, b| f.finish_resetting(b)),
        ];
        let expected = |op: &str, state: SyncState| match (op, state) {
            ("trigger", SyncState::Ready | SyncState::Resetting) => SyncState::TriggerSent,
            ("wait", SyncState::TriggerSent) => SyncState::Waiting,
            ("finish", SyncState::TriggerSent | SyncState::Waiting) => SyncState::Done,
            ("reset", SyncState::Done) => SyncState::Resetting,
            ("finish_resetting", SyncState::Resetting) => SyncState::Ready,
            (_, state) => state,
        };

        for state in ALL_STATES {
            for (name, op) in ops {
                let mut backend = HeadlessFences::default();
                let mut fence = in_state(&mut backend, state);
                op(&mut fence, &mut backend);
                assert_eq!(
                    fence.state(),
                    expected(name, state),
                    "{name} from {state:?}"
                );
            }
        }
    }

    #[test]
    fn test_finish_times_out_on_stalled_fence() {
        let mut backend = HeadlessFences::default();
        let mut fence = SyncObject::new(&mut backend).unwrap();
        backend.stalled = true;
        fence.trigger(&mut backend);
        assert!(!fence.finish(&mut backend, Duration::from_millis(1)));
        assert_eq!(fence.state(), SyncState::TriggerSent);
    }

    #[test]
    fn test_manager_round_robins_and_recycles() {
        let mut backend = HeadlessFences::default();
        let mut manager = SyncManager::new(&mut backend, DEFAULT_FENCE_TIMEOUT).unwrap();
        assert_eq!(backend.live_fences(), FENCE_COUNT);

        let first = manager.next_fence().fence();
        manager.current_fence().unwrap().trigger(&mut backend);
        manager.current_fence().unwrap().wait(&mut backend);
        let second = manager.next_fence().fence();
        assert_ne!(first, second);

        // next is index 2; the triggered fence 0 is only visited once the ring wraps
        assert!(manager.update_fences(&mut backend));
        assert_eq!(manager.fences()[0].state(), SyncState::Waiting);

        manager.next_fence();
        manager.next_fence();
        assert!(manager.update_fences(&mut backend));
        assert_eq!(manager.fences()[0].state(), SyncState::Resetting);
        assert!(manager.update_fences(&mut backend));
        assert_eq!(manager.fences()[0].state(), SyncState::Ready);
        assert_eq!(manager.next_fence().fence(), first);

        manager.destroy(&mut backend);
        assert_eq!(backend.live_fences(), 0);
    }

    #[test]
    fn test_update_fails_when_a_fence_never_signals() {
        let mut backend = HeadlessFences::default();
        let mut manager = SyncManager::new(&mut backend, Duration::from_millis(1)).unwrap();
        backend.stalled = true;
        for _ in 0..FENCE_COUNT {
            manager.next_fence().trigger(&mut backend);
        }
        assert!(!manager.update_fences(&mut backend));
    }
}
