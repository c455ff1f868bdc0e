use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::stream::CacheStream;

/// Pre-cache downloads allowed to run while nothing is playing.
const IDLE_PRECACHE_CONCURRENCY: usize = 2;

struct GateState {
    active_playbacks: usize,
    running: Vec<(u64, CacheStream)>,
    next_id: u64,
}

/// Process-wide admission control putting active playback strictly ahead
/// of pre-caching. While any playback is active the pre-cache concurrency
/// is zero: new pre-cache tasks queue in [`acquire`](Self::acquire) and
/// in-flight ones are suspended (their download workers pause). When the
/// last playback ends, up to two pre-caches run and suspended ones resume.
pub struct PriorityGate {
    state: StdMutex<GateState>,
    changed: Notify,
}

impl Default for PriorityGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityGate {
    pub fn new() -> Self {
        Self {
            state: StdMutex::new(GateState {
                active_playbacks: 0,
                running: Vec::new(),
                next_id: 0,
            }),
            changed: Notify::new(),
        }
    }

    pub fn active_playbacks(&self) -> usize {
        self.state.lock().expect("gate poisoned").active_playbacks
    }

    /// The current pre-cache concurrency cap.
    pub fn precache_concurrency(&self) -> usize {
        if self.active_playbacks() > 0 {
            0
        } else {
            IDLE_PRECACHE_CONCURRENCY
        }
    }

    /// A playback started: suspend every in-flight pre-cache.
    pub async fn playback_started(&self) {
        let to_suspend = {
            let mut state = self.state.lock().expect("gate poisoned");
            state.active_playbacks += 1;
            if state.active_playbacks == 1 {
                state.running.iter().map(|(_, s)| s.clone()).collect()
            } else {
                Vec::new()
            }
        };
        if !to_suspend.is_empty() {
            info!("playback active; suspending {} pre-cache(s)", to_suspend.len());
        }
        for stream in to_suspend {
            stream.suspend().await;
        }
    }

    /// A playback ended: once none remain, resume suspended pre-caches and
    /// admit queued ones.
    pub async fn playback_finished(&self) {
        let to_resume = {
            let mut state = self.state.lock().expect("gate poisoned");
            state.active_playbacks = state.active_playbacks.saturating_sub(1);
            if state.active_playbacks == 0 {
                state.running.iter().map(|(_, s)| s.clone()).collect()
            } else {
                Vec::new()
            }
        };
        for stream in to_resume {
            stream.resume().await;
        }
        self.changed.notify_waiters();
    }

    /// Wait for a pre-cache slot and register the stream so playback can
    /// suspend it. The permit frees its slot on drop.
    pub async fn acquire(self: &Arc<Self>, stream: CacheStream) -> PrecachePermit {
        loop {
            // Register before checking, or a wake between the check and the
            // await is lost.
            let mut wait = std::pin::pin!(self.changed.notified());
            wait.as_mut().enable();
            {
                let mut state = self.state.lock().expect("gate poisoned");
                if state.active_playbacks == 0 && state.running.len() < IDLE_PRECACHE_CONCURRENCY
                {
                    let id = state.next_id;
                    state.next_id += 1;
                    state.running.push((id, stream));
                    debug!("pre-cache slot {} acquired", id);
                    return PrecachePermit {
                        gate: self.clone(),
                        id,
                    };
                }
            }
            wait.await;
        }
    }
}

/// A held pre-cache slot. Dropping it frees the slot and wakes waiters.
pub struct PrecachePermit {
    gate: Arc<PriorityGate>,
    id: u64,
}

impl Drop for PrecachePermit {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock().expect("gate poisoned");
        state.running.retain(|(id, _)| *id != self.id);
        drop(state);
        self.gate.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, StreamOptions};
    use reqwest::Client;
    use url::Url;

    async fn test_stream(dir: &std::path::Path, name: &str) -> CacheStream {
        let config = Arc::new(CacheConfig {
            cache_dir: Some(dir.to_path_buf()),
            ..Default::default()
        });
        CacheStream::open(
            Url::parse(&format!("http://example.com/{name}")).unwrap(),
            config,
            StreamOptions::new(),
            Client::new(),
        )
        .await
    }

    #[tokio::test]
    async fn concurrency_drops_to_zero_during_playback() {
        let gate = Arc::new(PriorityGate::new());
        assert_eq!(gate.precache_concurrency(), 2);

        gate.playback_started().await;
        assert_eq!(gate.precache_concurrency(), 0);
        gate.playback_started().await;
        gate.playback_finished().await;
        assert_eq!(gate.precache_concurrency(), 0);
        gate.playback_finished().await;
        assert_eq!(gate.precache_concurrency(), 2);
    }

    #[tokio::test]
    async fn acquire_blocks_while_playback_is_active() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(PriorityGate::new());

        gate.playback_started().await;

        let stream = test_stream(dir.path(), "a.mp4").await;
        let blocked = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire(stream).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        gate.playback_finished().await;
        let permit = blocked.await.unwrap();
        drop(permit);
    }

    #[tokio::test]
    async fn slots_are_limited_and_released() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(PriorityGate::new());

        let a = gate.acquire(test_stream(dir.path(), "a.mp4").await).await;
        let _b = gate.acquire(test_stream(dir.path(), "b.mp4").await).await;

        let third_stream = test_stream(dir.path(), "c.mp4").await;
        let third = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire(third_stream).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!third.is_finished());

        drop(a);
        let _c = third.await.unwrap();
    }
}
