//! Index Builder Service
//!
//! Background service re-deriving property index files from their segments. History
//! readers request builds the first time a property is queried and return right away;
//! the builds run later on a single worker, so at most one build touches the disk at
//! any time.
//!
//! ## Architecture
//!
//! ```text
//! request_build(dev, prop, seg)
//!        │
//!        ├── key already in flight? ──► no-op (false)
//!        │
//!        ▼
//!   bounded mpsc queue ──► worker task ──► spawn_blocking(build_property_index)
//!                                  │
//!                                  └── key removed, idle waiters woken
//! ```
//!
//! The service is constructed explicitly and shared through `Arc`; dropping the last
//! handle aborts the worker.
//!
//! Archive writers rebuild the segments they close through
//! [`build_blocking`](IndexBuilderService::build_blocking). It shares a build lock with
//! the worker, so a rebuild from a stale read can never be renamed over a newer one.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ArchiveConfig;
use crate::error::Result;
use crate::layout::ArchiveLayout;
use crate::property_index::build_property_index;

/// Identifies one property index file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildKey {
    pub device: String,
    pub property: String,
    pub segment: u32,
}

impl BuildKey {
    pub fn new(device: impl Into<String>, property: impl Into<String>, segment: u32) -> Self {
        Self {
            device: device.into(),
            property: property.into(),
            segment,
        }
    }
}

type InFlight = Arc<Mutex<HashSet<BuildKey>>>;

fn lock(in_flight: &InFlight) -> MutexGuard<'_, HashSet<BuildKey>> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs one build while holding `build_lock`.
fn locked_build(build_lock: &Mutex<()>, layout: &ArchiveLayout, key: &BuildKey) -> Result<usize> {
    let _guard = build_lock.lock().unwrap_or_else(PoisonError::into_inner);
    build_property_index(layout, &key.device, &key.property, key.segment)
}

pub struct IndexBuilderService {
    layout: ArchiveLayout,
    sender: mpsc::Sender<BuildKey>,
    in_flight: InFlight,
    build_lock: Arc<Mutex<()>>,
    idle: Arc<Notify>,
    worker: JoinHandle<()>,
}

impl IndexBuilderService {
    /// Spawns the worker. Must be called from within a tokio runtime.
    pub fn start(layout: ArchiveLayout, config: &ArchiveConfig) -> Arc<Self> {
        let (sender, mut receiver) = mpsc::channel::<BuildKey>(config.builder_queue_capacity.max(1));
        let in_flight: InFlight = Arc::new(Mutex::new(HashSet::new()));
        let idle = Arc::new(Notify::new());
        let build_lock = Arc::new(Mutex::new(()));

        let worker_layout = layout.clone();
        let worker_lock = Arc::clone(&build_lock);
        let worker_in_flight = Arc::clone(&in_flight);
        let worker_idle = Arc::clone(&idle);
        let worker = tokio::spawn(async move {
            while let Some(key) = receiver.recv().await {
                let job = key.clone();
                let job_layout = worker_layout.clone();
                let job_lock = Arc::clone(&worker_lock);
                let outcome =
                    tokio::task::spawn_blocking(move || locked_build(&job_lock, &job_layout, &job))
                        .await;

                match outcome {
                    Ok(Ok(records)) => debug!(
                        device = %key.device,
                        property = %key.property,
                        segment = key.segment,
                        records = records,
                        "Index build finished"
                    ),
                    Ok(Err(e)) => error!(
                        device = %key.device,
                        property = %key.property,
                        segment = key.segment,
                        error = %e,
                        "Index build failed"
                    ),
                    Err(e) => error!(
                        device = %key.device,
                        property = %key.property,
                        segment = key.segment,
                        error = %e,
                        "Index build task panicked"
                    ),
                }

                let idle_now = {
                    let mut keys = lock(&worker_in_flight);
                    keys.remove(&key);
                    keys.is_empty()
                };
                if idle_now {
                    worker_idle.notify_waiters();
                }
            }
            info!("Index builder stopped");
        });

        Arc::new(Self {
            layout,
            sender,
            in_flight,
            build_lock,
            idle,
            worker,
        })
    }

    /// Queues a build unless the same key is already queued or running.
    ///
    /// Returns false when the request was deduplicated or the queue is full.
    pub fn request_build(&self, device: &str, property: &str, segment: u32) -> bool {
        let key = BuildKey::new(device, property, segment);
        if !lock(&self.in_flight).insert(key.clone()) {
            debug!(device = %device, property = %property, segment = segment, "Index build already pending");
            return false;
        }

        match self.sender.try_send(key) {
            Ok(()) => true,
            Err(TrySendError::Full(key)) | Err(TrySendError::Closed(key)) => {
                warn!(
                    device = %device,
                    property = %property,
                    segment = segment,
                    "Index build queue unavailable, request dropped"
                );
                let idle_now = {
                    let mut keys = lock(&self.in_flight);
                    keys.remove(&key);
                    keys.is_empty()
                };
                if idle_now {
                    self.idle.notify_waiters();
                }
                false
            }
        }
    }

    /// Builds on the calling thread, serialized with the worker's builds.
    ///
    /// Blocks; call it from blocking contexts only.
    pub fn build_blocking(&self, device: &str, property: &str, segment: u32) -> Result<usize> {
        locked_build(&self.build_lock, &self.layout, &BuildKey::new(device, property, segment))
    }

    /// Number of builds queued or running.
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    pub fn is_pending(&self, device: &str, property: &str, segment: u32) -> bool {
        lock(&self.in_flight).contains(&BuildKey::new(device, property, segment))
    }

    /// Resolves once no build is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for IndexBuilderService {
    fn drop(&mut self) {
        self.worker.abort();
    }
}
