//! Writer Pool - one serialized writer per logged device
//!
//! `WriterPool` keeps a [`DeviceWriter`] per device behind its own
//! `Arc<Mutex<DeviceWriter>>`. The mutex is the per-device strand: change batches for
//! the same device never run concurrently, while different devices proceed in
//! parallel. File I/O is blocking, so every operation takes the device's owned lock
//! and runs on `spawn_blocking`.
//!
//! ## Example Usage
//!
//! ```ignore
//! let pool = Arc::new(WriterPool::new(config));
//! pool.start_logging("SA1/MOTOR/X").await?;
//! pool.update_schema("SA1/MOTOR/X", schema, Timestamp::now()).await?;
//! pool.complete("SA1/MOTOR/X", initial_config, "operator").await?;
//!
//! let flusher = Arc::clone(&pool).start_background_flush(config.flush_interval());
//! pool.append_change("SA1/MOTOR/X", updates, "operator").await?;
//!
//! pool.shutdown().await?;
//! flusher.abort();
//! ```
//!
//! ## Thread Safety
//!
//! - The device map is an `Arc<RwLock<HashMap>>`; lookups take the read lock
//! - The periodic flush locks each device in turn, so it never interleaves with an
//!   append
//! - Writers of a pool built with [`WriterPool::with_builder`] rebuild indexes through
//!   the shared [`IndexBuilderService`]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chronolog_core::{DeviceSchema, Timestamp};
use tokio::sync::{Mutex, RwLock};
use tokio::time;

use crate::config::ArchiveConfig;
use crate::error::{Error, Result};
use crate::index_builder::IndexBuilderService;
use crate::writer::{DeviceWriter, PropertyUpdate};

/// Type alias for the writer map to reduce type complexity
type WriterMap = Arc<RwLock<HashMap<String, Arc<Mutex<DeviceWriter>>>>>;

pub struct WriterPool {
    writers: WriterMap,
    config: ArchiveConfig,
    builder: Option<Arc<IndexBuilderService>>,
}

impl WriterPool {
    pub fn new(config: ArchiveConfig) -> Self {
        Self {
            writers: Arc::new(RwLock::new(HashMap::new())),
            config,
            builder: None,
        }
    }

    /// Pool whose writers share the reader's index builder.
    pub fn with_builder(config: ArchiveConfig, builder: Arc<IndexBuilderService>) -> Self {
        Self {
            builder: Some(builder),
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    async fn get_writer(&self, device_id: &str) -> Result<Arc<Mutex<DeviceWriter>>> {
        self.writers
            .read()
            .await
            .get(device_id)
            .cloned()
            .ok_or_else(|| Error::NotLogging(device_id.to_string()))
    }

    /// Runs `f` on the device's writer on the blocking pool, holding its lock.
    async fn with_writer<F, T>(&self, device_id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut DeviceWriter) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let writer = self.get_writer(device_id).await?;
        let mut guard = writer.lock_owned().await;
        tokio::task::spawn_blocking(move || f(&mut *guard)).await?
    }

    /// Begins logging a device (NONE → STARTED).
    pub async fn start_logging(&self, device_id: &str) -> Result<()> {
        if self.writers.read().await.contains_key(device_id) {
            return Err(Error::InvalidState {
                device: device_id.to_string(),
                reason: "already logging".to_string(),
            });
        }

        let mut writer = DeviceWriter::new(device_id, &self.config);
        if let Some(builder) = &self.builder {
            writer = writer.with_builder(Arc::clone(builder));
        }
        let writer = tokio::task::spawn_blocking(move || writer.start().map(|()| writer)).await??;

        let mut writers = self.writers.write().await;
        if writers.contains_key(device_id) {
            return Err(Error::InvalidState {
                device: device_id.to_string(),
                reason: "already logging".to_string(),
            });
        }
        tracing::debug!(device = %device_id, "Registered device writer");
        writers.insert(device_id.to_string(), Arc::new(Mutex::new(writer)));
        Ok(())
    }

    pub async fn update_schema(
        &self,
        device_id: &str,
        schema: DeviceSchema,
        timestamp: Timestamp,
    ) -> Result<()> {
        self.with_writer(device_id, move |w| w.update_schema(schema, timestamp))
            .await
    }

    /// Archives the initial configuration and enables archiving (CONNECTED → COMPLETE).
    pub async fn complete(
        &self,
        device_id: &str,
        initial: Vec<PropertyUpdate>,
        user: &str,
    ) -> Result<usize> {
        let user = user.to_string();
        self.with_writer(device_id, move |w| w.complete(&initial, &user))
            .await
    }

    /// Archives one change batch. Returns the number of lines written.
    pub async fn append_change(
        &self,
        device_id: &str,
        updates: Vec<PropertyUpdate>,
        user: &str,
    ) -> Result<usize> {
        let user = user.to_string();
        self.with_writer(device_id, move |w| w.append_batch(&updates, &user))
            .await
    }

    /// Writes the `-LOG` marker and forgets the device.
    pub async fn stop_logging(&self, device_id: &str) -> Result<()> {
        let writer = self
            .writers
            .write()
            .await
            .remove(device_id)
            .ok_or_else(|| Error::NotLogging(device_id.to_string()))?;
        let mut guard = writer.lock_owned().await;
        tokio::task::spawn_blocking(move || guard.stop()).await?
    }

    /// Flushes every device, logging failures and carrying on with the rest.
    pub async fn flush_all(&self) -> Result<()> {
        let writers: Vec<(String, Arc<Mutex<DeviceWriter>>)> = self
            .writers
            .read()
            .await
            .iter()
            .map(|(id, w)| (id.clone(), Arc::clone(w)))
            .collect();

        let mut flush_count = 0;
        let mut error_count = 0;
        for (device_id, writer) in writers {
            let mut guard = writer.lock_owned().await;
            match tokio::task::spawn_blocking(move || guard.flush()).await? {
                Ok(()) => flush_count += 1,
                Err(e) => {
                    error_count += 1;
                    tracing::error!(device = %device_id, error = %e, "Failed to flush device writer");
                }
            }
        }

        if error_count > 0 {
            tracing::warn!(flushed = flush_count, errors = error_count, "Flush completed with errors");
        } else {
            tracing::trace!(flushed = flush_count, "Flush completed");
        }
        Ok(())
    }

    /// Spawns a task flushing all writers every `interval`.
    pub fn start_background_flush(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if let Err(e) = self.flush_all().await {
                    tracing::error!(error = %e, "Background flush failed");
                }
            }
        })
    }

    /// Latest device timestamp seen per logged device.
    pub async fn last_updates(&self) -> Vec<(String, Option<Timestamp>)> {
        let writers: Vec<(String, Arc<Mutex<DeviceWriter>>)> = self
            .writers
            .read()
            .await
            .iter()
            .map(|(id, w)| (id.clone(), Arc::clone(w)))
            .collect();
        let mut result = Vec::with_capacity(writers.len());
        for (device_id, writer) in writers {
            let last = writer.lock().await.last_update();
            result.push((device_id, last));
        }
        result.sort_by(|a, b| a.0.cmp(&b.0));
        result
    }

    pub async fn is_logging(&self, device_id: &str) -> bool {
        self.writers.read().await.contains_key(device_id)
    }

    pub async fn writer_count(&self) -> usize {
        self.writers.read().await.len()
    }

    /// Stops logging every device.
    pub async fn shutdown(&self) -> Result<()> {
        let writers: Vec<(String, Arc<Mutex<DeviceWriter>>)> =
            self.writers.write().await.drain().collect();
        tracing::info!(writer_count = writers.len(), "Shutting down writer pool");

        for (device_id, writer) in writers {
            let mut guard = writer.lock_owned().await;
            if let Err(e) = tokio::task::spawn_blocking(move || guard.stop()).await? {
                tracing::error!(device = %device_id, error = %e, "Failed to stop device writer");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronolog_core::{PropertyDescriptor, Value, ValueType};
    use tempfile::TempDir;

    fn schema() -> DeviceSchema {
        DeviceSchema::new("Sensor").with_property("temp", PropertyDescriptor::new(ValueType::Double))
    }

    async fn logging_pool(dir: &TempDir, devices: &[&str]) -> WriterPool {
        let pool = WriterPool::new(ArchiveConfig::with_directory(dir.path()));
        for device in devices {
            pool.start_logging(device).await.unwrap();
            pool.update_schema(device, schema(), Timestamp::from_secs(1.0))
                .await
                .unwrap();
            pool.complete(device, vec![], "op").await.unwrap();
        }
        pool
    }

    #[tokio::test]
    async fn test_unknown_device_is_not_logging() {
        let dir = TempDir::new().unwrap();
        let pool = WriterPool::new(ArchiveConfig::with_directory(dir.path()));
        let result = pool.append_change("nobody", vec![], "op").await;
        assert!(matches!(result, Err(Error::NotLogging(_))));
        assert!(matches!(pool.stop_logging("nobody").await, Err(Error::NotLogging(_))));
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let dir = TempDir::new().unwrap();
        let pool = logging_pool(&dir, &["a"]).await;
        assert!(matches!(
            pool.start_logging("a").await,
            Err(Error::InvalidState { .. })
        ));
        assert_eq!(pool.writer_count().await, 1);
    }

    #[tokio::test]
    async fn test_flush_makes_lines_visible() {
        let dir = TempDir::new().unwrap();
        let pool = logging_pool(&dir, &["a", "b"]).await;
        for (device, secs) in [("a", 10.0), ("b", 20.0)] {
            let update = PropertyUpdate::new("temp", Timestamp::from_secs(secs), Value::Double(secs));
            assert_eq!(pool.append_change(device, vec![update], "op").await.unwrap(), 1);
        }
        pool.flush_all().await.unwrap();

        let layout = crate::layout::ArchiveLayout::new(dir.path());
        for device in ["a", "b"] {
            let content = std::fs::read_to_string(layout.segment(device, 0)).unwrap();
            assert_eq!(content.lines().count(), 1);
        }

        let last = pool.last_updates().await;
        assert_eq!(last.len(), 2);
        assert_eq!(last[0].0, "a");
        assert_eq!(last[0].1.unwrap().epoch.seconds, 10);
    }

    #[tokio::test]
    async fn test_shutdown_stops_all_devices() {
        let dir = TempDir::new().unwrap();
        let pool = logging_pool(&dir, &["a"]).await;
        let update = PropertyUpdate::new("temp", Timestamp::from_secs(10.0), Value::Double(1.0));
        pool.append_change("a", vec![update], "op").await.unwrap();
        pool.shutdown().await.unwrap();
        assert_eq!(pool.writer_count().await, 0);

        let layout = crate::layout::ArchiveLayout::new(dir.path());
        let index = std::fs::read_to_string(layout.segment_index("a")).unwrap();
        assert!(index.lines().last().unwrap().starts_with("-LOG"));
    }
}
