//! Archive backends.
//!
//! [`ArchiveBackend`] is the contract shared by every archive implementation: archive
//! change batches, answer history queries and reconstruct past configurations. The
//! rest of the system talks to `Arc<dyn ArchiveBackend>` and never to a concrete
//! backend.
//!
//! [`FileBackend`] is the file-based implementation built from a [`WriterPool`], a
//! [`HistoryReader`] and the [`IndexBuilderService`] they share.

use std::sync::Arc;

use async_trait::async_trait;
use chronolog_core::Epochstamp;

use crate::config::ArchiveConfig;
use crate::error::Result;
use crate::index_builder::IndexBuilderService;
use crate::layout::ArchiveLayout;
use crate::reader::{ConfigAtTimepoint, HistoryPoint, HistoryQuery, HistoryReader};
use crate::writer::PropertyUpdate;
use crate::writer_pool::WriterPool;

/// Write and read contract of a device property archive.
///
/// ## Implementations
///
/// - **FileBackend**: segment files with text sidecar and binary property indexes
#[async_trait]
pub trait ArchiveBackend: Send + Sync {
    /// Archive one batch of updates of a logged device, ordered by timestamp.
    ///
    /// Returns the number of lines written.
    async fn append_change(
        &self,
        device_id: &str,
        updates: Vec<PropertyUpdate>,
        user: &str,
    ) -> Result<usize>;

    /// History of one property.
    ///
    /// Fails with `NotYetIndexed` the first time a property is requested.
    async fn get_history(
        &self,
        device_id: &str,
        property: &str,
        query: HistoryQuery,
    ) -> Result<Vec<HistoryPoint>>;

    /// Configuration of a device at a past point in time.
    async fn get_config_at(&self, device_id: &str, timepoint: Epochstamp) -> Result<ConfigAtTimepoint>;
}

pub struct FileBackend {
    pool: Arc<WriterPool>,
    reader: Arc<HistoryReader>,
}

impl FileBackend {
    /// Creates the backend and starts its index builder. Requires a tokio runtime.
    pub fn new(config: ArchiveConfig) -> Self {
        let layout = ArchiveLayout::new(config.directory.clone());
        let builder = IndexBuilderService::start(layout.clone(), &config);
        tracing::info!(directory = %config.directory.display(), "File archive backend ready");
        Self {
            pool: Arc::new(WriterPool::with_builder(config, Arc::clone(&builder))),
            reader: Arc::new(HistoryReader::new(layout, builder)),
        }
    }

    /// Writer side, for the device lifecycle (`start_logging`, `complete`, ...).
    pub fn pool(&self) -> &Arc<WriterPool> {
        &self.pool
    }

    pub fn reader(&self) -> &Arc<HistoryReader> {
        &self.reader
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.pool.shutdown().await?;
        self.reader.builder().wait_idle().await;
        Ok(())
    }
}

#[async_trait]
impl ArchiveBackend for FileBackend {
    async fn append_change(
        &self,
        device_id: &str,
        updates: Vec<PropertyUpdate>,
        user: &str,
    ) -> Result<usize> {
        self.pool.append_change(device_id, updates, user).await
    }

    async fn get_history(
        &self,
        device_id: &str,
        property: &str,
        query: HistoryQuery,
    ) -> Result<Vec<HistoryPoint>> {
        let reader = Arc::clone(&self.reader);
        let device_id = device_id.to_string();
        let property = property.to_string();
        tokio::task::spawn_blocking(move || reader.property_history(&device_id, &property, &query))
            .await?
    }

    async fn get_config_at(&self, device_id: &str, timepoint: Epochstamp) -> Result<ConfigAtTimepoint> {
        let reader = Arc::clone(&self.reader);
        let device_id = device_id.to_string();
        tokio::task::spawn_blocking(move || reader.config_at(&device_id, timepoint)).await?
    }
}
