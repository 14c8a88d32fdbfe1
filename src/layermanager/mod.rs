//! Content-addressed cache of extracted filesystem layers.
//!
//! Layers live at `<layers_dir>/<alg>/<digest>`. Unreferenced layers turn
//! `Cached` and join the space allocator's eviction set; a periodic sweep
//! removes cached layers whose TTL expired.

pub mod image;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::{Error, ErrorKind, Result};
use crate::oci::{OciManager, LAYER_MANIFEST_FILE};
use crate::spaceallocator::{FsPlatform, ItemRemover, Space, SpaceAllocator};
use crate::storage::LayerStorage;
use crate::types::{LayerData, LayerInfo, LayerState};

pub use image::TarGzImageHandler;

static DIGEST_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]+:[A-Fa-f0-9]+$").unwrap());

/// Fetches layer archives from remote URLs.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, url: &str, target: &Path) -> Result<()>;
}

/// Result of extracting one layer archive.
#[derive(Debug)]
pub struct InstalledLayer {
    pub path: PathBuf,
    /// Digest computed from the archive; must match the requested one.
    pub digest: String,
}

/// Extracts a layer archive into the layer tree.
#[async_trait]
pub trait ImageHandler: Send + Sync {
    async fn install_layer(&self, archive: &Path, layers_dir: &Path, layer: &LayerInfo) -> Result<InstalledLayer>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstallStatus {
    Installed,
    Error(ErrorKind),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerStatus {
    pub digest: String,
    pub status: InstallStatus,
}

#[derive(Debug, Clone)]
pub struct LayerManagerConfig {
    pub layers_dir: PathBuf,
    pub download_dir: PathBuf,
    pub ttl: Duration,
    pub limit_percent: u32,
    pub num_install_workers: usize,
}

/// Extraction target for a digest of the form `<alg>:<hex>`.
pub(crate) fn layer_extract_path(layers_dir: &Path, digest: &str) -> Result<PathBuf> {
    let (alg, hex) = digest
        .split_once(':')
        .ok_or_else(|| Error::invalid_argument(format!("bad layer digest: {digest}")))?;

    Ok(layers_dir.join(alg).join(hex))
}

fn file_uri_path(url: &str) -> Option<PathBuf> {
    url.strip_prefix("file:").map(|path| PathBuf::from(format!("/{}", path.trim_start_matches('/'))))
}

/// Removes a layer's directory and storage row on space-allocator eviction.
struct LayerRemover {
    storage: Arc<dyn LayerStorage>,
}

#[async_trait]
impl ItemRemover for LayerRemover {
    async fn remove_item(&self, id: &str) -> Result<()> {
        tracing::debug!(id, "remove layer item");

        let layer = self.storage.get_layer(id).await?;

        remove_layer(self.storage.as_ref(), &layer).await
    }
}

async fn remove_layer(storage: &dyn LayerStorage, layer: &LayerData) -> Result<()> {
    tracing::debug!(digest = %layer.layer_digest, path = %layer.path.display(), "remove layer");

    if layer.path.exists() {
        std::fs::remove_dir_all(&layer.path)?;
    }

    storage.remove_layer(&layer.layer_digest).await?;

    tracing::info!(digest = %layer.layer_digest, "layer removed");

    Ok(())
}

pub struct LayerManager {
    config: LayerManagerConfig,
    layer_allocator: Arc<SpaceAllocator>,
    download_allocator: Arc<SpaceAllocator>,
    storage: Arc<dyn LayerStorage>,
    downloader: Arc<dyn Downloader>,
    image_handler: Arc<dyn ImageHandler>,
    oci: Arc<dyn OciManager>,
    process_lock: Mutex<()>,
    sweep_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl LayerManager {
    pub async fn new(
        config: LayerManagerConfig,
        fs_platform: Arc<dyn FsPlatform>,
        storage: Arc<dyn LayerStorage>,
        downloader: Arc<dyn Downloader>,
        image_handler: Arc<dyn ImageHandler>,
        oci: Arc<dyn OciManager>,
    ) -> Result<Arc<Self>> {
        tracing::debug!(
            layers_dir = %config.layers_dir.display(),
            download_dir = %config.download_dir.display(),
            ttl = ?config.ttl,
            "initialize layer manager"
        );

        crate::tools::fs::clear_dir(&config.download_dir)?;
        std::fs::create_dir_all(&config.layers_dir)?;

        let remover: Arc<dyn ItemRemover> = Arc::new(LayerRemover { storage: Arc::clone(&storage) });

        let layer_allocator = Arc::new(
            SpaceAllocator::new(&config.layers_dir, Arc::clone(&fs_platform), config.limit_percent, Some(remover))
                .await?,
        );
        let download_allocator =
            Arc::new(SpaceAllocator::new(&config.download_dir, fs_platform, 0, None).await?);

        let manager = Arc::new(Self {
            config,
            layer_allocator,
            download_allocator,
            storage,
            downloader,
            image_handler,
            oci,
            process_lock: Mutex::new(()),
            sweep_task: parking_lot::Mutex::new(None),
        });

        manager.remove_damaged_layer_folders().await?;
        manager.set_outdated_layers().await?;
        manager.remove_outdated_layers().await?;

        Ok(manager)
    }

    /// Starts the periodic TTL sweep.
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let interval_period = self.config.ttl.max(Duration::from_secs(1));

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                interval.tick().await;

                if let Err(err) = manager.remove_outdated_layers().await {
                    tracing::error!(%err, "failed to remove outdated layers");
                }
            }
        });

        *self.sweep_task.lock() = Some(handle);
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.sweep_task.lock().take() {
            handle.abort();
        }

        let _ = self.layer_allocator.close().await;
        let _ = self.download_allocator.close().await;
    }

    pub async fn layer(&self, digest: &str) -> Result<LayerData> {
        self.storage.get_layer(digest).await
    }

    /// Reconciles the installed layer set against the desired one. Layers no
    /// longer referenced become cached; missing ones are installed on a small
    /// pool. Returns one status per desired layer.
    pub async fn process_desired_layers(&self, desired: &[LayerInfo]) -> Result<Vec<LayerStatus>> {
        let _guard = self.process_lock.lock().await;

        tracing::debug!(count = desired.len(), "process desired layers");

        let stored = self.storage.get_all_layers().await?;
        let mut to_install: Vec<LayerInfo> = desired.to_vec();

        for layer in &stored {
            let desired_entry = to_install.iter().position(|info| info.layer_digest == layer.layer_digest);

            match desired_entry {
                Some(index) => {
                    if layer.state == LayerState::Cached {
                        self.set_layer_state(layer, LayerState::Active).await?;
                    }

                    to_install.remove(index);
                }
                None if layer.state != LayerState::Cached => {
                    self.set_layer_state(layer, LayerState::Cached).await?;
                }
                None => {}
            }
        }

        let results = Arc::new(parking_lot::Mutex::new(Vec::new()));

        futures::stream::iter(to_install)
            .for_each_concurrent(self.config.num_install_workers.max(1), |layer| {
                let results = Arc::clone(&results);

                async move {
                    let status = match self.install_layer(&layer).await {
                        Ok(()) => InstallStatus::Installed,
                        Err(err) => {
                            tracing::error!(
                                id = %layer.layer_id,
                                digest = %layer.layer_digest,
                                %err,
                                "failed to install layer"
                            );

                            InstallStatus::Error(err.kind())
                        }
                    };

                    results.lock().push(LayerStatus { digest: layer.layer_digest.clone(), status });
                }
            })
            .await;

        let installed = results.lock().clone();

        // Report in desired order; already-satisfied layers count as installed.
        let statuses = desired
            .iter()
            .map(|layer| {
                installed
                    .iter()
                    .find(|status| status.digest == layer.layer_digest)
                    .cloned()
                    .unwrap_or_else(|| LayerStatus {
                        digest: layer.layer_digest.clone(),
                        status: InstallStatus::Installed,
                    })
            })
            .collect();

        tracing::debug!("desired layers processed");

        Ok(statuses)
    }

    async fn set_layer_state(&self, layer: &LayerData, state: LayerState) -> Result<()> {
        tracing::debug!(digest = %layer.layer_digest, %state, "set layer state");

        let mut updated = layer.clone();
        updated.state = state;

        self.storage.update_layer(&updated).await?;

        match state {
            LayerState::Cached => {
                self.layer_allocator
                    .add_outdated_item(&layer.layer_digest, layer.size, layer.timestamp)
                    .await
            }
            LayerState::Active => self.layer_allocator.restore_outdated_item(&layer.layer_digest).await,
        }
    }

    async fn remove_damaged_layer_folders(&self) -> Result<()> {
        tracing::debug!("remove damaged layer folders");

        let layers = self.storage.get_all_layers().await?;

        for layer in &layers {
            if !layer.path.exists() {
                tracing::warn!(path = %layer.path.display(), "layer folder does not exist");

                remove_layer(self.storage.as_ref(), layer).await?;
            }
        }

        for alg_entry in std::fs::read_dir(&self.config.layers_dir)? {
            let alg_entry = alg_entry?;

            if !alg_entry.file_type()?.is_dir() {
                continue;
            }

            for layer_entry in std::fs::read_dir(alg_entry.path())? {
                let layer_path = layer_entry?.path();

                if !layers.iter().any(|layer| layer.path == layer_path) {
                    tracing::warn!(path = %layer_path.display(), "layer missing in storage");

                    std::fs::remove_dir_all(&layer_path)?;
                }
            }
        }

        Ok(())
    }

    async fn set_outdated_layers(&self) -> Result<()> {
        for layer in self.storage.get_all_layers().await? {
            if layer.state != LayerState::Cached {
                continue;
            }

            self.layer_allocator
                .add_outdated_item(&layer.layer_digest, layer.size, layer.timestamp)
                .await?;
        }

        Ok(())
    }

    async fn remove_outdated_layers(&self) -> Result<()> {
        tracing::debug!("remove outdated layers");

        let ttl = chrono::Duration::from_std(self.config.ttl).unwrap_or(chrono::Duration::MAX);

        for layer in self.storage.get_all_layers().await? {
            if layer.state != LayerState::Cached {
                continue;
            }

            if Utc::now() < layer.timestamp + ttl {
                continue;
            }

            remove_layer(self.storage.as_ref(), &layer).await?;

            if let Err(err) = self.layer_allocator.restore_outdated_item(&layer.layer_digest).await {
                tracing::warn!(%err, "failed to drop outdated item");
            }
        }

        Ok(())
    }

    async fn install_layer(&self, layer: &LayerInfo) -> Result<()> {
        tracing::debug!(id = %layer.layer_id, digest = %layer.layer_digest, "install layer");

        if !DIGEST_RE.is_match(&layer.layer_digest) {
            return Err(Error::invalid_argument(format!("bad layer digest: {}", layer.layer_digest)));
        }

        let (archive_path, download_space) = self.fetch_archive(layer).await?;

        let unpacked_space = match self.layer_allocator.allocate(layer.size).await {
            Ok(space) => space,
            Err(err) => {
                self.cleanup_download(&archive_path, download_space).await;

                return Err(err);
            }
        };

        let result = self.extract_and_register(layer, &archive_path).await;

        match result {
            Ok(()) => {
                if let Err(err) = unpacked_space.accept().await {
                    tracing::error!(%err, "can't accept layer space");
                }

                self.cleanup_download(&archive_path, download_space).await;

                tracing::info!(id = %layer.layer_id, digest = %layer.layer_digest, "layer installed");

                Ok(())
            }
            Err(err) => {
                if let Ok(path) = layer_extract_path(&self.config.layers_dir, &layer.layer_digest) {
                    let _ = std::fs::remove_dir_all(path);
                }

                if let Err(release_err) = unpacked_space.release().await {
                    tracing::error!(err = %release_err, "can't release layer space");
                }

                self.cleanup_download(&archive_path, download_space).await;

                Err(err)
            }
        }
    }

    /// Resolves the archive to install from: `file:` URIs are used in place,
    /// anything else is downloaded into the download dir.
    async fn fetch_archive(&self, layer: &LayerInfo) -> Result<(PathBuf, Option<Space>)> {
        if let Some(path) = file_uri_path(&layer.url) {
            return Ok((path, None));
        }

        let space = self.download_allocator.allocate(layer.size).await?;
        let archive_path = self.config.download_dir.join(&layer.layer_digest);

        if let Err(err) = self.downloader.download(&layer.url, &archive_path).await {
            self.cleanup_download(&archive_path, Some(space)).await;

            return Err(err);
        }

        Ok((archive_path, Some(space)))
    }

    async fn cleanup_download(&self, archive_path: &Path, space: Option<Space>) {
        let Some(space) = space else {
            return;
        };

        let _ = std::fs::remove_file(archive_path);

        if let Err(err) = space.release().await {
            tracing::error!(%err, "can't release download space");
        }
    }

    async fn extract_and_register(&self, layer: &LayerInfo, archive_path: &Path) -> Result<()> {
        let installed = self
            .image_handler
            .install_layer(archive_path, &self.config.layers_dir, layer)
            .await?;

        if installed.digest != layer.layer_digest {
            return Err(Error::invalid_checksum(format!(
                "layer digest mismatch: expected {}, got {}",
                layer.layer_digest, installed.digest
            )));
        }

        let manifest = self.oci.load_image_manifest(&installed.path.join(LAYER_MANIFEST_FILE)).await?;

        let layer_data = LayerData {
            layer_digest: layer.layer_digest.clone(),
            layer_id: layer.layer_id.clone(),
            version: layer.version.clone(),
            path: installed.path,
            os_version: String::new(),
            size: manifest.config.size,
            state: LayerState::Active,
            timestamp: Utc::now(),
        };

        self.storage.add_layer(&layer_data).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::JsonOciManager;
    use crate::storage::SqliteStorage;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct StubFs {
        mount_point: PathBuf,
    }

    impl FsPlatform for StubFs {
        fn mount_point(&self, _path: &Path) -> Result<PathBuf> {
            Ok(self.mount_point.clone())
        }

        fn total_size(&self, _mount_point: &Path) -> Result<u64> {
            Ok(u64::MAX / 2)
        }

        fn available_size(&self, _mount_point: &Path) -> Result<u64> {
            Ok(u64::MAX / 2)
        }

        fn dir_size(&self, _path: &Path) -> Result<u64> {
            Ok(0)
        }
    }

    struct StubDownloader {
        calls: AtomicU64,
    }

    #[async_trait]
    impl Downloader for StubDownloader {
        async fn download(&self, _url: &str, target: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::fs::write(target, b"archive")?;

            Ok(())
        }
    }

    /// Extracts nothing; reports a configurable digest and writes a minimal
    /// manifest so registration can proceed.
    struct StubImageHandler {
        reported_digest: Option<String>,
    }

    #[async_trait]
    impl ImageHandler for StubImageHandler {
        async fn install_layer(
            &self,
            _archive: &Path,
            layers_dir: &Path,
            layer: &LayerInfo,
        ) -> Result<InstalledLayer> {
            let path = layer_extract_path(layers_dir, &layer.layer_digest)?;
            crate::tools::fs::clear_dir(&path)?;

            let manifest = crate::oci::ImageManifest {
                schema_version: 2,
                config: crate::oci::Descriptor {
                    media_type: String::new(),
                    digest: layer.layer_digest.clone(),
                    size: 4096,
                },
                layers: Vec::new(),
            };

            crate::tools::fs::write_file_atomic(
                &path.join(LAYER_MANIFEST_FILE),
                &serde_json::to_vec(&manifest).unwrap(),
            )?;

            Ok(InstalledLayer {
                path,
                digest: self.reported_digest.clone().unwrap_or_else(|| layer.layer_digest.clone()),
            })
        }
    }

    struct Fixture {
        manager: Arc<LayerManager>,
        storage: Arc<SqliteStorage>,
        downloads: Arc<StubDownloader>,
        dir: tempfile::TempDir,
    }

    async fn fixture(tag: &str, ttl: Duration, reported_digest: Option<String>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(SqliteStorage::open_in_memory().await.unwrap());
        let downloads = Arc::new(StubDownloader { calls: AtomicU64::new(0) });

        let config = LayerManagerConfig {
            layers_dir: dir.path().join("layers"),
            download_dir: dir.path().join("download"),
            ttl,
            limit_percent: 0,
            num_install_workers: 2,
        };

        let manager = LayerManager::new(
            config,
            Arc::new(StubFs { mount_point: PathBuf::from(format!("/mnt/layers-{tag}")) }),
            storage.clone(),
            downloads.clone(),
            Arc::new(StubImageHandler { reported_digest }),
            Arc::new(JsonOciManager),
        )
        .await
        .unwrap();

        Fixture { manager, storage, downloads, dir }
    }

    fn layer_info(digest: &str) -> LayerInfo {
        LayerInfo {
            layer_id: "layer1".to_string(),
            layer_digest: digest.to_string(),
            version: "1.0.0".to_string(),
            url: "https://example.com/layer.tar.gz".to_string(),
            sha256: Vec::new(),
            size: 4096,
        }
    }

    #[tokio::test]
    async fn install_and_cache_cycle() {
        let fixture = fixture("cycle", Duration::from_secs(3600), None).await;
        let desired = vec![layer_info("sha256:aaa111")];

        let statuses = fixture.manager.process_desired_layers(&desired).await.unwrap();
        assert_eq!(statuses[0].status, InstallStatus::Installed);

        let stored = fixture.storage.get_layer("sha256:aaa111").await.unwrap();
        assert_eq!(stored.state, LayerState::Active);
        assert!(stored.path.exists());

        // Dropped from the desired set: cached, not removed.
        fixture.manager.process_desired_layers(&[]).await.unwrap();
        let cached = fixture.storage.get_layer("sha256:aaa111").await.unwrap();
        assert_eq!(cached.state, LayerState::Cached);
        assert!(cached.path.exists());

        // Re-desired: restored to active without a second download.
        fixture.manager.process_desired_layers(&desired).await.unwrap();
        let restored = fixture.storage.get_layer("sha256:aaa111").await.unwrap();
        assert_eq!(restored.state, LayerState::Active);
        assert_eq!(fixture.downloads.calls.load(Ordering::SeqCst), 1);

        fixture.manager.stop().await;
    }

    #[tokio::test]
    async fn digest_mismatch_is_invalid_checksum() {
        let fixture = fixture("mismatch", Duration::from_secs(3600), Some("sha256:xyz".to_string())).await;

        let statuses = fixture
            .manager
            .process_desired_layers(&[layer_info("sha256:abc")])
            .await
            .unwrap();

        assert_eq!(statuses[0].status, InstallStatus::Error(ErrorKind::InvalidChecksum));

        // No row, and download/extract dirs are empty again.
        assert!(fixture.storage.get_layer("sha256:abc").await.is_err());
        assert_eq!(std::fs::read_dir(fixture.dir.path().join("download")).unwrap().count(), 0);
        assert!(!fixture.dir.path().join("layers/sha256/abc").exists());

        fixture.manager.stop().await;
    }

    #[tokio::test]
    async fn batch_continues_after_per_layer_error() {
        let fixture = fixture("batch", Duration::from_secs(3600), None).await;

        let desired = vec![layer_info("not-a-digest"), layer_info("sha256:bbb222")];
        let statuses = fixture.manager.process_desired_layers(&desired).await.unwrap();

        assert_eq!(statuses[0].status, InstallStatus::Error(ErrorKind::InvalidArgument));
        assert_eq!(statuses[1].status, InstallStatus::Installed);

        fixture.manager.stop().await;
    }

    #[tokio::test]
    async fn zero_ttl_sweeps_cached_layers_immediately() {
        let fixture = fixture("zero-ttl", Duration::ZERO, None).await;

        fixture
            .manager
            .process_desired_layers(&[layer_info("sha256:ccc333")])
            .await
            .unwrap();
        fixture.manager.process_desired_layers(&[]).await.unwrap();

        fixture.manager.remove_outdated_layers().await.unwrap();

        assert!(fixture.storage.get_layer("sha256:ccc333").await.is_err());
        assert!(!fixture.dir.path().join("layers/sha256/ccc333").exists());

        fixture.manager.stop().await;
    }

    #[tokio::test]
    async fn damage_reconciliation_on_init() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(SqliteStorage::open_in_memory().await.unwrap());

        // A row without a directory and a directory without a row.
        let orphan_row = LayerData {
            layer_digest: "sha256:gone".to_string(),
            layer_id: "gone".to_string(),
            version: "1.0.0".to_string(),
            path: dir.path().join("layers/sha256/gone"),
            os_version: String::new(),
            size: 10,
            state: LayerState::Active,
            timestamp: Utc::now(),
        };
        storage.add_layer(&orphan_row).await.unwrap();

        let stray_dir = dir.path().join("layers/sha256/stray");
        std::fs::create_dir_all(&stray_dir).unwrap();

        let config = LayerManagerConfig {
            layers_dir: dir.path().join("layers"),
            download_dir: dir.path().join("download"),
            ttl: Duration::from_secs(3600),
            limit_percent: 0,
            num_install_workers: 2,
        };

        let manager = LayerManager::new(
            config,
            Arc::new(StubFs { mount_point: PathBuf::from("/mnt/layers-damage") }),
            storage.clone(),
            Arc::new(StubDownloader { calls: AtomicU64::new(0) }),
            Arc::new(StubImageHandler { reported_digest: None }),
            Arc::new(JsonOciManager),
        )
        .await
        .unwrap();

        assert!(storage.get_layer("sha256:gone").await.is_err());
        assert!(!stray_dir.exists());

        manager.stop().await;
    }
}
