//! Built-in tar.gz layer extraction with digest computation.

use std::fs;
use std::io::Read;
use std::path::Path;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::layermanager::{layer_extract_path, ImageHandler, InstalledLayer};
use crate::oci::{Descriptor, ImageManifest, LAYER_MANIFEST_FILE};
use crate::types::LayerInfo;

const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Extracts gzip-compressed tar archives into the content-addressed layer
/// tree, computing the archive digest on the way.
pub struct TarGzImageHandler;

#[async_trait]
impl ImageHandler for TarGzImageHandler {
    async fn install_layer(&self, archive: &Path, layers_dir: &Path, layer: &LayerInfo) -> Result<InstalledLayer> {
        let archive = archive.to_path_buf();
        let target = layer_extract_path(layers_dir, &layer.layer_digest)?;

        tokio::task::spawn_blocking(move || extract(&archive, &target))
            .await
            .map_err(|err| Error::runtime(format!("extract task failed: {err}")))?
    }
}

fn extract(archive: &Path, target: &Path) -> Result<InstalledLayer> {
    let (digest, archive_size) = archive_digest(archive)?;

    crate::tools::fs::clear_dir(target)?;

    // Remove the partially-extracted tree unless we reach the end.
    let cleanup = scopeguard::guard(target.to_path_buf(), |path| {
        let _ = fs::remove_dir_all(&path);
    });

    let file = fs::File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));

    tar.unpack(target)
        .map_err(|err| Error::runtime(format!("unpack {}: {err}", archive.display())))?;

    let manifest = ImageManifest {
        schema_version: 2,
        config: Descriptor {
            media_type: LAYER_MEDIA_TYPE.to_string(),
            digest: digest.clone(),
            size: archive_size,
        },
        layers: Vec::new(),
    };

    crate::tools::fs::write_file_atomic(&target.join(LAYER_MANIFEST_FILE), &serde_json::to_vec_pretty(&manifest)?)?;

    let target = scopeguard::ScopeGuard::into_inner(cleanup);

    Ok(InstalledLayer { path: target, digest })
}

fn archive_digest(archive: &Path) -> Result<(String, u64)> {
    let mut file = fs::File::open(archive)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    let mut size = 0u64;

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }

        hasher.update(&buffer[..read]);
        size += read as u64;
    }

    let digest = hasher
        .finalize()
        .iter()
        .fold(String::with_capacity(71), |mut acc, byte| {
            use std::fmt::Write;
            let _ = write!(acc, "{byte:02x}");
            acc
        });

    Ok((format!("sha256:{digest}"), size))
}
