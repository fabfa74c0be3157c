//! Packager: turns a build artifact into a deterministic `tar.zst` bundle.

use async_compression::Level;
use async_compression::tokio::write::ZstdEncoder;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_tar as tar;

use crate::domain::entities::bundle::DESCRIPTOR_FILE;
use crate::domain::entities::site::site_key;
use crate::domain::entities::{BuildArtifact, DeployBundle, DeployDescriptor};
use crate::domain::errors::PackagingError;

const COMPRESSION_LEVEL: i32 = 9;

/// Commands the target host runs for every release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorTemplate {
    pub runtime_version: String,
    pub install_command: String,
    pub build_command: String,
    pub start_command: String,
}

impl Default for DescriptorTemplate {
    fn default() -> Self {
        Self {
            runtime_version: "20".to_string(),
            install_command: "npm install --omit=dev --no-audit --no-fund".to_string(),
            build_command: "npm run build".to_string(),
            start_command: "npm start".to_string(),
        }
    }
}

/// Writes bundles under `{bundle_root}/site-{id}/{sha256}.tar.zst`.
pub struct Packager {
    bundle_root: PathBuf,
    template: DescriptorTemplate,
}

impl Packager {
    pub fn new(bundle_root: impl Into<PathBuf>, template: DescriptorTemplate) -> Self {
        Self {
            bundle_root: bundle_root.into(),
            template,
        }
    }

    pub fn bundle_root(&self) -> &Path {
        &self.bundle_root
    }

    pub fn site_dir(&self, site_id: i64) -> PathBuf {
        self.bundle_root.join(site_key(site_id))
    }

    /// Packages an artifact.
    ///
    /// The descriptor is the first entry and every other file follows in
    /// sorted order with zeroed ownership and timestamps, so identical content
    /// yields a byte-identical bundle. An existing bundle with the same digest
    /// is reused.
    ///
    /// # Errors
    ///
    /// - [`PackagingError::MissingArtifact`] if the artifact directory is gone
    /// - [`PackagingError::Io`] on any read or write failure; no partial
    ///   bundle is left behind
    #[tracing::instrument(skip(self, artifact), fields(site_id = artifact.site_id))]
    pub async fn package(&self, artifact: &BuildArtifact) -> Result<DeployBundle, PackagingError> {
        if !fs::try_exists(&artifact.root).await.unwrap_or(false) {
            return Err(PackagingError::MissingArtifact(artifact.root.clone()));
        }

        let descriptor = DeployDescriptor {
            runtime_version: self.template.runtime_version.clone(),
            install_command: self.template.install_command.clone(),
            build_command: self.template.build_command.clone(),
            start_command: self.template.start_command.clone(),
            built_at: artifact.manifest.revision,
        };

        let files = collect_files(&artifact.root).await?;
        let archive = build_archive(&artifact.root, &files, &descriptor).await?;
        let compressed = compress(archive)
            .await
            .map_err(|e| PackagingError::io(&artifact.root, e))?;
        let digest = hex::encode(Sha256::digest(&compressed));

        let dir = self.site_dir(artifact.site_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| PackagingError::io(&dir, e))?;
        let path = dir.join(format!("{digest}.tar.zst"));

        if fs::try_exists(&path).await.unwrap_or(false) {
            tracing::info!(digest = %digest, "Reusing existing bundle");
        } else {
            write_atomically(&dir, &path, &compressed).await?;
            tracing::info!(
                digest = %digest,
                files = files.len(),
                size = compressed.len(),
                "Bundle written"
            );
        }

        Ok(DeployBundle {
            site_id: artifact.site_id,
            path,
            digest,
            size: compressed.len() as u64,
            descriptor,
        })
    }

    /// Deletes a bundle after transfer. Failures are logged.
    pub async fn discard(&self, bundle: &DeployBundle) {
        match fs::remove_file(&bundle.path).await {
            Ok(()) => tracing::debug!(path = %bundle.path.display(), "Bundle removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %bundle.path.display(), error = %e, "Failed to remove bundle"),
        }
    }

    /// Removes every bundle of a site. Returns whether anything existed.
    ///
    /// # Errors
    ///
    /// Returns [`PackagingError::Io`] if the directory cannot be removed.
    pub async fn cleanup(&self, site_id: i64) -> Result<bool, PackagingError> {
        let dir = self.site_dir(site_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PackagingError::io(dir, e)),
        }
    }
}

/// Lists every regular file below `root` as a sorted `/`-separated relative path.
async fn collect_files(root: &Path) -> Result<Vec<String>, PackagingError> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| PackagingError::io(&dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PackagingError::io(&dir, e))?
        {
            let path = entry.path();
            let kind = entry
                .file_type()
                .await
                .map_err(|e| PackagingError::io(&path, e))?;
            if kind.is_dir() {
                pending.push(path);
            } else if kind.is_file()
                && let Ok(relative) = path.strip_prefix(root)
            {
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if name != DESCRIPTOR_FILE {
                    files.push(name);
                }
            }
        }
    }

    files.sort();
    Ok(files)
}

fn header(size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_cksum();
    header
}

async fn build_archive(
    root: &Path,
    files: &[String],
    descriptor: &DeployDescriptor,
) -> Result<Vec<u8>, PackagingError> {
    let mut builder = tar::Builder::new(Vec::new());

    let descriptor_bytes = serde_json::to_vec_pretty(descriptor)?;
    let mut descriptor_header = header(descriptor_bytes.len() as u64);
    builder
        .append_data(&mut descriptor_header, DESCRIPTOR_FILE, descriptor_bytes.as_slice())
        .await
        .map_err(|e| PackagingError::io(root, e))?;

    for name in files {
        let path = root.join(name);
        let bytes = fs::read(&path)
            .await
            .map_err(|e| PackagingError::io(&path, e))?;
        let mut file_header = header(bytes.len() as u64);
        builder
            .append_data(&mut file_header, name, bytes.as_slice())
            .await
            .map_err(|e| PackagingError::io(&path, e))?;
    }

    builder
        .into_inner()
        .await
        .map_err(|e| PackagingError::io(root, e))
}

async fn compress(archive: Vec<u8>) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZstdEncoder::with_quality(Vec::new(), Level::Precise(COMPRESSION_LEVEL));
    encoder.write_all(&archive).await?;
    encoder.shutdown().await?;
    Ok(encoder.into_inner())
}

/// Writes to a temp file in the same directory, then renames into place.
async fn write_atomically(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), PackagingError> {
    let temp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));

    let result = async {
        fs::write(&temp, bytes).await?;
        fs::rename(&temp, path).await
    }
    .await;

    if let Err(e) = result {
        if let Err(cleanup) = fs::remove_file(&temp).await
            && cleanup.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %temp.display(), error = %cleanup, "Failed to remove temp bundle");
        }
        return Err(PackagingError::io(path, e));
    }
    Ok(())
}
