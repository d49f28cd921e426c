//! Model asset staging
//!
//! Model binaries and dictionaries ship in a read-only asset store addressed
//! by relative paths. Before a runtime can open them they are copied into a
//! writable cache directory. Every path is checked so nothing can be read
//! from or written outside the sandbox.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::vision::error::{OcrError, OcrResult};

/// Name of the optional digest manifest inside the asset store
pub const MANIFEST_ASSET: &str = "manifest.json";

/// Read-only bundle of model files
pub trait AssetStore: Send + Sync {
    /// Open an asset for reading
    fn open(&self, path: &str) -> std::io::Result<Box<dyn Read + Send>>;

    /// Whether an asset exists
    fn exists(&self, path: &str) -> bool;
}

/// Asset store backed by a directory on disk
#[derive(Debug, Clone)]
pub struct DirAssetStore {
    root: PathBuf,
}

impl DirAssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl AssetStore for DirAssetStore {
    fn open(&self, path: &str) -> std::io::Result<Box<dyn Read + Send>> {
        if validate_asset_path(path).is_err() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("asset path {:?} escapes the store", path),
            ));
        }
        let file = std::fs::File::open(self.root.join(path))?;
        Ok(Box::new(file))
    }

    fn exists(&self, path: &str) -> bool {
        validate_asset_path(path).is_ok() && self.root.join(path).is_file()
    }
}

/// Reject absolute paths, drive prefixes and parent-directory segments
pub fn validate_asset_path(asset_path: &str) -> OcrResult<()> {
    if asset_path.is_empty() {
        return Err(OcrError::AssetMissing("empty asset path".into()));
    }
    if asset_path.starts_with('/') || asset_path.starts_with('\\') {
        return Err(OcrError::SecurityViolation(format!(
            "absolute asset path {:?}",
            asset_path
        )));
    }

    let path = Path::new(asset_path);
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(OcrError::SecurityViolation(format!(
                    "asset path {:?} leaves the asset store",
                    asset_path
                )));
            }
        }
    }
    if asset_path.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(OcrError::SecurityViolation(format!(
            "asset path {:?} leaves the asset store",
            asset_path
        )));
    }
    Ok(())
}

/// Expected SHA-256 digests for assets, keyed by asset path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetManifest {
    #[serde(default)]
    pub files: HashMap<String, String>,
}

impl AssetManifest {
    /// Load the manifest from the store; absent means no digests are enforced
    pub fn load(store: &dyn AssetStore) -> OcrResult<Option<Self>> {
        if !store.exists(MANIFEST_ASSET) {
            return Ok(None);
        }
        let mut content = String::new();
        store
            .open(MANIFEST_ASSET)
            .and_then(|mut reader| reader.read_to_string(&mut content))
            .map_err(|e| OcrError::io(MANIFEST_ASSET, e))?;
        let manifest: AssetManifest = serde_json::from_str(&content).map_err(|e| {
            OcrError::SecurityViolation(format!("unreadable asset manifest: {}", e))
        })?;
        Ok(Some(manifest))
    }

    pub fn expected_digest(&self, asset_path: &str) -> Option<&str> {
        self.files.get(asset_path).map(String::as_str)
    }
}

/// SHA-256 of a file as lowercase hex
pub fn file_sha256(path: &Path) -> OcrResult<String> {
    let mut file = std::fs::File::open(path).map_err(|e| OcrError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|e| OcrError::io(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Stages assets from the store into the cache directory
pub struct ModelAssetResolver {
    store: Arc<dyn AssetStore>,
    cache_root: PathBuf,
    manifest: Option<AssetManifest>,
    copies: AtomicUsize,
    temp_counter: AtomicUsize,
}

impl ModelAssetResolver {
    /// Create a resolver; the cache root is created and canonicalized
    pub fn new(store: Arc<dyn AssetStore>, cache_root: &Path) -> OcrResult<Self> {
        std::fs::create_dir_all(cache_root).map_err(|e| OcrError::io(cache_root, e))?;
        let cache_root = cache_root
            .canonicalize()
            .map_err(|e| OcrError::io(cache_root, e))?;

        let manifest = match AssetManifest::load(store.as_ref()) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("Ignoring asset manifest: {}", e);
                None
            }
        };

        info!("Model cache at {:?}", cache_root);
        Ok(Self {
            store,
            cache_root,
            manifest,
            copies: AtomicUsize::new(0),
            temp_counter: AtomicUsize::new(0),
        })
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn store(&self) -> &dyn AssetStore {
        self.store.as_ref()
    }

    pub fn manifest(&self) -> Option<&AssetManifest> {
        self.manifest.as_ref()
    }

    /// Number of byte copies performed so far
    pub fn copies(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }

    /// Whether an asset could be resolved, without copying it
    pub fn is_present(&self, asset_path: &str) -> bool {
        validate_asset_path(asset_path).is_ok() && self.store.exists(asset_path)
    }

    /// Stage `asset_path` into the cache and return the cached file.
    ///
    /// An existing non-empty cached file is returned without copying.
    pub fn resolve(&self, asset_path: &str) -> OcrResult<PathBuf> {
        validate_asset_path(asset_path)?;

        let file_name = Path::new(asset_path)
            .file_name()
            .ok_or_else(|| OcrError::AssetMissing(format!("no file name in {:?}", asset_path)))?;
        let destination = self.cache_root.join(file_name);
        self.ensure_under_cache(&destination)?;

        if let Ok(metadata) = std::fs::metadata(&destination) {
            if metadata.is_file() && metadata.len() > 0 {
                debug!("Asset {} already cached at {:?}", asset_path, destination);
                return Ok(destination);
            }
        }

        if !self.store.exists(asset_path) {
            return Err(OcrError::AssetMissing(asset_path.to_string()));
        }

        self.copy_into_cache(asset_path, &destination)?;
        Ok(destination)
    }

    /// Like [`resolve`](Self::resolve) but logs and returns `None` on failure
    pub fn try_resolve(&self, asset_path: &str) -> Option<PathBuf> {
        match self.resolve(asset_path) {
            Ok(path) => Some(path),
            Err(OcrError::AssetMissing(path)) => {
                debug!("Asset {} not bundled", path);
                None
            }
            Err(e) => {
                warn!("Failed to resolve asset {}: {}", asset_path, e);
                None
            }
        }
    }

    /// Fail unless `path` canonicalizes to a location under the cache root
    pub fn ensure_under_cache(&self, path: &Path) -> OcrResult<PathBuf> {
        let canonical = if path.exists() {
            path.canonicalize().map_err(|e| OcrError::io(path, e))?
        } else {
            let parent = path
                .parent()
                .ok_or_else(|| OcrError::SecurityViolation(format!("{:?} has no parent", path)))?;
            let parent = parent.canonicalize().map_err(|e| OcrError::io(parent, e))?;
            match path.file_name() {
                Some(name) => parent.join(name),
                None => {
                    return Err(OcrError::SecurityViolation(format!(
                        "{:?} has no file name",
                        path
                    )))
                }
            }
        };

        if !canonical.starts_with(&self.cache_root) {
            return Err(OcrError::SecurityViolation(format!(
                "{:?} is outside the model cache {:?}",
                canonical, self.cache_root
            )));
        }
        Ok(canonical)
    }

    /// Check a cached file against the manifest digest, when one is listed
    pub fn verify_digest(&self, asset_path: &str, cached: &Path) -> OcrResult<()> {
        let Some(expected) = self
            .manifest
            .as_ref()
            .and_then(|m| m.expected_digest(asset_path))
        else {
            return Ok(());
        };

        let actual = file_sha256(cached)?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(OcrError::SecurityViolation(format!(
                "checksum mismatch for {}: expected {}, got {}",
                asset_path, expected, actual
            )));
        }
        debug!("Checksum verified for {}", asset_path);
        Ok(())
    }

    fn copy_into_cache(&self, asset_path: &str, destination: &Path) -> OcrResult<()> {
        let serial = self.temp_counter.fetch_add(1, Ordering::SeqCst);
        let temp_path = destination.with_extension(format!("{}.{}.tmp", std::process::id(), serial));

        let result = (|| -> OcrResult<u64> {
            let mut reader = self
                .store
                .open(asset_path)
                .map_err(|e| OcrError::io(asset_path, e))?;
            let mut file =
                std::fs::File::create(&temp_path).map_err(|e| OcrError::io(&temp_path, e))?;
            let written =
                std::io::copy(&mut reader, &mut file).map_err(|e| OcrError::io(&temp_path, e))?;
            file.flush().map_err(|e| OcrError::io(&temp_path, e))?;
            Ok(written)
        })();

        let written = match result {
            Ok(written) => written,
            Err(e) => {
                std::fs::remove_file(&temp_path).ok();
                return Err(e);
            }
        };

        // Move temp file to final location
        if let Err(e) = std::fs::rename(&temp_path, destination) {
            std::fs::remove_file(&temp_path).ok();
            return Err(OcrError::io(destination, e));
        }

        self.copies.fetch_add(1, Ordering::SeqCst);
        info!("Staged asset {} ({} bytes) to {:?}", asset_path, written, destination);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, TempDir, ModelAssetResolver) {
        let assets = TempDir::new().unwrap();
        std::fs::create_dir_all(assets.path().join("onnx")).unwrap();
        std::fs::write(assets.path().join("onnx/det.onnx"), b"detector-bytes").unwrap();
        std::fs::write(assets.path().join("secret"), b"top secret").unwrap();

        let cache = TempDir::new().unwrap();
        let store: Arc<dyn AssetStore> = Arc::new(DirAssetStore::new(assets.path()));
        let resolver = ModelAssetResolver::new(store, cache.path()).unwrap();
        (assets, cache, resolver)
    }

    #[test]
    fn test_traversal_rejected() {
        let (_assets, _cache, resolver) = setup();
        for path in ["../secret", "onnx/../../secret", "/etc/passwd", "\\windows\\system32"] {
            let result = resolver.resolve(path);
            assert!(
                matches!(result, Err(OcrError::SecurityViolation(_))),
                "{} should be rejected, got {:?}",
                path,
                result
            );
        }
        assert_eq!(resolver.copies(), 0);
    }

    #[test]
    fn test_resolve_copies_once() {
        let (_assets, _cache, resolver) = setup();

        let first = resolver.resolve("onnx/det.onnx").unwrap();
        let second = resolver.resolve("onnx/det.onnx").unwrap();

        assert_eq!(first, second);
        assert_eq!(resolver.copies(), 1);
        assert!(first.starts_with(resolver.cache_root()));
        assert_eq!(std::fs::read(&first).unwrap(), b"detector-bytes");
    }

    #[test]
    fn test_empty_cached_file_is_recopied() {
        let (_assets, _cache, resolver) = setup();
        std::fs::write(resolver.cache_root().join("det.onnx"), b"").unwrap();

        let path = resolver.resolve("onnx/det.onnx").unwrap();
        assert_eq!(resolver.copies(), 1);
        assert_eq!(std::fs::read(path).unwrap(), b"detector-bytes");
    }

    #[test]
    fn test_missing_asset_is_absent() {
        let (_assets, _cache, resolver) = setup();
        assert!(matches!(
            resolver.resolve("onnx/rec.onnx"),
            Err(OcrError::AssetMissing(_))
        ));
        assert!(resolver.try_resolve("onnx/rec.onnx").is_none());
        assert!(!resolver.is_present("onnx/rec.onnx"));
        assert!(resolver.is_present("onnx/det.onnx"));
    }

    #[test]
    fn test_ensure_under_cache() {
        let (assets, _cache, resolver) = setup();
        assert!(resolver
            .ensure_under_cache(&resolver.cache_root().join("x.onnx"))
            .is_ok());
        assert!(matches!(
            resolver.ensure_under_cache(&assets.path().join("secret")),
            Err(OcrError::SecurityViolation(_))
        ));
    }

    #[test]
    fn test_manifest_digest_enforced() {
        let assets = TempDir::new().unwrap();
        std::fs::write(assets.path().join("rec.onnx"), b"abc").unwrap();
        // sha256("abc")
        let manifest = r#"{"files": {
            "rec.onnx": "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
            "det.onnx": "0000000000000000000000000000000000000000000000000000000000000000"
        }}"#;
        std::fs::write(assets.path().join(MANIFEST_ASSET), manifest).unwrap();
        std::fs::write(assets.path().join("det.onnx"), b"tampered").unwrap();

        let cache = TempDir::new().unwrap();
        let resolver =
            ModelAssetResolver::new(Arc::new(DirAssetStore::new(assets.path())), cache.path()).unwrap();

        let rec = resolver.resolve("rec.onnx").unwrap();
        assert!(resolver.verify_digest("rec.onnx", &rec).is_ok());

        let det = resolver.resolve("det.onnx").unwrap();
        assert!(matches!(
            resolver.verify_digest("det.onnx", &det),
            Err(OcrError::SecurityViolation(_))
        ));
    }
}
