//! Filesystem storage of the local cache registry.
//!
//! Uses the same on-disk layout as the distribution filesystem driver so an
//! existing cache can be served and archived as-is:
//!
//! ```text
//! <root>/docker/registry/v2/
//! ├── blobs/sha256/<hh>/<hex>/data
//! └── repositories/<name>/
//!     ├── _layers/sha256/<hex>/link
//!     ├── _manifests/revisions/sha256/<hex>/link
//!     ├── _manifests/tags/<tag>/current/link
//!     └── _uploads/<uuid>/data
//! ```

use std::path::{Path, PathBuf};

use a3s_mirror_core::error::{MirrorError, Result};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

/// Prefix of the registry tree below the storage root.
pub const REGISTRY_V2_PREFIX: &str = "docker/registry/v2";

/// Media type assumed for manifests that do not declare one.
const DEFAULT_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// A manifest read back from storage.
#[derive(Debug, Clone)]
pub struct StoredManifest {
    pub digest: String,
    pub media_type: String,
    pub content: Bytes,
}

/// Filesystem-backed blob and manifest storage.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Open storage rooted at the registry `rootdirectory`.
    pub fn new(root_directory: &Path) -> Self {
        Self {
            root: root_directory.join(REGISTRY_V2_PREFIX),
        }
    }

    /// Root of the `docker/registry/v2` tree.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_data_path(&self, digest: &str) -> Result<PathBuf> {
        let hex = digest_hex(digest)?;
        Ok(self
            .root
            .join("blobs")
            .join("sha256")
            .join(&hex[..2])
            .join(hex)
            .join("data"))
    }

    fn repository_dir(&self, name: &str) -> Result<PathBuf> {
        validate_repository_name(name)?;
        Ok(self.root.join("repositories").join(name))
    }

    fn upload_path(&self, name: &str, uuid: &str) -> Result<PathBuf> {
        if uuid.is_empty() || !uuid.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
            return Err(MirrorError::Registry(format!("invalid upload id '{}'", uuid)));
        }
        Ok(self.repository_dir(name)?.join("_uploads").join(uuid).join("data"))
    }

    /// Size of a blob if it exists.
    pub async fn blob_size(&self, digest: &str) -> Option<u64> {
        let path = self.blob_data_path(digest).ok()?;
        tokio::fs::metadata(&path).await.ok().map(|m| m.len())
    }

    /// Read a blob.
    pub async fn read_blob(&self, digest: &str) -> Result<Option<Bytes>> {
        let path = self.blob_data_path(digest)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Store content as a blob and return its digest.
    async fn write_blob(&self, content: &[u8]) -> Result<String> {
        let digest = sha256_digest(content);
        let path = self.blob_data_path(&digest)?;
        if tokio::fs::metadata(&path).await.is_err() {
            write_atomic(&path, content).await?;
        }
        Ok(digest)
    }

    /// Link a blob into a repository.
    pub async fn link_blob(&self, name: &str, digest: &str) -> Result<()> {
        let hex = digest_hex(digest)?;
        let link = self
            .repository_dir(name)?
            .join("_layers")
            .join("sha256")
            .join(hex)
            .join("link");
        write_atomic(&link, digest.as_bytes()).await
    }

    /// Start a blob upload session and return its id.
    pub async fn start_upload(&self, name: &str) -> Result<String> {
        let uuid = uuid::Uuid::new_v4().to_string();
        let path = self.upload_path(name, &uuid)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::File::create(&path).await?;
        Ok(uuid)
    }

    /// Append a chunk to an upload and return the total size so far.
    ///
    /// Returns `None` when the upload session does not exist.
    pub async fn append_upload(&self, name: &str, uuid: &str, chunk: &[u8]) -> Result<Option<u64>> {
        let path = self.upload_path(name, uuid)?;
        let mut file = match tokio::fs::OpenOptions::new().append(true).open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        file.write_all(chunk).await?;
        file.flush().await?;
        Ok(Some(file.metadata().await?.len()))
    }

    /// Complete an upload, verifying the expected digest.
    ///
    /// Returns `Ok(None)` when the upload session does not exist.
    pub async fn commit_upload(
        &self,
        name: &str,
        uuid: &str,
        expected_digest: &str,
        final_chunk: &[u8],
    ) -> Result<Option<String>> {
        digest_hex(expected_digest)?;
        if self.append_upload(name, uuid, final_chunk).await?.is_none() {
            return Ok(None);
        }

        let path = self.upload_path(name, uuid)?;
        let content = tokio::fs::read(&path).await?;
        let actual = sha256_digest(&content);
        if actual != expected_digest {
            let _ = remove_upload_dir(&path).await;
            return Err(MirrorError::Image {
                image: name.to_string(),
                message: format!(
                    "digest mismatch: expected {}, computed {}",
                    expected_digest, actual
                ),
            });
        }

        self.write_blob(&content).await?;
        self.link_blob(name, &actual).await?;
        remove_upload_dir(&path).await?;
        Ok(Some(actual))
    }

    /// Store a blob uploaded in a single request.
    pub async fn put_blob(&self, name: &str, expected_digest: &str, content: &[u8]) -> Result<String> {
        digest_hex(expected_digest)?;
        let actual = sha256_digest(content);
        if actual != expected_digest {
            return Err(MirrorError::Image {
                image: name.to_string(),
                message: format!(
                    "digest mismatch: expected {}, computed {}",
                    expected_digest, actual
                ),
            });
        }
        self.write_blob(content).await?;
        self.link_blob(name, &actual).await?;
        Ok(actual)
    }

    /// Store a manifest under a tag or digest reference.
    pub async fn put_manifest(&self, name: &str, reference: &str, content: &[u8]) -> Result<String> {
        let digest = sha256_digest(content);
        if is_digest(reference) && reference != digest {
            return Err(MirrorError::Image {
                image: format!("{}@{}", name, reference),
                message: format!("manifest digest mismatch: computed {}", digest),
            });
        }

        self.write_blob(content).await?;
        let repo = self.repository_dir(name)?;
        let hex = digest_hex(&digest)?;
        write_atomic(
            &repo
                .join("_manifests")
                .join("revisions")
                .join("sha256")
                .join(hex)
                .join("link"),
            digest.as_bytes(),
        )
        .await?;

        if !is_digest(reference) {
            validate_tag(reference)?;
            write_atomic(
                &repo
                    .join("_manifests")
                    .join("tags")
                    .join(reference)
                    .join("current")
                    .join("link"),
                digest.as_bytes(),
            )
            .await?;
        }

        Ok(digest)
    }

    /// Resolve a tag or digest to a stored manifest.
    pub async fn get_manifest(&self, name: &str, reference: &str) -> Result<Option<StoredManifest>> {
        let repo = self.repository_dir(name)?;
        let digest = if is_digest(reference) {
            let link = repo
                .join("_manifests")
                .join("revisions")
                .join("sha256")
                .join(digest_hex(reference)?)
                .join("link");
            if tokio::fs::metadata(&link).await.is_err() {
                return Ok(None);
            }
            reference.to_string()
        } else {
            validate_tag(reference)?;
            let link = repo
                .join("_manifests")
                .join("tags")
                .join(reference)
                .join("current")
                .join("link");
            match tokio::fs::read_to_string(&link).await {
                Ok(digest) => digest.trim().to_string(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        };

        let Some(content) = self.read_blob(&digest).await? else {
            return Ok(None);
        };
        let media_type = manifest_media_type(&content);
        Ok(Some(StoredManifest {
            digest,
            media_type,
            content,
        }))
    }
}

/// Compute the `sha256:<hex>` digest of content.
pub fn sha256_digest(content: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(content)))
}

/// Whether a manifest reference is a digest rather than a tag.
pub fn is_digest(reference: &str) -> bool {
    reference.contains(':')
}

/// Validate a `sha256:<64 hex>` digest and return the hex part.
pub fn digest_hex(digest: &str) -> Result<&str> {
    let hex = digest
        .strip_prefix("sha256:")
        .ok_or_else(|| MirrorError::Registry(format!("unsupported digest '{}'", digest)))?;
    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
        return Err(MirrorError::Registry(format!("invalid digest '{}'", digest)));
    }
    Ok(hex)
}

/// Validate a repository name: lowercase path components separated by `/`.
pub fn validate_repository_name(name: &str) -> Result<()> {
    let valid_component = |c: &str| {
        !c.is_empty()
            && c != "."
            && c != ".."
            && !c.starts_with(['.', '_', '-'])
            && c
                .chars()
                .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '.' | '_' | '-'))
    };
    if name.is_empty() || name.len() > 255 || !name.split('/').all(valid_component) {
        return Err(MirrorError::Registry(format!("invalid repository name '{}'", name)));
    }
    Ok(())
}

fn validate_tag(tag: &str) -> Result<()> {
    let mut chars = tag.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_alphanumeric() || c == '_')
        .unwrap_or(false);
    if !first_ok
        || tag.len() > 128
        || !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(MirrorError::Registry(format!("invalid tag '{}'", tag)));
    }
    Ok(())
}

/// Read `mediaType` from a manifest, defaulting to the OCI image manifest type.
fn manifest_media_type(content: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(content)
        .ok()
        .and_then(|v| v.get("mediaType").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| DEFAULT_MANIFEST_MEDIA_TYPE.to_string())
}

/// Write a file through a temporary sibling so readers never see partial data.
async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| MirrorError::Registry(format!("invalid storage path {}", path.display())))?;
    tokio::fs::create_dir_all(parent).await?;
    let tmp = parent.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_upload_dir(data_path: &Path) -> Result<()> {
    if let Some(dir) = data_path.parent() {
        tokio::fs::remove_dir_all(dir).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MANIFEST: &str = r#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","config":{},"layers":[]}"#;

    #[tokio::test]
    async fn test_put_and_get_manifest_by_tag() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::new(tmp.path());

        let digest = storage
            .put_manifest("org/image", "v1", MANIFEST.as_bytes())
            .await
            .unwrap();
        assert_eq!(digest, sha256_digest(MANIFEST.as_bytes()));

        let stored = storage.get_manifest("org/image", "v1").await.unwrap().unwrap();
        assert_eq!(stored.digest, digest);
        assert_eq!(stored.media_type, "application/vnd.oci.image.manifest.v1+json");
        assert_eq!(stored.content, Bytes::from(MANIFEST));

        let by_digest = storage.get_manifest("org/image", &digest).await.unwrap();
        assert!(by_digest.is_some());
    }

    #[tokio::test]
    async fn test_manifest_layout_matches_distribution() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::new(tmp.path());
        let digest = storage
            .put_manifest("org/image", "v1", MANIFEST.as_bytes())
            .await
            .unwrap();
        let hex = digest_hex(&digest).unwrap();

        let v2 = tmp.path().join("docker/registry/v2");
        assert!(v2
            .join("blobs/sha256")
            .join(&hex[..2])
            .join(hex)
            .join("data")
            .exists());
        assert!(v2
            .join("repositories/org/image/_manifests/tags/v1/current/link")
            .exists());
    }

    #[tokio::test]
    async fn test_get_missing_manifest() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::new(tmp.path());
        assert!(storage.get_manifest("org/image", "v1").await.unwrap().is_none());
        let digest = sha256_digest(b"nothing");
        assert!(storage.get_manifest("org/image", &digest).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_manifest_digest_mismatch() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::new(tmp.path());
        let wrong = sha256_digest(b"other");
        assert!(storage
            .put_manifest("org/image", &wrong, MANIFEST.as_bytes())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_chunked_upload() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::new(tmp.path());
        let content = b"hello world";
        let digest = sha256_digest(content);

        let uuid = storage.start_upload("org/image").await.unwrap();
        let size = storage
            .append_upload("org/image", &uuid, &content[..5])
            .await
            .unwrap();
        assert_eq!(size, Some(5));

        let committed = storage
            .commit_upload("org/image", &uuid, &digest, &content[5..])
            .await
            .unwrap();
        assert_eq!(committed, Some(digest.clone()));
        assert_eq!(storage.blob_size(&digest).await, Some(content.len() as u64));
        assert_eq!(
            storage.read_blob(&digest).await.unwrap().unwrap(),
            Bytes::from_static(content)
        );
    }

    #[tokio::test]
    async fn test_commit_rejects_wrong_digest() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::new(tmp.path());
        let uuid = storage.start_upload("org/image").await.unwrap();
        let wrong = sha256_digest(b"something else");
        let err = storage
            .commit_upload("org/image", &uuid, &wrong, b"data")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("digest mismatch"));
        assert!(storage.blob_size(&wrong).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_upload() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::new(tmp.path());
        let id = uuid::Uuid::new_v4().to_string();
        assert_eq!(storage.append_upload("org/image", &id, b"x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_blob_monolithic() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::new(tmp.path());
        let digest = sha256_digest(b"layer");
        storage.put_blob("org/image", &digest, b"layer").await.unwrap();
        assert_eq!(storage.blob_size(&digest).await, Some(5));
    }

    #[test]
    fn test_digest_hex_validation() {
        assert!(digest_hex(&sha256_digest(b"x")).is_ok());
        assert!(digest_hex("sha512:abcd").is_err());
        assert!(digest_hex("sha256:abcd").is_err());
        assert!(digest_hex(&format!("sha256:{}", "Z".repeat(64))).is_err());
    }

    #[test]
    fn test_repository_name_validation() {
        assert!(validate_repository_name("org/image").is_ok());
        assert!(validate_repository_name("redhat/redhat-operator-index").is_ok());
        assert!(validate_repository_name("Org/Image").is_err());
        assert!(validate_repository_name("org/../etc").is_err());
        assert!(validate_repository_name("org//image").is_err());
        assert!(validate_repository_name("").is_err());
    }

    #[test]
    fn test_tag_validation() {
        assert!(validate_tag("v4.14.1-x86_64").is_ok());
        assert!(validate_tag("latest").is_ok());
        assert!(validate_tag(".hidden").is_err());
        assert!(validate_tag("").is_err());
        assert!(validate_tag("a/b").is_err());
    }
}
