//! Registry-to-registry copy over the distribution API.
//!
//! Manifests are copied byte for byte so digests are preserved. Blobs are
//! pulled into memory and pushed to the destination before the manifest that
//! references them.

use a3s_mirror_core::error::{MirrorError, Result};
use a3s_mirror_core::MultiArch;
use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{ImageIndexEntry, OciImageIndex, OciImageManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};
use reqwest::StatusCode;

use super::{CopyOptions, Mirror};
use crate::reference::ImageReference;

const OCI_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
const OCI_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

const ACCEPTED_MANIFEST_TYPES: &[&str] = &[
    OCI_IMAGE_MANIFEST,
    OCI_IMAGE_INDEX,
    DOCKER_MANIFEST_V2,
    DOCKER_MANIFEST_LIST,
];

/// Authentication credentials for a container registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Read `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`, falling back to
    /// anonymous.
    pub fn from_env() -> Self {
        let username = std::env::var("REGISTRY_USERNAME").ok();
        let password = std::env::var("REGISTRY_PASSWORD").ok();

        if username.is_some() && password.is_some() {
            Self { username, password }
        } else {
            Self::anonymous()
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// [`Mirror`] backed by `oci-distribution` for copies and `reqwest` for
/// existence checks.
pub struct OciMirror {
    auth: RegistryAuth,
    http: reqwest::Client,
    http_insecure: reqwest::Client,
}

impl OciMirror {
    pub fn new(auth: RegistryAuth) -> Result<Self> {
        let build = |accept_invalid: bool| {
            reqwest::Client::builder()
                .danger_accept_invalid_certs(accept_invalid)
                .build()
                .map_err(|e| MirrorError::Setup(format!("Failed to build HTTP client: {}", e)))
        };
        Ok(Self {
            auth,
            http: build(false)?,
            http_insecure: build(true)?,
        })
    }

    /// Registries reached over plain HTTP for this copy.
    fn plain_http_registries(src: &ImageReference, dst: &ImageReference, opts: &CopyOptions) -> Vec<String> {
        let mut registries = vec![opts.local_storage_fqdn.clone()];
        for (registry, verify) in [(&src.registry, opts.src_tls_verify), (&dst.registry, opts.dest_tls_verify)] {
            if (!verify || opts.is_local(registry)) && !registries.contains(registry) {
                registries.push(registry.clone());
            }
        }
        registries
    }

    fn client(&self, src: &ImageReference, dst: &ImageReference, opts: &CopyOptions) -> Client {
        Client::new(ClientConfig {
            protocol: ClientProtocol::HttpsExcept(Self::plain_http_registries(src, dst, opts)),
            accept_invalid_certificates: !opts.src_tls_verify || !opts.dest_tls_verify,
            ..Default::default()
        })
    }

    async fn copy_image(
        &self,
        client: &Client,
        source: &Reference,
        destination: &Reference,
        multi_arch: MultiArch,
    ) -> Result<()> {
        let auth = self.auth.to_oci_auth();
        let (raw, digest) = client
            .pull_manifest_raw(source, &auth, ACCEPTED_MANIFEST_TYPES)
            .await
            .map_err(|e| image_error(source, format!("Failed to pull manifest: {}", e)))?;
        let media_type = media_type_of(&raw);

        if !is_index(&media_type) {
            return self.copy_manifest(client, source, destination, raw, &media_type).await;
        }

        let index: OciImageIndex = serde_json::from_slice(&raw)?;
        // a digest reference can only be satisfied by the index itself
        let by_digest = destination.digest().is_some();
        if multi_arch == MultiArch::System && !by_digest {
            let child = host_platform_digest(&index.manifests).ok_or_else(|| {
                image_error(source, "no manifest for the host platform".to_string())
            })?;
            tracing::debug!(source = %source, digest = %child, "Copying host platform manifest");
            let child_source = with_digest(source, &child);
            let (child_raw, _) = client
                .pull_manifest_raw(&child_source, &auth, ACCEPTED_MANIFEST_TYPES)
                .await
                .map_err(|e| image_error(&child_source, format!("Failed to pull manifest: {}", e)))?;
            let child_type = media_type_of(&child_raw);
            return self
                .copy_manifest(client, &child_source, destination, child_raw, &child_type)
                .await;
        }

        tracing::debug!(
            source = %source,
            digest = %digest,
            manifests = index.manifests.len(),
            "Copying image index"
        );
        for entry in &index.manifests {
            let child_source = with_digest(source, &entry.digest);
            let child_destination = with_digest(destination, &entry.digest);
            let (child_raw, _) = client
                .pull_manifest_raw(&child_source, &auth, ACCEPTED_MANIFEST_TYPES)
                .await
                .map_err(|e| image_error(&child_source, format!("Failed to pull manifest: {}", e)))?;
            let child_type = media_type_of(&child_raw);
            self.copy_manifest(client, &child_source, &child_destination, child_raw, &child_type)
                .await?;
        }
        self.push_manifest(client, destination, raw, &media_type).await
    }

    /// Copy the blobs of a single-platform manifest, then the manifest.
    async fn copy_manifest(
        &self,
        client: &Client,
        source: &Reference,
        destination: &Reference,
        raw: Vec<u8>,
        media_type: &str,
    ) -> Result<()> {
        let manifest: OciImageManifest = serde_json::from_slice(&raw)?;

        for descriptor in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
            tracing::trace!(digest = %descriptor.digest, size = descriptor.size, "Copying blob");
            let mut data: Vec<u8> = Vec::new();
            client
                .pull_blob(source, descriptor, &mut data)
                .await
                .map_err(|e| {
                    image_error(source, format!("Failed to pull blob {}: {}", descriptor.digest, e))
                })?;
            client
                .push_blob(destination, &data, &descriptor.digest)
                .await
                .map_err(|e| {
                    image_error(
                        destination,
                        format!("Failed to push blob {}: {}", descriptor.digest, e),
                    )
                })?;
        }

        self.push_manifest(client, destination, raw, media_type).await
    }

    async fn push_manifest(
        &self,
        client: &Client,
        destination: &Reference,
        raw: Vec<u8>,
        media_type: &str,
    ) -> Result<()> {
        let content_type = media_type
            .parse()
            .map_err(|_| image_error(destination, format!("invalid media type '{}'", media_type)))?;
        client
            .push_manifest_raw(destination, raw, content_type)
            .await
            .map_err(|e| image_error(destination, format!("Failed to push manifest: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl Mirror for OciMirror {
    async fn copy(&self, source: &str, destination: &str, opts: &CopyOptions) -> Result<()> {
        let src = ImageReference::parse(source)?;
        let dst = ImageReference::parse(destination)?;
        let src_ref = to_oci_reference(&src)?;
        let dst_ref = to_oci_reference(&dst)?;
        let client = self.client(&src, &dst, opts);

        tracing::info!(source = %src, destination = %dst, "Copying image");

        client
            .auth(&dst_ref, &self.auth.to_oci_auth(), RegistryOperation::Push)
            .await
            .map_err(|e| image_error(&dst_ref, format!("Failed to authenticate: {}", e)))?;

        self.copy_image(&client, &src_ref, &dst_ref, opts.multi_arch)
            .await?;

        tracing::debug!(destination = %dst, "Image copied");
        Ok(())
    }

    async fn check(&self, image: &str, opts: &CopyOptions) -> Result<bool> {
        let reference = ImageReference::parse(image)?;
        let local = opts.is_local(&reference.registry);
        let scheme = if local || !opts.dest_tls_verify { "http" } else { "https" };
        let url = format!(
            "{}://{}/v2/{}/manifests/{}",
            scheme,
            reference.registry,
            reference.repository,
            reference.manifest_reference()
        );

        let client = if opts.dest_tls_verify { &self.http } else { &self.http_insecure };
        let mut request = client
            .head(&url)
            .header(reqwest::header::ACCEPT, ACCEPTED_MANIFEST_TYPES.join(", "));
        if let (false, Some(u), Some(p)) = (local, &self.auth.username, &self.auth.password) {
            request = request.basic_auth(u, Some(p));
        }

        let response = request.send().await.map_err(|e| MirrorError::Image {
            image: image.to_string(),
            message: format!("Failed to check manifest: {}", e),
        })?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(MirrorError::Image {
                image: image.to_string(),
                message: format!("unexpected status {} checking manifest", status),
            }),
        }
    }
}

fn image_error(reference: &Reference, message: String) -> MirrorError {
    MirrorError::Image {
        image: reference.whole(),
        message,
    }
}

/// Convert an ImageReference to an oci-distribution Reference.
fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let ref_str = reference.full_reference();
    ref_str.parse::<Reference>().map_err(|e| MirrorError::Image {
        image: ref_str.clone(),
        message: format!("Invalid OCI reference: {}", e),
    })
}

fn with_digest(reference: &Reference, digest: &str) -> Reference {
    Reference::with_digest(
        reference.registry().to_string(),
        reference.repository().to_string(),
        digest.to_string(),
    )
}

/// `mediaType` of a raw manifest, inferred from its shape when absent.
fn media_type_of(raw: &[u8]) -> String {
    let value: serde_json::Value = serde_json::from_slice(raw).unwrap_or_default();
    match value.get("mediaType").and_then(|m| m.as_str()) {
        Some(media_type) => media_type.to_string(),
        None if value.get("manifests").is_some() => OCI_IMAGE_INDEX.to_string(),
        None => OCI_IMAGE_MANIFEST.to_string(),
    }
}

fn is_index(media_type: &str) -> bool {
    media_type == OCI_IMAGE_INDEX || media_type == DOCKER_MANIFEST_LIST
}

/// Digest of the linux manifest matching the host architecture.
fn host_platform_digest(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };

    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map_or(false, |p| p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn copy_opts(src_tls: bool, dest_tls: bool) -> CopyOptions {
        CopyOptions {
            src_tls_verify: src_tls,
            dest_tls_verify: dest_tls,
            multi_arch: MultiArch::All,
            local_storage_fqdn: "localhost:5000".to_string(),
        }
    }

    #[test]
    fn test_registry_auth_to_oci() {
        assert!(matches!(
            RegistryAuth::anonymous().to_oci_auth(),
            OciRegistryAuth::Anonymous
        ));
        assert!(matches!(
            RegistryAuth::basic("user", "pass").to_oci_auth(),
            OciRegistryAuth::Basic(_, _)
        ));
    }

    #[test]
    fn test_plain_http_registries() {
        let src = ImageReference::parse("quay.io/org/img:v1").unwrap();
        let dst = ImageReference::parse("localhost:5000/org/img:v1").unwrap();

        let registries = OciMirror::plain_http_registries(&src, &dst, &copy_opts(true, true));
        assert_eq!(registries, vec!["localhost:5000".to_string()]);

        let registries = OciMirror::plain_http_registries(&src, &dst, &copy_opts(false, true));
        assert_eq!(
            registries,
            vec!["localhost:5000".to_string(), "quay.io".to_string()]
        );
    }

    #[test]
    fn test_media_type_of() {
        assert_eq!(
            media_type_of(br#"{"mediaType":"application/vnd.docker.distribution.manifest.v2+json"}"#),
            DOCKER_MANIFEST_V2
        );
        assert_eq!(media_type_of(br#"{"manifests":[]}"#), OCI_IMAGE_INDEX);
        assert_eq!(media_type_of(br#"{"layers":[]}"#), OCI_IMAGE_MANIFEST);
        assert!(is_index(DOCKER_MANIFEST_LIST));
        assert!(!is_index(OCI_IMAGE_MANIFEST));
    }

    #[test]
    fn test_to_oci_reference() {
        let reference = ImageReference::parse("localhost:5000/org/img:v1").unwrap();
        let oci = to_oci_reference(&reference).unwrap();
        assert_eq!(oci.registry(), "localhost:5000");
        assert_eq!(oci.repository(), "org/img");
        assert_eq!(oci.tag(), Some("v1"));

        let child = with_digest(&oci, "sha256:abc");
        assert_eq!(child.digest(), Some("sha256:abc"));
        assert_eq!(child.repository(), "org/img");
    }
}
