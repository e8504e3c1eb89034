//! Image reference parsing.
//!
//! Parses references like `docker://quay.io/org/image:v1` into structured
//! components and rewrites them onto another registry for mirroring.

use a3s_mirror_core::error::{MirrorError, Result};
use a3s_mirror_core::options::DOCKER_PROTOCOL;

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname (e.g., "quay.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g., "openshift-release-dev/ocp-release")
    pub repository: String,
    /// Tag (e.g., "latest", "4.14.1-x86_64")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string, with or without a `docker://` prefix.
    ///
    /// Supports formats:
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `quay.io/org/image:tag` → quay.io/org/image:tag
    /// - `quay.io/org/image@sha256:abc...` → quay.io/org/image@sha256:abc...
    /// - `localhost:5000/org/image:tag` → localhost:5000/org/image:tag
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = strip_transport(reference.trim());
        if reference.is_empty() {
            return Err(MirrorError::Other("Empty image reference".to_string()));
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = match reference.rfind('@') {
            Some(at_pos) => {
                let digest_part = &reference[at_pos + 1..];
                if !digest_part.contains(':') {
                    return Err(MirrorError::Other(format!(
                        "Invalid digest format in reference '{}': expected algorithm:hex",
                        reference
                    )));
                }
                (&reference[..at_pos], Some(digest_part.to_string()))
            }
            None => (reference, None),
        };

        // A tag is a colon after the last slash; a bare `host:port` is not a tag
        let last_segment_start = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_segment_start..].rfind(':') {
            Some(colon) => {
                let colon_pos = last_segment_start + colon;
                let candidate = &name_tag[colon_pos + 1..];
                let is_port = last_segment_start == 0
                    && candidate.chars().all(|c| c.is_ascii_digit());
                if is_port {
                    (name_tag, None)
                } else {
                    (&name_tag[..colon_pos], Some(candidate.to_string()))
                }
            }
            None => (name_tag, None),
        };

        let (registry, repository) = Self::split_registry_repository(name)?;

        // Apply default tag if no tag and no digest
        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Split a name into registry and repository components.
    fn split_registry_repository(name: &str) -> Result<(String, String)> {
        // The first component is a registry if it looks like a hostname
        if let Some(slash_pos) = name.find('/') {
            let first = &name[..slash_pos];
            if first.contains('.') || first.contains(':') || first == "localhost" {
                let repo = name[slash_pos + 1..].to_string();
                if repo.is_empty() {
                    return Err(MirrorError::Other(format!(
                        "Empty repository in reference '{}'",
                        name
                    )));
                }
                return Ok((first.to_string(), repo));
            }
        }

        let repository = if name.contains('/') {
            name.to_string()
        } else {
            format!("library/{}", name)
        };

        Ok((DEFAULT_REGISTRY.to_string(), repository))
    }

    /// Repository plus `:tag` and/or `@digest`, without the registry.
    pub fn path_component(&self) -> String {
        let mut s = self.repository.clone();
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }

    /// `registry/repository` without tag or digest.
    pub fn repository_path(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        format!("{}/{}", self.registry, self.path_component())
    }

    /// Full reference with the `docker://` transport prefix.
    pub fn docker_reference(&self) -> String {
        format!("{}{}", DOCKER_PROTOCOL, self.full_reference())
    }

    /// Tag or digest used to address the manifest (digest wins).
    pub fn manifest_reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Rewrite this reference below `prefix` (`registry[/namespace]`).
    pub fn rebase(&self, prefix: &str) -> Result<Self> {
        let prefix = strip_transport(prefix).trim_end_matches('/');
        Self::parse(&format!("{}/{}", prefix, self.path_component()))
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

/// Strip a leading `docker://` transport.
pub fn strip_transport(reference: &str) -> &str {
    reference.strip_prefix(DOCKER_PROTOCOL).unwrap_or(reference)
}
