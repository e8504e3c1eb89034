//! Cluster resources pointing a disconnected cluster at the mirror.
//!
//! Digest-pinned images become `ImageDigestMirrorSet` entries, tagged images
//! `ImageTagMirrorSet` entries. Each file holds one document per image
//! category.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use a3s_mirror_core::error::{MirrorError, Result};
use a3s_mirror_core::{ImageType, RunOptions, WorkItem};
use serde::Serialize;

use crate::reference::ImageReference;

pub const IDMS_FILE: &str = "idms-a3s-mirror.yaml";
pub const ITMS_FILE: &str = "itms-a3s-mirror.yaml";

const API_VERSION: &str = "config.openshift.io/v1";

/// Generates cluster resources for a disk to mirror run.
pub trait ClusterResourcesGenerator: Send + Sync {
    /// Write the mirror set files; returns the files written.
    fn idms_itms_generator(&self, items: &[WorkItem]) -> Result<Vec<PathBuf>>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MirrorSet {
    api_version: &'static str,
    kind: &'static str,
    metadata: Metadata,
    spec: MirrorSetSpec,
}

#[derive(Debug, Serialize)]
struct Metadata {
    name: String,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct MirrorSetSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    image_digest_mirrors: Option<Vec<MirrorEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_tag_mirrors: Option<Vec<MirrorEntry>>,
}

#[derive(Debug, Serialize)]
struct MirrorEntry {
    source: String,
    mirrors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetKind {
    Digest,
    Tag,
}

impl SetKind {
    fn kind(self) -> &'static str {
        match self {
            SetKind::Digest => "ImageDigestMirrorSet",
            SetKind::Tag => "ImageTagMirrorSet",
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            SetKind::Digest => "idms",
            SetKind::Tag => "itms",
        }
    }

    fn file(self) -> &'static str {
        match self {
            SetKind::Digest => IDMS_FILE,
            SetKind::Tag => ITMS_FILE,
        }
    }
}

/// source repository -> mirror repositories
type MirrorMap = BTreeMap<String, BTreeSet<String>>;

/// Writes mirror sets under `<working-dir>/cluster-resources/`.
pub struct ClusterResources {
    output_dir: PathBuf,
}

impl ClusterResources {
    pub fn new(opts: Arc<RunOptions>) -> Self {
        Self {
            output_dir: opts
                .working_dir
                .join(a3s_mirror_core::layout::CLUSTER_RESOURCES_DIR),
        }
    }

    fn group(items: &[WorkItem]) -> Result<BTreeMap<(u8, ImageType), (SetKind, MirrorMap)>> {
        let mut groups: BTreeMap<(u8, ImageType), (SetKind, MirrorMap)> = BTreeMap::new();
        for item in items {
            let origin_text = if item.origin.is_empty() { &item.source } else { &item.origin };
            let origin = ImageReference::parse(origin_text)?;
            let mirror = ImageReference::parse(&item.destination)?;
            let kind = if origin.digest.is_some() {
                SetKind::Digest
            } else {
                SetKind::Tag
            };
            let order = match kind {
                SetKind::Digest => 0,
                SetKind::Tag => 1,
            };
            groups
                .entry((order, item.image_type))
                .or_insert_with(|| (kind, MirrorMap::new()))
                .1
                .entry(origin.repository_path())
                .or_default()
                .insert(mirror.repository_path());
        }
        Ok(groups)
    }

    fn document(kind: SetKind, image_type: ImageType, mirrors: MirrorMap) -> Result<String> {
        let entries: Vec<MirrorEntry> = mirrors
            .into_iter()
            .map(|(source, mirrors)| MirrorEntry {
                source,
                mirrors: mirrors.into_iter().collect(),
            })
            .collect();
        let mut spec = MirrorSetSpec::default();
        match kind {
            SetKind::Digest => spec.image_digest_mirrors = Some(entries),
            SetKind::Tag => spec.image_tag_mirrors = Some(entries),
        }
        let set = MirrorSet {
            api_version: API_VERSION,
            kind: kind.kind(),
            metadata: Metadata {
                name: format!("{}-{}-0", kind.prefix(), image_type),
            },
            spec,
        };
        Ok(serde_yaml::to_string(&set)?)
    }
}

impl ClusterResourcesGenerator for ClusterResources {
    fn idms_itms_generator(&self, items: &[WorkItem]) -> Result<Vec<PathBuf>> {
        let groups = Self::group(items)?;
        if groups.is_empty() {
            tracing::info!("No images mirrored, no cluster resources generated");
            return Ok(Vec::new());
        }

        std::fs::create_dir_all(&self.output_dir).map_err(|e| {
            MirrorError::ClusterResources(format!(
                "Failed to create {}: {}",
                self.output_dir.display(),
                e
            ))
        })?;

        let mut files: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
        for ((_, image_type), (kind, mirrors)) in groups {
            files
                .entry(kind.file())
                .or_default()
                .push(Self::document(kind, image_type, mirrors)?);
        }

        let mut written = Vec::new();
        for (file, documents) in files {
            let path = self.output_dir.join(file);
            std::fs::write(&path, documents.join("---\n")).map_err(|e| {
                MirrorError::ClusterResources(format!("Failed to write {}: {}", path.display(), e))
            })?;
            tracing::info!(file = %path.display(), documents = documents.len(), "Cluster resource written");
            written.push(path);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use a3s_mirror_core::{GlobalOptions, WorkflowMode};
    use serde::Deserialize;
    use tempfile::TempDir;

    const DIGEST: &str =
        "sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890";

    fn generator(tmp: &TempDir) -> ClusterResources {
        let global = GlobalOptions {
            from: Some(format!("file://{}", tmp.path().display())),
            ..Default::default()
        };
        let opts = RunOptions::resolve(
            &global,
            WorkflowMode::DiskToMirror,
            "docker://mirror.example.com/disconnected",
            tmp.path().join("cache"),
        )
        .unwrap();
        ClusterResources::new(Arc::new(opts))
    }

    fn item(origin: &str, destination: &str, image_type: ImageType) -> WorkItem {
        WorkItem::new("docker://localhost:5000/x", destination, origin).with_type(image_type)
    }

    #[test]
    fn test_writes_idms_and_itms() {
        let tmp = TempDir::new().unwrap();
        let generator = generator(&tmp);
        let items = vec![
            item(
                &format!("quay.io/openshift-release-dev/ocp-release@{}", DIGEST),
                &format!("docker://mirror.example.com/disconnected/openshift-release-dev/ocp-release@{}", DIGEST),
                ImageType::Release,
            ),
            item(
                "registry.redhat.io/ubi9/ubi:latest",
                "docker://mirror.example.com/disconnected/ubi9/ubi:latest",
                ImageType::Additional,
            ),
            item(
                "registry.redhat.io/ubi9/ubi:9.3",
                "docker://mirror.example.com/disconnected/ubi9/ubi:9.3",
                ImageType::Additional,
            ),
        ];

        let written = generator.idms_itms_generator(&items).unwrap();
        assert_eq!(written.len(), 2);

        let dir = tmp.path().join("working-dir/cluster-resources");
        let idms = std::fs::read_to_string(dir.join(IDMS_FILE)).unwrap();
        assert!(idms.contains("kind: ImageDigestMirrorSet"));
        assert!(idms.contains("name: idms-release-0"));
        assert!(idms.contains("source: quay.io/openshift-release-dev/ocp-release"));
        assert!(idms.contains("mirror.example.com/disconnected/openshift-release-dev/ocp-release"));

        let itms = std::fs::read_to_string(dir.join(ITMS_FILE)).unwrap();
        assert!(itms.contains("kind: ImageTagMirrorSet"));
        // both ubi tags collapse into one repository mapping
        assert_eq!(itms.matches("source: registry.redhat.io/ubi9/ubi").count(), 1);
    }

    #[test]
    fn test_one_document_per_category() {
        let tmp = TempDir::new().unwrap();
        let generator = generator(&tmp);
        let items = vec![
            item("quay.io/a/op-index:v1", "docker://mirror.example.com/disconnected/a/op-index:v1", ImageType::Operator),
            item("quay.io/b/tool:v1", "docker://mirror.example.com/disconnected/b/tool:v1", ImageType::Additional),
        ];
        generator.idms_itms_generator(&items).unwrap();

        let itms = std::fs::read_to_string(
            tmp.path().join("working-dir/cluster-resources").join(ITMS_FILE),
        )
        .unwrap();
        let documents: Vec<serde_yaml::Value> = serde_yaml::Deserializer::from_str(&itms)
            .map(|d| serde_yaml::Value::deserialize(d).unwrap())
            .collect();
        assert_eq!(documents.len(), 2);
        assert_eq!(documents[0]["metadata"]["name"], "itms-operator-0");
        assert_eq!(documents[1]["metadata"]["name"], "itms-additional-0");
    }

    #[test]
    fn test_no_items_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let generator = generator(&tmp);
        assert!(generator.idms_itms_generator(&[]).unwrap().is_empty());
        assert!(!tmp.path().join("working-dir/cluster-resources").exists());
    }
}
