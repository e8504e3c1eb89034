//! The unit of work flowing through collection and transfer.

use serde::{Deserialize, Serialize};

/// Category of content an image belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    Release,
    Operator,
    #[default]
    Additional,
}

impl ImageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageType::Release => "release",
            ImageType::Operator => "operator",
            ImageType::Additional => "additional",
        }
    }
}

impl std::fmt::Display for ImageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One image to copy: source and destination references plus its category.
///
/// Identity is the (source, destination) pair; `image_type` is informational
/// and stamped per collector batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Transport-prefixed source reference (e.g. `docker://quay.io/org/img:v1`)
    pub source: String,
    /// Transport-prefixed destination reference
    pub destination: String,
    /// Reference as declared in the image set configuration
    pub origin: String,
    /// Category of the batch that produced this item
    pub image_type: ImageType,
}

impl WorkItem {
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            origin: origin.into(),
            image_type: ImageType::default(),
        }
    }

    pub fn with_type(mut self, image_type: ImageType) -> Self {
        self.image_type = image_type;
        self
    }
}

impl PartialEq for WorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.destination == other.destination
    }
}

impl Eq for WorkItem {}

impl std::hash::Hash for WorkItem {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.source.hash(state);
        self.destination.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_identity_ignores_type_and_origin() {
        let a = WorkItem::new("docker://a", "docker://b", "a").with_type(ImageType::Release);
        let b = WorkItem::new("docker://a", "docker://b", "other").with_type(ImageType::Operator);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(!set.insert(b));
    }

    #[test]
    fn test_identity_differs_on_destination() {
        let a = WorkItem::new("docker://a", "docker://b", "a");
        let b = WorkItem::new("docker://a", "docker://c", "a");
        assert_ne!(a, b);
    }

    #[test]
    fn test_image_type_display() {
        assert_eq!(ImageType::Release.to_string(), "release");
        assert_eq!(ImageType::Operator.to_string(), "operator");
        assert_eq!(ImageType::Additional.to_string(), "additional");
    }
}
