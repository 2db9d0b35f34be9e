//! Input and output manifests exchanged with the generation workflow.
//!
//! Both manifests keep insertion order ([`IndexMap`]) so that processing
//! order and "last image wins" selection are deterministic.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// InputManifest
// ---------------------------------------------------------------------------

/// Named input references of one job (e.g. `base_image -> https://...`).
///
/// Values are remote URLs before materialization and local filenames
/// afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputManifest(IndexMap<String, String>);

impl InputManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, reference: impl Into<String>) {
        self.0.insert(key.into(), reference.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for InputManifest {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

// ---------------------------------------------------------------------------
// OutputManifest
// ---------------------------------------------------------------------------

/// A generated file as reported by ComfyUI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// ComfyUI folder type (`output`, `temp`, ...).
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Output of a single workflow node. Nodes that produce no images carry
/// an empty list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<ImageRef>,
}

/// Producer node id -> node output, in the order the service reported them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputManifest(pub IndexMap<String, NodeOutput>);

impl OutputManifest {
    /// Every image descriptor, node by node.
    pub fn images(&self) -> impl Iterator<Item = &ImageRef> {
        self.0.values().flat_map(|node| node.images.iter())
    }

    /// The image the resolver materializes: the last one encountered.
    pub fn last_image(&self) -> Option<&ImageRef> {
        self.images().last()
    }
}
