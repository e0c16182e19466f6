use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// An image as listed by either remote store, normalized to one shape.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub modified: Option<String>,
    /// Inline key/value properties; always empty for stores without them.
    #[serde(default)]
    pub app_properties: HashMap<String, String>,
    #[serde(default)]
    pub parents: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RemoteFolder {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub child_count: Option<u64>,
    #[serde(default)]
    pub modified: Option<String>,
}

pub(crate) fn is_image_mime(mime_type: &str) -> bool {
    mime_type.starts_with("image/")
}

pub(crate) fn head_range(max_bytes: u64) -> String {
    format!("bytes=0-{}", max_bytes.saturating_sub(1))
}
