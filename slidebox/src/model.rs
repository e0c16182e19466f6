use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use slidebox_core::RemoteFile;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Flat string map handed to and returned by the metadata extractor, and the
/// wire shape of inline item properties.
pub type KeyValueMap = BTreeMap<String, String>;

pub const MAX_RATING: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    #[default]
    In,
    Out,
    Priority,
    Trash,
}

impl Bucket {
    pub const ALL: [Bucket; 4] = [Bucket::In, Bucket::Out, Bucket::Priority, Bucket::Trash];

    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::In => "in",
            Bucket::Out => "out",
            Bucket::Priority => "priority",
            Bucket::Trash => "trash",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "in" => Some(Bucket::In),
            "out" => Some(Bucket::Out),
            "priority" => Some(Bucket::Priority),
            "trash" => Some(Bucket::Trash),
            _ => None,
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown bucket: {0}")]
pub struct UnknownBucket(pub String);

impl FromStr for Bucket {
    type Err = UnknownBucket;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Bucket::parse(value).ok_or_else(|| UnknownBucket(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtractionStatus {
    #[default]
    Pending,
    Loading,
    Loaded,
    Error,
}

impl ExtractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionStatus::Pending => "pending",
            ExtractionStatus::Loading => "loading",
            ExtractionStatus::Loaded => "loaded",
            ExtractionStatus::Error => "error",
        }
    }
}

/// The user-editable projection of an item, as persisted remotely.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserMetadataRecord {
    pub bucket: Bucket,
    pub tags: BTreeSet<String>,
    pub quality_rating: u8,
    pub content_rating: u8,
    pub notes: String,
    pub order_key: i64,
}

impl UserMetadataRecord {
    /// Reads the inline property set. Missing or malformed values fall back to
    /// defaults instead of failing the whole listing.
    pub fn from_properties(properties: &HashMap<String, String>) -> Self {
        let get = |key: &str| properties.get(key).map(|value| value.trim());
        Self {
            bucket: get("bucket").and_then(Bucket::parse).unwrap_or_default(),
            tags: get("tags").map(parse_tags).unwrap_or_default(),
            quality_rating: get("qualityRating").map(parse_rating).unwrap_or(0),
            content_rating: get("contentRating").map(parse_rating).unwrap_or(0),
            notes: properties.get("notes").cloned().unwrap_or_default(),
            order_key: get("orderKey")
                .and_then(|value| value.parse::<i64>().ok())
                .unwrap_or(0),
        }
    }

    pub fn apply(&mut self, update: &MetadataUpdate) {
        if let Some(bucket) = update.bucket {
            self.bucket = bucket;
        }
        if let Some(tags) = &update.tags {
            self.tags = tags.clone();
        }
        if let Some(rating) = update.quality_rating {
            self.quality_rating = rating.min(MAX_RATING);
        }
        if let Some(rating) = update.content_rating {
            self.content_rating = rating.min(MAX_RATING);
        }
        if let Some(notes) = &update.notes {
            self.notes = notes.clone();
        }
        if let Some(order_key) = update.order_key {
            self.order_key = order_key;
        }
    }
}

/// A partial change to a [`UserMetadataRecord`]; `None` leaves a field as is.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetadataUpdate {
    pub bucket: Option<Bucket>,
    pub tags: Option<BTreeSet<String>>,
    pub quality_rating: Option<u8>,
    pub content_rating: Option<u8>,
    pub notes: Option<String>,
    pub order_key: Option<i64>,
}

impl MetadataUpdate {
    pub fn placement(bucket: Bucket, order_key: i64) -> Self {
        Self {
            bucket: Some(bucket),
            order_key: Some(order_key),
            ..Self::default()
        }
    }

    pub fn order(order_key: i64) -> Self {
        Self {
            order_key: Some(order_key),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Inline property encoding of the fields present in this update.
    pub fn to_properties(&self) -> KeyValueMap {
        let mut properties = KeyValueMap::new();
        if let Some(bucket) = self.bucket {
            properties.insert("bucket".into(), bucket.as_str().into());
        }
        if let Some(tags) = &self.tags {
            let joined: Vec<&str> = tags.iter().map(String::as_str).collect();
            properties.insert("tags".into(), joined.join(","));
        }
        if let Some(rating) = self.quality_rating {
            properties.insert("qualityRating".into(), rating.min(MAX_RATING).to_string());
        }
        if let Some(rating) = self.content_rating {
            properties.insert("contentRating".into(), rating.min(MAX_RATING).to_string());
        }
        if let Some(notes) = &self.notes {
            properties.insert("notes".into(), notes.clone());
        }
        if let Some(order_key) = self.order_key {
            properties.insert("orderKey".into(), order_key.to_string());
        }
        properties
    }
}

pub fn parse_tags(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_rating(value: &str) -> u8 {
    value
        .parse::<u32>()
        .map(|rating| rating.min(u32::from(MAX_RATING)) as u8)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub id: String,
    pub display_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    /// Unix milliseconds.
    pub created_at: Option<i64>,
    pub modified_at: Option<i64>,
    pub user: UserMetadataRecord,
    pub extraction_status: ExtractionStatus,
}

impl Item {
    pub fn from_remote(file: &RemoteFile, user: UserMetadataRecord) -> Self {
        Self {
            id: file.id.clone(),
            display_name: file.name.clone(),
            mime_type: file.mime_type.clone(),
            size_bytes: file.size,
            created_at: file.created.as_deref().and_then(parse_timestamp),
            modified_at: file.modified.as_deref().and_then(parse_timestamp),
            user,
            extraction_status: ExtractionStatus::Pending,
        }
    }

    pub fn bucket(&self) -> Bucket {
        self.user.bucket
    }

    pub fn order_key(&self) -> i64 {
        self.user.order_key
    }
}

fn parse_timestamp(value: &str) -> Option<i64> {
    let parsed = OffsetDateTime::parse(value, &Rfc3339).ok()?;
    i64::try_from(parsed.unix_timestamp_nanos() / 1_000_000).ok()
}
