use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::PersistentCache;
use crate::gateway::{GatewayError, MetadataGateway};
use crate::model::{Item, KeyValueMap};

/// Only the start of the file is fetched; PNG text chunks sit before the
/// image data in practice.
pub const HEAD_BYTES: u64 = 64 * 1024;

const PNG_MIME: &str = "image/png";
const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("{0} is not a PNG image")]
    NotPng(String),
    #[error("extraction cancelled")]
    Cancelled,
    #[error("fetch failed: {0}")]
    Gateway(#[from] GatewayError),
}

/// Turns the head of a file into key/value metadata.
pub trait Extractor: Send + Sync {
    fn extract(&self, head: &[u8]) -> KeyValueMap;
}

impl<F> Extractor for F
where
    F: Fn(&[u8]) -> KeyValueMap + Send + Sync,
{
    fn extract(&self, head: &[u8]) -> KeyValueMap {
        self(head)
    }
}

/// Reads the header and the `tEXt` chunks found before the image data.
#[derive(Debug, Clone, Copy, Default)]
pub struct PngTextExtractor;

impl Extractor for PngTextExtractor {
    fn extract(&self, head: &[u8]) -> KeyValueMap {
        let mut out = KeyValueMap::new();
        let Some(mut rest) = head.strip_prefix(&PNG_SIGNATURE[..]) else {
            return out;
        };
        out.insert("format".into(), "png".into());
        while rest.len() >= 8 {
            let length = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            let kind = &rest[4..8];
            let Some(data) = rest.get(8..8 + length) else {
                break;
            };
            match kind {
                b"IHDR" if data.len() >= 8 => {
                    let width = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                    let height = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
                    out.insert("width".into(), width.to_string());
                    out.insert("height".into(), height.to_string());
                }
                b"tEXt" => {
                    if let Some(split) = data.iter().position(|byte| *byte == 0) {
                        let key = String::from_utf8_lossy(&data[..split]).into_owned();
                        let value = String::from_utf8_lossy(&data[split + 1..]).into_owned();
                        if !key.is_empty() {
                            out.insert(key, value);
                        }
                    }
                }
                b"IDAT" | b"IEND" => break,
                _ => {}
            }
            // chunk data plus the trailing CRC
            rest = rest.get(8 + length + 4..).unwrap_or_default();
        }
        out
    }
}

/// Cancels the fetches of the service it was taken from. Clones share the
/// same service, so a fetch can be aborted while something else holds the
/// service borrowed.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    current: Arc<Mutex<CancellationToken>>,
}

impl AbortHandle {
    /// Cancels every fetch in flight. Later fetches are unaffected.
    pub fn abort(&self) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        current.cancel();
        *current = CancellationToken::new();
    }

    fn token(&self) -> CancellationToken {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Fetches and extracts embedded metadata, one abortable fetch at a time.
pub struct ExtractionService {
    extractor: Box<dyn Extractor>,
    aborts: AbortHandle,
}

impl Default for ExtractionService {
    fn default() -> Self {
        Self::new(PngTextExtractor)
    }
}

impl ExtractionService {
    pub fn new(extractor: impl Extractor + 'static) -> Self {
        Self {
            extractor: Box::new(extractor),
            aborts: AbortHandle::default(),
        }
    }

    pub fn abort(&self) {
        self.aborts.abort();
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.aborts.clone()
    }

    pub async fn fetch<G: MetadataGateway>(
        &self,
        gateway: &G,
        cache: &PersistentCache,
        item: &Item,
    ) -> Result<KeyValueMap, ExtractionError> {
        let cancel = self.aborts.token();

        if let Some(cached) = cache.extracted(&item.id).await {
            return Ok(cached);
        }
        if !is_png(item) {
            return Err(ExtractionError::NotPng(item.display_name.clone()));
        }

        let head = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(item_id = %item.id, "extraction cancelled");
                return Err(ExtractionError::Cancelled);
            }
            head = gateway.fetch_head(&item.id, HEAD_BYTES) => head?,
        };
        let metadata = self.extractor.extract(&head);
        cache.store_extracted(&item.id, &metadata).await;
        Ok(metadata)
    }
}

fn is_png(item: &Item) -> bool {
    item.mime_type.eq_ignore_ascii_case(PNG_MIME)
        || item.display_name.to_ascii_lowercase().ends_with(".png")
}
