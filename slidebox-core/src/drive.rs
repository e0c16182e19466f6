use std::collections::{BTreeMap, HashMap};

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::error::{RemoteError, ensure_success, handle_response};
use crate::remote::{RemoteFile, RemoteFolder, head_range, is_image_mime};

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com";
const FILES_PATH: &str = "/drive/v3/files";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const IMAGE_FIELDS: &str = "files(id,name,mimeType,size,createdTime,modifiedTime,appProperties,parents),nextPageToken";
const PAGE_SIZE: u32 = 100;

/// Client for a drive that keeps user metadata inline, as string
/// properties on the file record itself.
#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl DriveClient {
    pub fn new(token: impl Into<String>) -> Result<Self, RemoteError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, RemoteError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    /// Same client and base url, different access token.
    pub fn with_token(&self, token: impl Into<String>) -> Self {
        Self {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            token: token.into(),
        }
    }

    pub async fn list_images(&self, folder_id: &str) -> Result<Vec<RemoteFile>, RemoteError> {
        let query = format!(
            "{} in parents and trashed=false and mimeType contains 'image/'",
            query_literal(folder_id)
        );
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = self.endpoint(FILES_PATH)?;
            {
                let mut pairs = url.query_pairs_mut();
                pairs
                    .append_pair("q", &query)
                    .append_pair("fields", IMAGE_FIELDS)
                    .append_pair("pageSize", &PAGE_SIZE.to_string());
                if let Some(token) = page_token.as_deref() {
                    pairs.append_pair("pageToken", token);
                }
            }
            let response = self.http.get(url).bearer_auth(&self.token).send().await?;
            let page: DriveFileList = handle_response(response).await?;
            files.extend(
                page.files
                    .into_iter()
                    .filter(|file| file.mime_type.as_deref().is_some_and(is_image_mime))
                    .map(DriveFile::into_remote),
            );
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }
        Ok(files)
    }

    /// Folders directly under `parent_id`, or every folder of the drive.
    pub async fn list_folders(&self, parent_id: Option<&str>) -> Result<Vec<RemoteFolder>, RemoteError> {
        let mut query = format!("mimeType='{FOLDER_MIME}' and trashed=false");
        if let Some(parent_id) = parent_id {
            query = format!("{} in parents and {query}", query_literal(parent_id));
        }
        let mut url = self.endpoint(FILES_PATH)?;
        url.query_pairs_mut()
            .append_pair("q", &query)
            .append_pair("fields", "files(id,name,modifiedTime)")
            .append_pair("orderBy", "modifiedTime desc");
        let response = self.http.get(url).bearer_auth(&self.token).send().await?;
        let page: DriveFileList = handle_response(response).await?;
        Ok(page
            .files
            .into_iter()
            .map(|folder| RemoteFolder {
                id: folder.id,
                name: folder.name,
                child_count: None,
                modified: folder.modified_time,
            })
            .collect())
    }

    /// Partial update: only the keys present in `properties` are touched.
    pub async fn update_app_properties(
        &self,
        file_id: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<(), RemoteError> {
        let url = self.file_url(file_id)?;
        let response = self
            .http
            .patch(url)
            .bearer_auth(&self.token)
            .json(&json!({ "appProperties": properties }))
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    pub async fn trash_file(&self, file_id: &str) -> Result<(), RemoteError> {
        let url = self.file_url(file_id)?;
        let response = self
            .http
            .patch(url)
            .bearer_auth(&self.token)
            .json(&json!({ "trashed": true }))
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    pub async fn move_to_folder(
        &self,
        file_id: &str,
        target_folder_id: &str,
    ) -> Result<(), RemoteError> {
        let mut url = self.file_url(file_id)?;
        url.query_pairs_mut().append_pair("fields", "parents");
        let response = self.http.get(url).bearer_auth(&self.token).send().await?;
        let current: DriveParents = handle_response(response).await?;

        let mut url = self.file_url(file_id)?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("addParents", target_folder_id);
            if !current.parents.is_empty() {
                pairs.append_pair("removeParents", &current.parents.join(","));
            }
            pairs.append_pair("fields", "id,parents");
        }
        let response = self
            .http
            .patch(url)
            .bearer_auth(&self.token)
            .json(&json!({}))
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    /// Fetches at most `max_bytes` from the start of the file content.
    pub async fn download_head(&self, file_id: &str, max_bytes: u64) -> Result<Vec<u8>, RemoteError> {
        let mut url = self.file_url(file_id)?;
        url.query_pairs_mut().append_pair("alt", "media");
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .header(reqwest::header::RANGE, head_range(max_bytes))
            .send()
            .await?;
        let response = ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        Ok(self.base_url.join(path)?)
    }

    fn file_url(&self, file_id: &str) -> Result<Url, RemoteError> {
        let mut url = self.endpoint(FILES_PATH)?;
        url.path_segments_mut()
            .map_err(|_| RemoteError::CannotBeABase(self.base_url.to_string()))?
            .push(file_id);
        Ok(url)
    }
}

/// Quotes `value` as a string literal of the files query language.
fn query_literal(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    #[serde(default)]
    mime_type: Option<String>,
    // The v3 API serializes int64 values as strings.
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    created_time: Option<String>,
    #[serde(default)]
    modified_time: Option<String>,
    #[serde(default)]
    app_properties: Option<HashMap<String, String>>,
    #[serde(default)]
    parents: Option<Vec<String>>,
}

impl DriveFile {
    fn into_remote(self) -> RemoteFile {
        RemoteFile {
            id: self.id,
            name: self.name,
            mime_type: self.mime_type.unwrap_or_default(),
            size: self
                .size
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(0),
            created: self.created_time,
            modified: self.modified_time,
            app_properties: self.app_properties.unwrap_or_default(),
            parents: self.parents.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DriveParents {
    #[serde(default)]
    parents: Vec<String>,
}
