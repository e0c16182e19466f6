use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use url::Url;

use crate::error::{RemoteError, ensure_success, handle_response};
use crate::remote::{RemoteFile, RemoteFolder, head_range, is_image_mime};

const DEFAULT_BASE_URL: &str = "https://graph.microsoft.com";
const DRIVE_PATH: &str = "/v1.0/me/drive";
const APP_ROOT_PATH: &str = "/v1.0/me/drive/special/approot";
const DOCUMENT_SUFFIX: &str = ".json";

/// Client for a drive that keeps user metadata out of band, as one small
/// JSON document per item inside the application's private folder.
#[derive(Clone)]
pub struct GraphClient {
    http: Client,
    base_url: Url,
    token: String,
}

/// A companion document found in the private app folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDocument {
    /// Drive id of the document itself.
    pub id: String,
    pub name: String,
    /// Id of the item the document describes.
    pub item_id: String,
}

impl GraphClient {
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

    pub fn with_token(&self, token: impl Into<String>) -> Self {
        Self {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            token: token.into(),
        }
    }

    pub async fn list_images(&self, folder_id: &str) -> Result<Vec<RemoteFile>, RemoteError> {
        let items: Vec<DriveItem> = self.collect_pages(self.children_url(folder_id)?).await?;
        Ok(items
            .into_iter()
            .filter_map(|item| {
                let mime_type = item.file.as_ref()?.mime_type.clone()?;
                is_image_mime(&mime_type).then(|| item.into_remote(mime_type))
            })
            .collect())
    }

    pub async fn list_folders(&self, parent_id: &str) -> Result<Vec<RemoteFolder>, RemoteError> {
        let items: Vec<DriveItem> = self.collect_pages(self.children_url(parent_id)?).await?;
        let mut folders: Vec<RemoteFolder> = items
            .into_iter()
            .filter_map(|item| {
                let folder = item.folder?;
                Some(RemoteFolder {
                    id: item.id,
                    name: item.name,
                    child_count: folder.child_count,
                    modified: item.last_modified_date_time,
                })
            })
            .collect();
        folders.sort_by_key(|folder| folder.name.to_lowercase());
        Ok(folders)
    }

    pub async fn list_app_documents(&self) -> Result<Vec<AppDocument>, RemoteError> {
        let url = self.endpoint(&format!("{APP_ROOT_PATH}/children"))?;
        let items: Vec<DriveItem> = self.collect_pages(url).await?;
        Ok(items
            .into_iter()
            .filter_map(|item| {
                let item_id = item.name.strip_suffix(DOCUMENT_SUFFIX)?.to_string();
                Some(AppDocument {
                    id: item.id,
                    name: item.name,
                    item_id,
                })
            })
            .collect())
    }

    pub async fn get_app_document<T: DeserializeOwned>(
        &self,
        document_id: &str,
    ) -> Result<T, RemoteError> {
        let url = self.item_url(document_id, Some("content"))?;
        let response = self.http.get(url).bearer_auth(&self.token).send().await?;
        handle_response(response).await
    }

    /// Create-or-replace of the whole companion document for `item_id`.
    pub async fn put_app_document<T: Serialize + ?Sized>(
        &self,
        item_id: &str,
        document: &T,
    ) -> Result<(), RemoteError> {
        let url = self.app_document_url(item_id, true)?;
        let response = self
            .http
            .put(url)
            .bearer_auth(&self.token)
            .json(document)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    /// Deleting a document that does not exist is treated as success.
    pub async fn delete_app_document(&self, item_id: &str) -> Result<(), RemoteError> {
        let url = self.app_document_url(item_id, false)?;
        let response = self.http.delete(url).bearer_auth(&self.token).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        ensure_success(response).await?;
        Ok(())
    }

    pub async fn delete_item(&self, item_id: &str) -> Result<(), RemoteError> {
        let url = self.item_url(item_id, None)?;
        let response = self.http.delete(url).bearer_auth(&self.token).send().await?;
        ensure_success(response).await?;
        Ok(())
    }

    pub async fn move_item(&self, item_id: &str, target_folder_id: &str) -> Result<(), RemoteError> {
        let url = self.item_url(item_id, None)?;
        let response = self
            .http
            .patch(url)
            .bearer_auth(&self.token)
            .json(&json!({ "parentReference": { "id": target_folder_id } }))
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    pub async fn download_head(&self, item_id: &str, max_bytes: u64) -> Result<Vec<u8>, RemoteError> {
        let url = self.item_url(item_id, Some("content"))?;
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

    async fn collect_pages<T: DeserializeOwned>(&self, first: Url) -> Result<Vec<T>, RemoteError> {
        let mut out = Vec::new();
        let mut next = Some(first);
        while let Some(url) = next.take() {
            let response = self.http.get(url).bearer_auth(&self.token).send().await?;
            let page: GraphPage<T> = handle_response(response).await?;
            out.extend(page.value);
            if let Some(link) = page.next_link {
                next = Some(Url::parse(&link)?);
            }
        }
        Ok(out)
    }

    fn children_url(&self, folder_id: &str) -> Result<Url, RemoteError> {
        if folder_id == "root" {
            return self.endpoint(&format!("{DRIVE_PATH}/root/children"));
        }
        self.item_url(folder_id, Some("children"))
    }

    fn item_url(&self, item_id: &str, tail: Option<&str>) -> Result<Url, RemoteError> {
        let mut url = self.endpoint(&format!("{DRIVE_PATH}/items"))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| RemoteError::CannotBeABase(self.base_url.to_string()))?;
            segments.push(item_id);
            if let Some(tail) = tail {
                segments.push(tail);
            }
        }
        Ok(url)
    }

    // Path-based addressing inside the app folder: `approot:/<name>:/content`.
    fn app_document_url(&self, item_id: &str, content: bool) -> Result<Url, RemoteError> {
        let mut url = self.endpoint(&format!("{DRIVE_PATH}/special"))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| RemoteError::CannotBeABase(self.base_url.to_string()))?;
            segments.push("approot:");
            if content {
                segments.push(&format!("{item_id}{DOCUMENT_SUFFIX}:")).push("content");
            } else {
                segments.push(&format!("{item_id}{DOCUMENT_SUFFIX}"));
            }
        }
        Ok(url)
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        Ok(self.base_url.join(path)?)
    }
}

#[derive(Debug, Deserialize)]
struct GraphPage<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    id: String,
    name: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    created_date_time: Option<String>,
    #[serde(default)]
    last_modified_date_time: Option<String>,
    #[serde(default)]
    file: Option<FileFacet>,
    #[serde(default)]
    folder: Option<FolderFacet>,
    #[serde(default)]
    parent_reference: Option<ParentReference>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileFacet {
    #[serde(default)]
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FolderFacet {
    #[serde(default)]
    child_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ParentReference {
    #[serde(default)]
    id: Option<String>,
}

impl DriveItem {
    fn into_remote(self, mime_type: String) -> RemoteFile {
        RemoteFile {
            id: self.id,
            name: self.name,
            mime_type,
            size: self.size.unwrap_or(0),
            created: self.created_date_time,
            modified: self.last_modified_date_time,
            app_properties: Default::default(),
            parents: self
                .parent_reference
                .and_then(|parent| parent.id)
                .into_iter()
                .collect(),
        }
    }
}
