mod drive;
mod error;
mod graph;
mod oauth;
mod remote;

pub use drive::DriveClient;
pub use error::{ApiErrorClass, RemoteError};
pub use graph::{AppDocument, GraphClient};
pub use oauth::{OAuthClient, OAuthError, OAuthToken};
pub use remote::{RemoteFile, RemoteFolder};
pub use reqwest::StatusCode;
