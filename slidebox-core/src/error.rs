use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("base url cannot carry path segments: {0}")]
    CannotBeABase(String),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

impl RemoteError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            RemoteError::Api { status, .. } => Some(*status),
            RemoteError::Request(err) => err.status(),
            _ => None,
        }
    }

    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            RemoteError::Api { status, .. } => Some(classify_api_status(*status)),
            RemoteError::Request(err) if err.is_timeout() || err.is_connect() => {
                Some(ApiErrorClass::Transient)
            }
            _ => None,
        }
    }

    /// The access credential was rejected and a refreshed one may succeed.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self.classification(), Some(ApiErrorClass::Auth))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if status == StatusCode::UNAUTHORIZED {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

pub(crate) async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, RemoteError> {
    let response = ensure_success(response).await?;
    Ok(response.json::<T>().await?)
}

pub(crate) async fn ensure_success(
    response: reqwest::Response,
) -> Result<reqwest::Response, RemoteError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::Api { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: StatusCode) -> RemoteError {
        RemoteError::Api {
            status,
            body: String::new(),
        }
    }

    #[test]
    fn only_unauthorized_counts_as_expired_credential() {
        assert!(api(StatusCode::UNAUTHORIZED).is_auth_expired());
        assert!(!api(StatusCode::FORBIDDEN).is_auth_expired());
        assert_eq!(
            api(StatusCode::FORBIDDEN).classification(),
            Some(ApiErrorClass::Permanent)
        );
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert!(api(StatusCode::BAD_GATEWAY).is_retryable());
        assert!(api(StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(!api(StatusCode::NOT_FOUND).is_retryable());
        assert!(!api(StatusCode::UNAUTHORIZED).is_retryable());
    }
}
