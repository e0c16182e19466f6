use serde_json::json;
use slidebox_core::{OAuthClient, OAuthError};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn refresh_token_posts_form_data() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .and(body_string_contains("client_id=client-id"))
        .and(body_string_contains("client_secret=secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "token",
            "token_type": "Bearer",
            "expires_in": 3600,
            "scope": "files"
        })))
        .mount(&server)
        .await;

    let client = OAuthClient::new(
        &format!("{}/token", server.uri()),
        "client-id",
        Some("secret".into()),
    )
    .unwrap();
    let token = client.refresh_token("refresh-1", None).await.unwrap();

    assert_eq!(token.access_token, "token");
    assert_eq!(token.expires_in, Some(3600));
    assert!(token.refresh_token.is_none());
}

#[tokio::test]
async fn refresh_token_surfaces_endpoint_errors() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
        .mount(&server)
        .await;

    let client = OAuthClient::new(&format!("{}/token", server.uri()), "client-id", None).unwrap();
    let err = client.refresh_token("revoked", None).await.unwrap_err();

    match err {
        OAuthError::Api { status, body } => {
            assert_eq!(status.as_u16(), 400);
            assert_eq!(body, "invalid_grant");
        }
        other => panic!("unexpected error: {other}"),
    }
}
