//! Signed-request scenarios over the full chain.

use crate::support::{build_gateway, send, spawn_echo_upstream};
use http::StatusCode;
use tollgate_core::{middleware::hmac::encode_signature, session::SessionState};

const SECRET: &str = "9879879878787878";

fn signed_api_def(target: &str, clock_skew_ms: i64) -> String {
    format!(
        r#"{{
            "name": "Signed API",
            "api_id": "1",
            "org_id": "default",
            "definition": {{"location": "header", "key": "version"}},
            "enable_signature_checking": true,
            "hmac_allowed_clock_skew": {clock_skew_ms},
            "auth": {{"auth_header_name": "authorization"}},
            "version_data": {{
                "not_versioned": true,
                "versions": {{
                    "Default": {{"name": "Default", "expires": "3000-01-02 15:04"}}
                }}
            }},
            "proxy": {{"listen_path": "/v1", "target_url": "{target}", "strip_listen_path": true}}
        }}"#
    )
}

fn hmac_session() -> SessionState {
    SessionState {
        rate: 8.0,
        per: 1.0,
        allowance: 8.0,
        quota_max: -1,
        quota_remaining: 1,
        quota_renewal_rate: 300,
        quota_renews: chrono::Utc::now().timestamp() + 20,
        expires: 0,
        hmac_enabled: true,
        hmac_secret: SECRET.to_string(),
        ..SessionState::default()
    }
}

// Same escaper the verifier uses: urlencoded-safe set, space as +.
fn escape(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn auth_header(key_id: &str, signature: &str) -> String {
    format!("Signature keyId=\"{key_id}\",algorithm=\"hmac-sha1\",signature=\"{signature}\"")
}

fn date_now() -> String {
    chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn date_seconds_ago(seconds: i64) -> String {
    (chrono::Utc::now() - chrono::Duration::seconds(seconds))
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

#[tokio::test]
async fn signed_request_goes_through() {
    let upstream = spawn_echo_upstream().await;
    let gateway = build_gateway(&[signed_api_def(&upstream, 1000)]);
    gateway.sessions.update_session("9876", &hmac_session(), 60).await.unwrap();

    let date = date_now();
    let signing = format!("date:{}", escape(&date));
    let signature = encode_signature(&signing, SECRET);

    let (status, body) = send(
        &gateway.app,
        "GET",
        "/v1/",
        &[("date", &date), ("authorization", &auth_header("9876", &signature))],
        "",
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body was: {body}");
}

#[tokio::test]
async fn stale_date_is_rejected_with_400() {
    let upstream = spawn_echo_upstream().await;
    let gateway = build_gateway(&[signed_api_def(&upstream, 1000)]);
    gateway.sessions.update_session("9876", &hmac_session(), 60).await.unwrap();

    let date = date_seconds_ago(2);
    let signing = format!("date:{}", escape(&date));
    let signature = encode_signature(&signing, SECRET);

    let (status, body) = send(
        &gateway.app,
        "GET",
        "/v1/",
        &[("date", &date), ("authorization", &auth_header("9876", &signature))],
        "",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, r#"{"error":"Date skew too large"}"#);
}

#[tokio::test]
async fn unknown_key_id_is_rejected_with_400() {
    let upstream = spawn_echo_upstream().await;
    let gateway = build_gateway(&[signed_api_def(&upstream, 1000)]);
    gateway.sessions.update_session("9876", &hmac_session(), 60).await.unwrap();

    let date = date_now();
    let signing = format!("date:{}", escape(&date));
    let signature = encode_signature(&signing, SECRET);

    let (status, body) = send(
        &gateway.app,
        "GET",
        "/v1/",
        &[("date", &date), ("authorization", &auth_header("98765", &signature))],
        "",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, r#"{"error":"Key not found"}"#);
}

#[tokio::test]
async fn malformed_header_is_rejected_with_400() {
    let upstream = spawn_echo_upstream().await;
    let gateway = build_gateway(&[signed_api_def(&upstream, 1000)]);
    gateway.sessions.update_session("9876", &hmac_session(), 60).await.unwrap();

    let date = date_now();
    let signing = format!("date:{}", escape(&date));
    let signature = encode_signature(&signing, SECRET);
    let bad_header =
        format!("Signature keyID=\"9876\", algorithm=\"hmac-sha256\", signature=\"{signature}\"");

    let (status, body) = send(
        &gateway.app,
        "GET",
        "/v1/",
        &[("date", &date), ("authorization", &bad_header)],
        "",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, r#"{"error":"Header malformed"}"#);
}

#[tokio::test]
async fn tampered_signature_is_rejected_with_400() {
    let upstream = spawn_echo_upstream().await;
    let gateway = build_gateway(&[signed_api_def(&upstream, 1000)]);
    gateway.sessions.update_session("9876", &hmac_session(), 60).await.unwrap();

    let date = date_now();
    let signing = format!("date:{}", escape(&date));
    let mut signature = encode_signature(&signing, SECRET);
    let flipped = if signature.pop() == Some('A') { 'B' } else { 'A' };
    signature.push(flipped);

    let (status, body) = send(
        &gateway.app,
        "GET",
        "/v1/",
        &[("date", &date), ("authorization", &auth_header("9876", &signature))],
        "",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, r#"{"error":"Signature invalid"}"#);
}

#[tokio::test]
async fn missing_authorization_is_rejected_with_400() {
    let upstream = spawn_echo_upstream().await;
    let gateway = build_gateway(&[signed_api_def(&upstream, 1000)]);
    gateway.sessions.update_session("9876", &hmac_session(), 60).await.unwrap();

    let (status, body) = send(&gateway.app, "GET", "/v1/", &[("date", &date_now())], "").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, r#"{"error":"Authorization field missing"}"#);
}
