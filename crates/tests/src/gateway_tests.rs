//! Chain scenarios over the full router: throttling, quotas, access
//! rights, path policy and query-parameter auth.

use crate::support::{
    body_json, build_gateway, open_session, quota_session, random_key, send,
    spawn_echo_upstream, throttled_session,
};
use http::StatusCode;

fn token_api_def(api_id: &str, listen: &str, target: &str, strip: bool) -> String {
    format!(
        r#"{{
            "name": "Example API",
            "api_id": "{api_id}",
            "org_id": "default",
            "definition": {{"location": "header", "key": "version"}},
            "auth": {{"auth_header_name": "authorization"}},
            "version_data": {{
                "not_versioned": true,
                "versions": {{
                    "v1": {{"name": "v1", "expires": "3000-01-02 15:04"}}
                }}
            }},
            "proxy": {{"listen_path": "{listen}", "target_url": "{target}", "strip_listen_path": {strip}}}
        }}"#
    )
}

#[tokio::test]
async fn throttled_key_sees_429_after_the_limit() {
    let upstream = spawn_echo_upstream().await;
    let gateway = build_gateway(&[token_api_def("1", "/v1", &upstream, false)]);

    let key = random_key(10);
    gateway.sessions.update_session(&key, &throttled_session(), 60).await.unwrap();

    let mut statuses = Vec::new();
    let mut fourth_body = String::new();
    for i in 0..6 {
        let (status, body) =
            send(&gateway.app, "GET", "/v1/ping", &[("authorization", &key)], "").await;
        if i == 3 {
            fourth_body = body;
        }
        statuses.push(status.as_u16());
    }

    assert_eq!(statuses, vec![200, 200, 200, 429, 429, 429]);
    assert_eq!(fourth_body, r#"{"error":"Rate limit exceeded"}"#);
}

#[tokio::test]
async fn quota_is_conserved_and_reported() {
    let upstream = spawn_echo_upstream().await;
    let gateway = build_gateway(&[token_api_def("1", "/v1", &upstream, false)]);

    let key = random_key(10);
    gateway.sessions.update_session(&key, &quota_session(), 60).await.unwrap();

    let (first, _) = send(&gateway.app, "GET", "/v1/thing", &[("authorization", &key)], "").await;
    let (second, _) = send(&gateway.app, "GET", "/v1/thing", &[("authorization", &key)], "").await;
    let (third, body) =
        send(&gateway.app, "GET", "/v1/thing", &[("authorization", &key)], "").await;

    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::OK);
    assert_eq!(third, StatusCode::FORBIDDEN);
    assert_eq!(body, r#"{"error":"Quota exceeded"}"#);
}

#[tokio::test]
async fn failed_auth_mutates_no_admission_state() {
    let upstream = spawn_echo_upstream().await;
    let gateway = build_gateway(&[token_api_def("1", "/v1", &upstream, false)]);

    let key = random_key(10);
    gateway.sessions.update_session(&key, &quota_session(), 60).await.unwrap();

    // Expired key: rejected before the rate/quota stage.
    let mut expired = quota_session();
    expired.expires = chrono::Utc::now().timestamp() - 10;
    let expired_key = random_key(10);
    gateway.sessions.update_session(&expired_key, &expired, 60).await.unwrap();

    let (status, _) =
        send(&gateway.app, "GET", "/v1/thing", &[("authorization", &expired_key)], "").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let stored = gateway.sessions.session(&expired_key).await.unwrap();
    assert_eq!(stored.quota_remaining, 2, "declined auth must not touch quota");

    // Unknown key: no session state exists to mutate, and the good
    // key's counters stay put.
    let (status, _) =
        send(&gateway.app, "GET", "/v1/thing", &[("authorization", "no-such-key")], "").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(gateway.sessions.session(&key).await.unwrap().quota_remaining, 2);
}

#[tokio::test]
async fn missing_credential_is_access_denied() {
    let upstream = spawn_echo_upstream().await;
    let gateway = build_gateway(&[token_api_def("1", "/v1", &upstream, false)]);

    let (status, body) = send(&gateway.app, "GET", "/v1/thing", &[], "").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, r#"{"error":"Access denied"}"#);
}

#[tokio::test]
async fn unrouted_path_is_not_found() {
    let gateway = build_gateway(&[token_api_def("1", "/v1", "http://127.0.0.1:1/", false)]);
    let (status, _) = send(&gateway.app, "GET", "/elsewhere", &[], "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

fn versioned_def(target: &str) -> String {
    format!(
        r#"{{
            "name": "Versioned API",
            "api_id": "9991",
            "org_id": "default",
            "definition": {{"location": "header", "key": "version"}},
            "auth": {{"auth_header_name": "authorization"}},
            "version_data": {{
                "not_versioned": false,
                "versions": {{
                    "v1": {{"name": "v1", "expires": "3000-01-02 15:04"}}
                }}
            }},
            "proxy": {{"listen_path": "/v1", "target_url": "{target}", "strip_listen_path": false}}
        }}"#
    )
}

fn versioned_session(versions: &[&str]) -> tollgate_core::session::SessionState {
    let mut session = open_session();
    session.access_rights.insert(
        "9991".to_string(),
        tollgate_core::session::AccessDefinition {
            api_name: "Versioned API".to_string(),
            api_id: "9991".to_string(),
            versions: versions.iter().map(|v| v.to_string()).collect(),
        },
    );
    session
}

#[tokio::test]
async fn granted_version_goes_through() {
    let upstream = spawn_echo_upstream().await;
    let gateway = build_gateway(&[versioned_def(&upstream)]);
    gateway.sessions.update_session("1234", &versioned_session(&["v1"]), 60).await.unwrap();

    let (status, _) = send(
        &gateway.app,
        "GET",
        "/v1/about",
        &[("authorization", "1234"), ("version", "v1")],
        "",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn ungranted_version_is_denied() {
    let upstream = spawn_echo_upstream().await;
    let gateway = build_gateway(&[versioned_def(&upstream)]);
    gateway.sessions.update_session("1234", &versioned_session(&["v2"]), 60).await.unwrap();

    let (status, _) = send(
        &gateway.app,
        "GET",
        "/v1/about",
        &[("authorization", "1234"), ("version", "v1")],
        "",
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn param_based_auth_preserves_body_and_query() {
    let upstream = spawn_echo_upstream().await;
    let def = format!(
        r#"{{
            "name": "Path API",
            "api_id": "9992",
            "org_id": "default",
            "auth": {{"use_param": true, "auth_header_name": "authorization"}},
            "version_data": {{
                "not_versioned": true,
                "versions": {{"default": {{"name": "default", "expires": "3000-01-02 15:04"}}}}
            }},
            "proxy": {{"listen_path": "/pathBased/", "target_url": "{upstream}", "strip_listen_path": true}}
        }}"#
    );
    let gateway = build_gateway(&[def]);
    gateway.sessions.update_session("54321", &open_session(), 60).await.unwrap();

    let (status, body) = send(
        &gateway.app,
        "POST",
        "/pathBased/post?authorization=54321",
        &[("content-type", "application/x-www-form-urlencoded")],
        "foo=swiggetty&bar=swoggetty&baz=swoogetty",
    )
    .await;

    assert_eq!(status, StatusCode::OK, "body was: {body}");
    let echoed = body_json(&body);
    assert_eq!(echoed["args"]["authorization"], "54321");
    assert_eq!(echoed["form"]["foo"], "swiggetty");
    assert_eq!(echoed["form"]["bar"], "swoggetty");
    assert_eq!(echoed["form"]["baz"], "swoogetty");
    assert_eq!(echoed["path"], "/post");
}

fn extended_paths_def(target: &str) -> String {
    format!(
        r#"{{
            "name": "Extended API",
            "api_id": "1",
            "org_id": "default",
            "auth": {{"auth_header_name": "authorization"}},
            "version_data": {{
                "not_versioned": true,
                "versions": {{
                    "Default": {{
                        "name": "Default",
                        "expires": "3000-01-02 15:04",
                        "use_extended_paths": true,
                        "extended_paths": {{
                            "ignored": [
                                {{"path": "/v1/ignored/noregex", "method_actions": {{
                                    "GET": {{"action": "no_action", "code": 200, "data": "", "headers": {{}}}}}}}}
                            ],
                            "white_list": [
                                {{"path": "v1/allowed/whitelist/literal", "method_actions": {{
                                    "GET": {{"action": "no_action", "code": 200, "data": "", "headers": {{}}}}}}}},
                                {{"path": "v1/allowed/whitelist/reply/{{id}}", "method_actions": {{
                                    "GET": {{"action": "reply", "code": 200, "data": "flump",
                                            "headers": {{"x-mock": "1"}}}}}}}}
                            ],
                            "black_list": []
                        }}
                    }}
                }}
            }},
            "proxy": {{"listen_path": "/v1", "target_url": "{target}", "strip_listen_path": false}}
        }}"#
    )
}

#[tokio::test]
async fn ignored_path_passes_with_no_credentials() {
    let upstream = spawn_echo_upstream().await;
    let gateway = build_gateway(&[extended_paths_def(&upstream)]);

    let (status, _) = send(&gateway.app, "GET", "/v1/ignored/noregex", &[], "").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn whitelist_reply_is_served_verbatim() {
    let gateway = build_gateway(&[extended_paths_def("http://127.0.0.1:1/")]);
    gateway.sessions.update_session("1234", &open_session(), 60).await.unwrap();

    let (status, body) = send(
        &gateway.app,
        "GET",
        "/v1/allowed/whitelist/reply/42",
        &[("authorization", "1234")],
        "",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "flump");
}

#[tokio::test]
async fn whitelist_excludes_everything_else() {
    let upstream = spawn_echo_upstream().await;
    let gateway = build_gateway(&[extended_paths_def(&upstream)]);
    gateway.sessions.update_session("1234", &open_session(), 60).await.unwrap();

    let (status, _) = send(
        &gateway.app,
        "GET",
        "/v1/not/on/the/list",
        &[("authorization", "1234")],
        "",
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
