//! Signed-request authenticator.
//!
//! Validates an `Authorization` header of the shape
//! `Signature keyId="<k>",algorithm="hmac-sha1",signature="<sig>"`
//! where `<sig>` is the URL-escaped base64 HMAC-SHA1 of the canonical
//! signing string. Every failure in the ladder answers 400; that
//! status is a compatibility contract with deployed clients and must
//! not be "fixed" to 401.

use super::{ChainDeps, Decision, GatewayError, GatewayRequest, Processor, RequestContext};
use crate::{
    apispec::ApiSpec,
    events::{EventKind, EventMeta},
    health::HealthMetric,
    storage::StorageError,
};
use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

type HmacSha1 = Hmac<Sha1>;

const AUTH_SCHEME: &str = "Signature ";
const ALGORITHM: &str = "hmac-sha1";

struct SignatureFields {
    key_id: String,
    algorithm: String,
    signature: String,
    /// Space-separated header list; absent means sign the Date header
    /// alone.
    headers: Option<Vec<String>>,
}

/// Go-style query escaping: space becomes `+`, everything outside the
/// urlencoded-safe set is percent-encoded. Both signer and verifier
/// must use the same escaper, so this is part of the wire contract.
fn query_escape(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn parse_signature_header(value: &str) -> Option<SignatureFields> {
    let rest = value.strip_prefix(AUTH_SCHEME)?;

    let mut key_id = None;
    let mut algorithm = None;
    let mut signature = None;
    let mut headers = None;

    for field in rest.split(',') {
        let (name, raw) = field.trim().split_once('=')?;
        let unquoted = raw.trim().trim_matches('"');
        match name {
            "keyId" => key_id = Some(unquoted.to_string()),
            "algorithm" => algorithm = Some(unquoted.to_string()),
            "signature" => signature = Some(unquoted.to_string()),
            "headers" => {
                headers =
                    Some(unquoted.split_whitespace().map(str::to_string).collect::<Vec<_>>());
            }
            _ => {}
        }
    }

    Some(SignatureFields {
        key_id: key_id?,
        algorithm: algorithm?,
        signature: signature?,
        headers,
    })
}

pub struct HmacCheck {
    spec: Arc<ApiSpec>,
    deps: Arc<ChainDeps>,
}

impl HmacCheck {
    pub fn new(spec: Arc<ApiSpec>, deps: Arc<ChainDeps>) -> Self {
        Self { spec, deps }
    }

    fn report_failure(&self, req: &GatewayRequest, key: &str, message: &str) {
        self.deps.health.report(self.spec.api_id(), HealthMetric::KeyFailure);
        self.deps.events.fire(
            EventKind::AuthFailure,
            EventMeta {
                message: message.to_string(),
                path: req.path.clone(),
                origin: req.client_ip().unwrap_or_default(),
                key: key.to_string(),
            },
        );
    }

    /// Builds the canonical signing string. Without a headers list the
    /// string is exactly `date:<escaped Date value>`; with one, each
    /// line is `<lower(name)>:<escaped value>` in list order, and
    /// `(request-target)` expands to `<lower(method)> <path>?<query>`.
    fn signing_string(
        req: &GatewayRequest,
        fields: &SignatureFields,
    ) -> Result<String, GatewayError> {
        let Some(list) = &fields.headers else {
            let date = req.header("date").ok_or(GatewayError::HmacInvalid("Header malformed"))?;
            return Ok(format!("date:{}", query_escape(date)));
        };

        let mut lines = Vec::with_capacity(list.len());
        for name in list {
            let lower = name.to_lowercase();
            if lower == "(request-target)" {
                let target = match req.query.as_deref() {
                    Some(q) if !q.is_empty() => {
                        format!("{} {}?{}", req.method.as_str().to_lowercase(), req.path, q)
                    }
                    _ => format!("{} {}", req.method.as_str().to_lowercase(), req.path),
                };
                lines.push(format!("(request-target):{target}"));
            } else {
                let value =
                    req.header(&lower).ok_or(GatewayError::HmacInvalid("Header malformed"))?;
                lines.push(format!("{lower}:{}", query_escape(value)));
            }
        }
        Ok(lines.join("\n"))
    }

    fn check_clock_skew(&self, req: &GatewayRequest) -> Result<(), GatewayError> {
        let allowed_ms = self.spec.def.hmac_allowed_clock_skew;
        if allowed_ms <= 0 {
            return Ok(());
        }
        let date = req.header("date").ok_or(GatewayError::HmacInvalid("Header malformed"))?;
        let parsed = chrono::DateTime::parse_from_rfc2822(date)
            .map_err(|_| GatewayError::HmacInvalid("Header malformed"))?;
        let skew_ms = (chrono::Utc::now().timestamp_millis()
            - parsed.with_timezone(&chrono::Utc).timestamp_millis())
        .abs();
        if skew_ms > allowed_ms {
            debug!(skew_ms, allowed_ms, "signed request outside clock-skew tolerance");
            return Err(GatewayError::HmacInvalid("Date skew too large"));
        }
        Ok(())
    }
}

/// Escaped base64 HMAC-SHA1 of `signing` under `secret`; shared with
/// the test signers.
pub fn encode_signature(signing: &str, secret: &str) -> String {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(signing.as_bytes());
    let digest = mac.finalize().into_bytes();
    query_escape(&base64::engine::general_purpose::STANDARD.encode(digest))
}

#[async_trait]
impl Processor for HmacCheck {
    fn name(&self) -> &'static str {
        "hmac"
    }

    async fn process(
        &self,
        req: &mut GatewayRequest,
        ctx: &mut RequestContext,
    ) -> Result<Decision, GatewayError> {
        let header = req.header(self.spec.auth_header_name()).unwrap_or_default().to_string();
        if header.is_empty() {
            self.report_failure(req, "", "Signed request with no authorization header");
            return Err(GatewayError::HmacInvalid("Authorization field missing"));
        }

        let Some(fields) = parse_signature_header(&header) else {
            self.report_failure(req, "", "Malformed signature header");
            return Err(GatewayError::HmacInvalid("Header malformed"));
        };
        if fields.algorithm != ALGORITHM {
            self.report_failure(req, &fields.key_id, "Unsupported signature algorithm");
            return Err(GatewayError::HmacInvalid("Header malformed"));
        }

        let session = match self.deps.sessions.session(&fields.key_id).await {
            Ok(session) => session,
            Err(StorageError::NotFound) => {
                info!(key = %fields.key_id, "signed request for unknown key");
                self.report_failure(req, &fields.key_id, "Signed request with unknown key");
                return Err(GatewayError::HmacInvalid("Key not found"));
            }
            Err(e) => {
                warn!(error = %e, "session lookup failed, failing closed");
                return Err(GatewayError::Internal);
            }
        };
        if !session.hmac_enabled {
            self.report_failure(req, &fields.key_id, "Signed request for non-HMAC key");
            return Err(GatewayError::HmacInvalid("Key not found"));
        }

        let signing = Self::signing_string(req, &fields)?;
        self.check_clock_skew(req)?;

        let expected = encode_signature(&signing, &session.hmac_secret);
        let matches: bool = expected.as_bytes().ct_eq(fields.signature.as_bytes()).into();
        if !matches {
            info!(key = %fields.key_id, "signature mismatch");
            self.report_failure(req, &fields.key_id, "Signed request with invalid signature");
            return Err(GatewayError::HmacInvalid("Signature invalid"));
        }

        ctx.session = Some(session);
        ctx.auth_key = Some(fields.key_id);
        Ok(Decision::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{middleware::test_support, session::SessionState};
    use http::Method;

    const SECRET: &str = "9879879878787878";

    fn spec(clock_skew_ms: i64) -> Arc<ApiSpec> {
        let raw = format!(
            r#"{{
                "name": "Signed API", "api_id": "1", "org_id": "default",
                "enable_signature_checking": true,
                "hmac_allowed_clock_skew": {clock_skew_ms},
                "auth": {{"auth_header_name": "authorization"}},
                "version_data": {{"not_versioned": true, "versions": {{"Default": {{"name": "Default"}}}}}},
                "proxy": {{"listen_path": "/v1", "target_url": "http://upstream.example/"}}
            }}"#
        );
        Arc::new(ApiSpec::from_json(&raw).unwrap())
    }

    async fn deps_with_key(key: &str, hmac_enabled: bool) -> Arc<ChainDeps> {
        let deps = test_support::deps();
        let session = SessionState {
            hmac_enabled,
            hmac_secret: SECRET.to_string(),
            quota_max: -1,
            ..SessionState::default()
        };
        deps.sessions.update_session(key, &session, 60).await.unwrap();
        deps
    }

    fn signed_request(key_id: &str, date: &str, signature: &str) -> GatewayRequest {
        let mut req = test_support::request(Method::GET, "/");
        req.headers.insert("date", date.parse().unwrap());
        let header = format!(
            "Signature keyId=\"{key_id}\",algorithm=\"hmac-sha1\",signature=\"{signature}\""
        );
        req.headers.insert("authorization", header.parse().unwrap());
        req
    }

    fn now_rfc1123() -> String {
        chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
    }

    #[test]
    fn canonical_date_escaping_matches_contract() {
        assert_eq!(
            query_escape("Mon, 02 Jan 2006 15:04:05 MST"),
            "Mon%2C+02+Jan+2006+15%3A04%3A05+MST"
        );
    }

    #[tokio::test]
    async fn valid_signature_authenticates() {
        let deps = deps_with_key("9876", true).await;
        let check = HmacCheck::new(spec(1000), deps);

        let date = now_rfc1123();
        let signing = format!("date:{}", query_escape(&date));
        let mut req = signed_request("9876", &date, &encode_signature(&signing, SECRET));
        let mut ctx = RequestContext::default();

        let decision = check.process(&mut req, &mut ctx).await.unwrap();
        assert_eq!(decision, Decision::Continue);
        assert_eq!(ctx.auth_key.as_deref(), Some("9876"));
        assert!(ctx.session.is_some());
    }

    #[tokio::test]
    async fn stale_date_fails_with_skew_error() {
        let deps = deps_with_key("9876", true).await;
        let check = HmacCheck::new(spec(1000), deps);

        let stale = (chrono::Utc::now() - chrono::Duration::seconds(2))
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        let signing = format!("date:{}", query_escape(&stale));
        let mut req = signed_request("9876", &stale, &encode_signature(&signing, SECRET));

        let err = check.process(&mut req, &mut RequestContext::default()).await.unwrap_err();
        assert_eq!(err, GatewayError::HmacInvalid("Date skew too large"));
        assert_eq!(err.status(), http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn skew_check_disabled_when_configured_zero() {
        let deps = deps_with_key("9876", true).await;
        let check = HmacCheck::new(spec(0), deps);

        // The reference date from the signing contract, decades stale.
        let date = "Mon, 02 Jan 2006 15:04:05 MST";
        let signing = format!("date:{}", query_escape(date));
        assert_eq!(signing, "date:Mon%2C+02+Jan+2006+15%3A04%3A05+MST");

        let mut req = signed_request("9876", date, &encode_signature(&signing, SECRET));
        let decision = check.process(&mut req, &mut RequestContext::default()).await.unwrap();
        assert_eq!(decision, Decision::Continue);
    }

    #[tokio::test]
    async fn unknown_key_id_fails() {
        let deps = deps_with_key("9876", true).await;
        let check = HmacCheck::new(spec(1000), deps);

        let date = now_rfc1123();
        let signing = format!("date:{}", query_escape(&date));
        let mut req = signed_request("98765", &date, &encode_signature(&signing, SECRET));

        let err = check.process(&mut req, &mut RequestContext::default()).await.unwrap_err();
        assert_eq!(err, GatewayError::HmacInvalid("Key not found"));
    }

    #[tokio::test]
    async fn hmac_disabled_key_fails() {
        let deps = deps_with_key("9876", false).await;
        let check = HmacCheck::new(spec(1000), deps);

        let date = now_rfc1123();
        let signing = format!("date:{}", query_escape(&date));
        let mut req = signed_request("9876", &date, &encode_signature(&signing, SECRET));

        let err = check.process(&mut req, &mut RequestContext::default()).await.unwrap_err();
        assert_eq!(err, GatewayError::HmacInvalid("Key not found"));
    }

    #[tokio::test]
    async fn malformed_header_fails() {
        let deps = deps_with_key("9876", true).await;
        let check = HmacCheck::new(spec(1000), deps);

        let date = now_rfc1123();
        let signing = format!("date:{}", query_escape(&date));
        let sig = encode_signature(&signing, SECRET);

        // Wrong field casing and wrong algorithm, as a real client bug
        // would produce.
        let mut req = test_support::request(Method::GET, "/");
        req.headers.insert("date", date.parse().unwrap());
        let header =
            format!("Signature keyID=\"9876\", algorithm=\"hmac-sha256\", signature=\"{sig}\"");
        req.headers.insert("authorization", header.parse().unwrap());

        let err = check.process(&mut req, &mut RequestContext::default()).await.unwrap_err();
        assert_eq!(err, GatewayError::HmacInvalid("Header malformed"));
    }

    #[tokio::test]
    async fn missing_header_fails() {
        let deps = deps_with_key("9876", true).await;
        let check = HmacCheck::new(spec(1000), deps);
        let mut req = test_support::request(Method::GET, "/");
        let err = check.process(&mut req, &mut RequestContext::default()).await.unwrap_err();
        assert_eq!(err, GatewayError::HmacInvalid("Authorization field missing"));
    }

    #[tokio::test]
    async fn tampered_signature_fails() {
        let deps = deps_with_key("9876", true).await;
        let check = HmacCheck::new(spec(1000), deps);

        let date = now_rfc1123();
        let signing = format!("date:{}", query_escape(&date));
        let mut sig = encode_signature(&signing, SECRET);
        // Flip the last character.
        let flipped = if sig.pop() == Some('A') { 'B' } else { 'A' };
        sig.push(flipped);

        let mut req = signed_request("9876", &date, &sig);
        let err = check.process(&mut req, &mut RequestContext::default()).await.unwrap_err();
        assert_eq!(err, GatewayError::HmacInvalid("Signature invalid"));
    }

    #[tokio::test]
    async fn wrong_secret_fails() {
        let deps = deps_with_key("9876", true).await;
        let check = HmacCheck::new(spec(1000), deps);

        let date = now_rfc1123();
        let signing = format!("date:{}", query_escape(&date));
        let mut req = signed_request("9876", &date, &encode_signature(&signing, "wrong-secret"));

        let err = check.process(&mut req, &mut RequestContext::default()).await.unwrap_err();
        assert_eq!(err, GatewayError::HmacInvalid("Signature invalid"));
    }

    #[tokio::test]
    async fn headers_list_canonicalization() {
        let deps = deps_with_key("9876", true).await;
        let check = HmacCheck::new(spec(1000), deps);

        let date = now_rfc1123();
        let mut req = test_support::request(Method::GET, "/v1/widgets");
        req.query = Some("page=2".to_string());
        req.headers.insert("date", date.parse().unwrap());

        let signing = format!(
            "date:{}\n(request-target):get /v1/widgets?page=2",
            query_escape(&date)
        );
        let header = format!(
            "Signature keyId=\"9876\",algorithm=\"hmac-sha1\",headers=\"date (request-target)\",signature=\"{}\"",
            encode_signature(&signing, SECRET)
        );
        req.headers.insert("authorization", header.parse().unwrap());

        let decision = check.process(&mut req, &mut RequestContext::default()).await.unwrap();
        assert_eq!(decision, Decision::Continue);
    }

    #[test]
    fn signing_string_flip_changes_signature() {
        let signing = "date:Mon%2C+02+Jan+2006+15%3A04%3A05+MST";
        let a = encode_signature(signing, SECRET);
        let b = encode_signature(&signing.replace("Mon", "Tue"), SECRET);
        assert_ne!(a, b);
    }
}
