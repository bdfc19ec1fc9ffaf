//! User-scripted request transformation.
//!
//! Bridges the chain to the external script engine: the request and
//! session are serialized to JSON, the named script runs in the engine,
//! and the returned mutations are applied to the live request. Script
//! failures are logged and the request continues untouched (fail-open),
//! so a broken user script cannot take an API down.

use super::{ChainDeps, Decision, GatewayError, GatewayRequest, Processor, RequestContext};
use crate::{
    apispec::CustomMiddlewareRef,
    plugins::{ScriptEngine, ScriptOutcome, ScriptRequest},
    session::SessionManager,
};
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderName, HeaderValue};
use std::sync::Arc;
use tracing::warn;

pub struct TransformProcessor {
    engine: Arc<dyn ScriptEngine>,
    mw: CustomMiddlewareRef,
    sessions: Arc<SessionManager>,
}

impl TransformProcessor {
    pub fn new(
        engine: Arc<dyn ScriptEngine>,
        mw: CustomMiddlewareRef,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self { engine, mw, sessions }
    }

    pub fn from_deps(spec_mw: CustomMiddlewareRef, deps: &Arc<ChainDeps>) -> Option<Self> {
        deps.script_engine
            .as_ref()
            .map(|engine| Self::new(engine.clone(), spec_mw, deps.sessions.clone()))
    }

    fn snapshot(req: &GatewayRequest) -> ScriptRequest {
        ScriptRequest {
            headers: req
                .headers
                .iter()
                .map(|(k, v)| {
                    (
                        k.as_str().to_string(),
                        vec![v.to_str().unwrap_or_default().to_string()],
                    )
                })
                .collect(),
            body: String::from_utf8_lossy(&req.body).into_owned(),
            url: req.path.clone(),
            ..ScriptRequest::default()
        }
    }

    fn apply(outcome: &ScriptOutcome, req: &mut GatewayRequest) {
        let mutated = &outcome.request;

        req.body = Bytes::from(mutated.body.clone().into_bytes());
        if !mutated.url.is_empty() {
            req.path = mutated.url.clone();
        }

        for name in &mutated.delete_headers {
            req.headers.remove(name.as_str());
        }
        for (name, value) in &mutated.set_headers {
            match (name.parse::<HeaderName>(), HeaderValue::from_str(value)) {
                (Ok(name), Ok(value)) => {
                    req.headers.insert(name, value);
                }
                _ => warn!(header = %name, "script produced an unusable header"),
            }
        }

        if !mutated.add_params.is_empty() || !mutated.delete_params.is_empty() {
            let mut params: Vec<(String, String)> = req
                .query
                .as_deref()
                .map(|q| {
                    url::form_urlencoded::parse(q.as_bytes())
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect()
                })
                .unwrap_or_default();
            params.retain(|(k, _)| !mutated.delete_params.contains(k));
            for (k, v) in &mutated.add_params {
                params.retain(|(existing, _)| existing != k);
                params.push((k.clone(), v.clone()));
            }
            let encoded: String = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(params)
                .finish();
            req.query = (!encoded.is_empty()).then_some(encoded);
        }
    }
}

#[async_trait]
impl Processor for TransformProcessor {
    fn name(&self) -> &'static str {
        "transform"
    }

    async fn process(
        &self,
        req: &mut GatewayRequest,
        ctx: &mut RequestContext,
    ) -> Result<Decision, GatewayError> {
        let request_json = match serde_json::to_string(&Self::snapshot(req)) {
            Ok(json) => json,
            Err(e) => {
                warn!(script = %self.mw.name, error = %e, "request snapshot failed");
                return Ok(Decision::Continue);
            }
        };

        let session_json = if self.mw.require_session {
            ctx.session
                .as_ref()
                .and_then(|s| serde_json::to_string(s).ok())
                .unwrap_or_else(|| "{}".to_string())
        } else {
            "{}".to_string()
        };

        let returned = match self.engine.run(&self.mw.name, &request_json, &session_json).await {
            Ok(returned) => returned,
            Err(e) => {
                warn!(script = %self.mw.name, error = %e, "script run failed");
                return Ok(Decision::Continue);
            }
        };

        let outcome: ScriptOutcome = match serde_json::from_str(&returned) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(script = %self.mw.name, error = %e, "script returned undecodable data");
                return Ok(Decision::Continue);
            }
        };

        Self::apply(&outcome, req);

        if self.mw.require_session {
            if let (Some(session), Some(key)) = (ctx.session.as_mut(), ctx.auth_key.as_deref()) {
                session.meta_data = outcome.session_meta;
                if let Err(e) = self.sessions.update_session(key, session, 0).await {
                    warn!(script = %self.mw.name, error = %e, "session metadata write failed");
                }
            }
        }

        Ok(Decision::Continue)
    }
}
