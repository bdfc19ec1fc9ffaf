//! API definitions and their compiled, routable form.
//!
//! An [`ApiDefinition`] is the JSON configuration of one proxied API;
//! an [`ApiSpec`] is that definition compiled for the hot path: path
//! patterns pre-split into segments, version expiry parsed, and the
//! listen path ready for prefix routing. Specs are immutable once
//! built; a reload builds a fresh [`SpecTable`] and swaps it in.

use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs, path::Path, sync::Arc};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("could not parse API definition: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("could not read API definition: {0}")]
    Io(#[from] std::io::Error),

    #[error("API definition has no versions")]
    NoVersions,
}

// ---------------------------------------------------------------------------
// Raw definition (serde mirror of the JSON files / control-plane bundle)
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiDefinition {
    pub name: String,
    pub api_id: String,
    pub org_id: String,
    pub definition: VersionLocation,
    pub auth: AuthDescriptor,
    pub enable_signature_checking: bool,
    /// Allowed clock skew for signed requests, in milliseconds. Zero or
    /// negative disables the skew check.
    pub hmac_allowed_clock_skew: i64,
    pub version_data: VersionData,
    pub event_handlers: EventHandlerTable,
    pub proxy: ProxySettings,
    pub enable_ip_whitelisting: bool,
    pub allowed_ips: Vec<String>,
    /// Post-admission request mutators run by the external script
    /// engine, in order.
    pub custom_middleware: Vec<CustomMiddlewareRef>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomMiddlewareRef {
    pub name: String,
    pub require_session: bool,
}

/// Where the requested version lives (currently always a header).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionLocation {
    pub location: String,
    pub key: String,
}

impl Default for VersionLocation {
    fn default() -> Self {
        Self { location: "header".to_string(), key: "version".to_string() }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthDescriptor {
    pub auth_header_name: String,
    pub use_param: bool,
}

impl Default for AuthDescriptor {
    fn default() -> Self {
        Self { auth_header_name: "authorization".to_string(), use_param: false }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionData {
    pub not_versioned: bool,
    pub versions: HashMap<String, VersionInfo>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionInfo {
    pub name: String,
    /// `YYYY-MM-DD HH:MM`; empty means the version never expires.
    pub expires: String,
    pub paths: PathLists,
    pub use_extended_paths: bool,
    pub extended_paths: ExtendedPathLists,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathLists {
    pub ignored: Vec<String>,
    pub white_list: Vec<String>,
    pub black_list: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtendedPathLists {
    pub ignored: Vec<ExtendedPath>,
    pub white_list: Vec<ExtendedPath>,
    pub black_list: Vec<ExtendedPath>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtendedPath {
    pub path: String,
    pub method_actions: HashMap<String, MethodAction>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodAction {
    /// `no_action`, `reply`, or an opaque action handed to user
    /// middleware.
    pub action: String,
    pub code: u16,
    pub data: String,
    pub headers: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventHandlerTable {
    /// Event name -> ordered handler descriptors.
    pub events: HashMap<String, Vec<EventHandlerDescriptor>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventHandlerDescriptor {
    pub handler_name: String,
    pub handler_meta: serde_json::Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub listen_path: String,
    pub target_url: String,
    pub strip_listen_path: bool,
    /// The inbound `Host` header is forwarded upstream unless this is
    /// switched off, in which case the target URL's host applies.
    pub preserve_host_header: bool,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            listen_path: String::new(),
            target_url: String::new(),
            strip_listen_path: false,
            preserve_host_header: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Compiled paths
// ---------------------------------------------------------------------------

/// Served instead of the upstream for `reply` method actions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockReply {
    pub code: u16,
    pub data: String,
    pub headers: Vec<(String, String)>,
}

/// What the path classifier decided for one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathDecision {
    /// No list matched; continue down the chain.
    Proceed,
    /// Ignored path: bypass auth and limits, go straight upstream.
    Ignore,
    /// Serve this configured reply, no upstream call.
    Reply(MockReply),
    /// A whitelist exists and the path is not on it.
    NotAllowed,
    /// The path is blacklisted.
    Forbidden,
}

#[derive(Clone, Debug)]
enum Segment {
    Literal(String),
    Param,
}

#[derive(Clone, Debug)]
struct CompiledPath {
    segments: Vec<Segment>,
    /// Characters of literal text before the first `{name}` segment;
    /// the tie-breaker for overlapping patterns.
    literal_prefix: usize,
    order: usize,
    method_actions: HashMap<String, MethodAction>,
}

fn split_segments(path: &str) -> Vec<&str> {
    path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect()
}

impl CompiledPath {
    fn compile(pattern: &str, order: usize, method_actions: HashMap<String, MethodAction>) -> Self {
        let mut segments = Vec::new();
        let mut literal_prefix = 0;
        let mut counting = true;
        for part in split_segments(pattern) {
            if part.starts_with('{') && part.ends_with('}') {
                segments.push(Segment::Param);
                counting = false;
            } else {
                if counting {
                    literal_prefix += part.len() + 1;
                }
                segments.push(Segment::Literal(part.to_string()));
            }
        }
        Self { segments, literal_prefix, order, method_actions }
    }

    /// Segment-wise prefix match; `{name}` consumes exactly one
    /// segment, and a trailing `{name}` may be empty.
    fn matches(&self, request: &[&str]) -> bool {
        if self.segments.len() > request.len() {
            let overhang = self.segments.len() - request.len();
            if overhang != 1 || !matches!(self.segments.last(), Some(Segment::Param)) {
                return false;
            }
        }
        self.segments.iter().zip(request.iter()).all(|(pattern, actual)| match pattern {
            Segment::Literal(expected) => expected == actual,
            Segment::Param => true,
        })
    }

    fn action_for(&self, method: &str) -> Option<&MethodAction> {
        self.method_actions.get(method)
    }
}

/// Picks the winning pattern: longest literal prefix, then earliest
/// defined.
fn best_match<'a>(entries: &'a [CompiledPath], request: &[&str]) -> Option<&'a CompiledPath> {
    entries
        .iter()
        .filter(|e| e.matches(request))
        .max_by(|a, b| {
            a.literal_prefix
                .cmp(&b.literal_prefix)
                .then_with(|| b.order.cmp(&a.order))
        })
}

#[derive(Clone, Debug)]
pub struct CompiledVersion {
    pub name: String,
    expires: Option<NaiveDateTime>,
    ignored: Vec<CompiledPath>,
    white: Vec<CompiledPath>,
    black: Vec<CompiledPath>,
}

const VERSION_EXPIRY_FORMAT: &str = "%Y-%m-%d %H:%M";

impl CompiledVersion {
    fn compile(name: &str, info: &VersionInfo) -> Self {
        let expires = if info.expires.is_empty() {
            None
        } else {
            match NaiveDateTime::parse_from_str(&info.expires, VERSION_EXPIRY_FORMAT) {
                Ok(at) => Some(at),
                Err(e) => {
                    warn!(version = %name, expires = %info.expires, error = %e,
                        "unparseable version expiry, treating as non-expiring");
                    None
                }
            }
        };

        let compile_list = |plain: &[String], extended: &[ExtendedPath]| {
            let mut out: Vec<CompiledPath> = plain
                .iter()
                .enumerate()
                .map(|(i, p)| CompiledPath::compile(p, i, HashMap::new()))
                .collect();
            let base = out.len();
            out.extend(extended.iter().enumerate().map(|(i, e)| {
                CompiledPath::compile(&e.path, base + i, e.method_actions.clone())
            }));
            out
        };

        Self {
            name: name.to_string(),
            expires,
            ignored: compile_list(&info.paths.ignored, &info.extended_paths.ignored),
            white: compile_list(&info.paths.white_list, &info.extended_paths.white_list),
            black: compile_list(&info.paths.black_list, &info.extended_paths.black_list),
        }
    }

    pub fn expired(&self) -> bool {
        self.expires
            .map(|at| Utc::now().naive_utc() > at)
            .unwrap_or(false)
    }

    fn reply_for(entry: &CompiledPath, method: &str) -> Option<MockReply> {
        entry.action_for(method).filter(|a| a.action == "reply").map(|a| MockReply {
            code: if a.code == 0 { 200 } else { a.code },
            data: a.data.clone(),
            headers: a.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        })
    }

    /// The ignored-list decision, consulted before authentication. An
    /// ignored entry with a `reply` action is served unauthenticated,
    /// any other ignored match bypasses the rest of the chain.
    pub fn ignored_decision(&self, path: &str, method: &str) -> Option<PathDecision> {
        let request = split_segments(path);
        best_match(&self.ignored, &request).map(|entry| match Self::reply_for(entry, method) {
            Some(reply) => PathDecision::Reply(reply),
            None => PathDecision::Ignore,
        })
    }

    /// The whitelist/blacklist decision, consulted after
    /// authentication. A non-empty whitelist is exclusive.
    pub fn allow_decision(&self, path: &str, method: &str) -> PathDecision {
        let request = split_segments(path);

        if !self.white.is_empty() {
            return match best_match(&self.white, &request) {
                Some(entry) => match Self::reply_for(entry, method) {
                    Some(reply) => PathDecision::Reply(reply),
                    None => PathDecision::Proceed,
                },
                None => PathDecision::NotAllowed,
            };
        }

        if best_match(&self.black, &request).is_some() {
            return PathDecision::Forbidden;
        }

        PathDecision::Proceed
    }

    /// Full classification in list order: ignored, whitelist,
    /// blacklist.
    pub fn classify(&self, path: &str, method: &str) -> PathDecision {
        match self.ignored_decision(path, method) {
            Some(decision) => decision,
            None => self.allow_decision(path, method),
        }
    }
}

// ---------------------------------------------------------------------------
// Compiled spec + routing table
// ---------------------------------------------------------------------------

pub struct ApiSpec {
    pub def: ApiDefinition,
    versions: HashMap<String, CompiledVersion>,
    default_version: String,
}

impl ApiSpec {
    pub fn from_definition(def: ApiDefinition) -> Result<Self, SpecError> {
        if def.version_data.versions.is_empty() {
            return Err(SpecError::NoVersions);
        }
        let versions: HashMap<String, CompiledVersion> = def
            .version_data
            .versions
            .iter()
            .map(|(name, info)| (name.clone(), CompiledVersion::compile(name, info)))
            .collect();
        // For a non-versioned API the map carries exactly one entry;
        // that entry is the default.
        let default_version = versions.keys().next().cloned().unwrap_or_default();
        Ok(Self { def, versions, default_version })
    }

    pub fn from_json(raw: &str) -> Result<Self, SpecError> {
        Self::from_definition(serde_json::from_str(raw)?)
    }

    pub fn api_id(&self) -> &str {
        &self.def.api_id
    }

    pub fn listen_path(&self) -> &str {
        &self.def.proxy.listen_path
    }

    pub fn auth_header_name(&self) -> &str {
        if self.def.auth.auth_header_name.is_empty() {
            "authorization"
        } else {
            &self.def.auth.auth_header_name
        }
    }

    /// The version a request asks for: the single default for
    /// non-versioned APIs, otherwise the configured version header.
    pub fn requested_version(&self, headers: &http::HeaderMap) -> Option<String> {
        if self.def.version_data.not_versioned {
            return Some(self.default_version.clone());
        }
        headers
            .get(self.def.definition.key.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    pub fn version(&self, name: &str) -> Option<&CompiledVersion> {
        self.versions.get(name)
    }
}

/// The live routing table: all specs, longest listen path first.
pub struct SpecTable {
    specs: Vec<Arc<ApiSpec>>,
}

impl SpecTable {
    pub fn new(specs: Vec<ApiSpec>) -> Self {
        let mut specs: Vec<Arc<ApiSpec>> = specs.into_iter().map(Arc::new).collect();
        specs.sort_by(|a, b| b.listen_path().len().cmp(&a.listen_path().len()));
        Self { specs }
    }

    pub fn route(&self, path: &str) -> Option<Arc<ApiSpec>> {
        self.specs.iter().find(|s| path.starts_with(s.listen_path())).cloned()
    }

    pub fn specs(&self) -> &[Arc<ApiSpec>] {
        &self.specs
    }
}

/// Reads every `*.json` definition in a directory (boot-time loading).
pub fn load_definitions_dir(dir: &Path) -> Result<Vec<ApiDefinition>, SpecError> {
    let mut defs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let raw = fs::read_to_string(&path)?;
        match serde_json::from_str(&raw) {
            Ok(def) => defs.push(def),
            Err(e) => warn!(file = %path.display(), error = %e, "skipping unparseable API definition"),
        }
    }
    Ok(defs)
}

/// Parses the JSON array bundle returned by the control plane.
pub fn parse_definition_bundle(raw: &str) -> Result<Vec<ApiDefinition>, SpecError> {
    Ok(serde_json::from_str(raw)?)
}
