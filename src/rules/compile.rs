//! Ahead-of-time compilation of rule and endpoint documents
//!
//! Every expression-valued field is compiled into a [`Program`] at load
//! time; compiled definitions are immutable and shared across concurrent
//! requests. A compilation failure (or a dangling rule reference) is
//! reported as an error so the snapshot builder can quarantine the owning
//! definition instead of failing the server.

use ipnet::IpNet;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::engine::{Program, TemplateEngine};
use crate::error::{Error, Result};
use crate::rules::model::{
    AllowSourceDoc, AllowSourceKind, BackendApiDoc, ConditionsDoc, EndpointDoc, MatchGroupDoc,
    MatcherKind, PaginationKind, ResponseCategoryDoc, RuleDoc,
};

/// A compiled credential matcher
#[derive(Debug)]
pub struct CompiledMatcher {
    /// Matcher kind
    pub kind: MatcherKind,

    /// Lowercased header or query parameter name
    pub name: Option<String>,
}

/// A compiled credential match group
#[derive(Debug)]
pub struct CompiledMatchGroup {
    /// All matchers must find a non-empty value
    pub matchers: Vec<CompiledMatcher>,

    /// Header name → value program applied when the group wins
    pub forward_headers: Vec<(String, Program)>,

    /// Query name → value program applied when the group wins
    pub forward_query: Vec<(String, Program)>,
}

/// Union of credential source names across all match groups
///
/// Everything here is stripped from the curated view before a backend call,
/// whether or not its group won.
#[derive(Debug, Default)]
pub struct CredentialSources {
    /// The `authorization` header is a declared source
    pub authorization: bool,

    /// Declared header sources (lowercased)
    pub headers: BTreeSet<String>,

    /// Declared query sources (lowercased)
    pub query: BTreeSet<String>,
}

/// Pagination settings for a backend call
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    /// Maximum pages to fetch
    pub max_pages: usize,
}

/// A compiled backend request descriptor
#[derive(Debug)]
pub struct CompiledBackendApi {
    /// HTTP method, uppercased
    pub method: String,

    /// URL program
    pub url: Program,

    /// Header name → value program
    pub headers: Vec<(String, Program)>,

    /// Query name → value program
    pub query: Vec<(String, Program)>,

    /// Inline body program
    pub body: Option<Program>,

    /// Body file path program (sandbox-resolved at request time)
    pub body_file: Option<Program>,

    /// Accepted status codes
    pub accepted_status: BTreeSet<u16>,

    /// Link-header pagination, when enabled
    pub pagination: Option<Pagination>,
}

/// Compiled outcome conditions
#[derive(Debug)]
pub struct CompiledConditions {
    /// `pass` condition programs
    pub pass: Vec<Program>,

    /// `fail` condition programs
    pub fail: Vec<Program>,

    /// `error` condition programs
    pub error: Vec<Program>,

    /// A no-match over the rule's groups is acceptable rather than an error
    pub accept_no_match: bool,
}

/// Rule cache policy
#[derive(Debug, Clone, Copy)]
pub struct RuleCachePolicy {
    /// Honor backend `Cache-Control`
    pub follow_cache_control: bool,

    /// Manual TTL for `pass`, seconds
    pub pass_ttl: Option<u64>,

    /// Manual TTL for `fail`, seconds
    pub fail_ttl: Option<u64>,

    /// Include the upstream-variables hash in the Tier-1 key
    pub strict: bool,
}

/// Outcome-scoped response header programs
#[derive(Debug, Default)]
pub struct CompiledRuleResponses {
    /// Merged on `pass`
    pub pass: Vec<(String, Program)>,

    /// Merged on `fail`
    pub fail: Vec<(String, Program)>,

    /// Merged on `error`
    pub error: Vec<(String, Program)>,
}

/// A compiled, immutable rule shared by concurrent requests
#[derive(Debug)]
pub struct RuleDefinition {
    /// Rule name
    pub name: String,

    /// Human-readable description
    pub description: Option<String>,

    /// Ordered credential match groups
    pub match_groups: Vec<CompiledMatchGroup>,

    /// Union of credential sources over all groups
    pub credential_sources: CredentialSources,

    /// Backend descriptor, when the rule calls one
    pub backend: Option<CompiledBackendApi>,

    /// Outcome conditions
    pub conditions: CompiledConditions,

    /// Local variable programs, in declaration order
    pub locals: Vec<(String, Program)>,

    /// Export variable programs, in declaration order
    pub exports: Vec<(String, Program)>,

    /// Outcome-scoped response header programs
    pub responses: CompiledRuleResponses,

    /// Cache policy
    pub cache: RuleCachePolicy,
}

/// One permitted credential source for admission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowSource {
    /// The `Authorization` header (bearer or basic)
    Authorization,
    /// A named request header
    Header(String),
    /// A named query parameter
    Query(String),
    /// Anonymous requests are admitted
    None,
}

/// `WWW-Authenticate` challenge
#[derive(Debug, Clone)]
pub struct Challenge {
    /// "basic" or "bearer"
    pub scheme: String,

    /// Realm attribute
    pub realm: String,

    /// Charset attribute (basic only)
    pub charset: Option<String>,
}

impl Challenge {
    /// Render the `WWW-Authenticate` header value
    pub fn header_value(&self) -> String {
        let scheme = if self.scheme.eq_ignore_ascii_case("basic") {
            "Basic"
        } else {
            "Bearer"
        };
        let mut value = format!("{scheme} realm=\"{}\"", self.realm);
        if let Some(charset) = &self.charset {
            value.push_str(&format!(", charset=\"{charset}\""));
        }
        value
    }
}

/// Compiled admission policy
#[derive(Debug)]
pub struct AdmissionPolicy {
    /// A credential is required
    pub required: bool,

    /// Permitted sources, walked in order
    pub allow: Vec<AllowSource>,

    /// Challenge for 401 responses
    pub challenge: Challenge,
}

impl AdmissionPolicy {
    /// The allow list permits anonymous requests
    pub fn allows_none(&self) -> bool {
        self.allow.iter().any(|s| matches!(s, AllowSource::None))
    }
}

/// Compiled request-view curation
#[derive(Debug, Default)]
pub struct ForwardRequestPolicy {
    /// When non-empty, only these headers survive (lowercased)
    pub allow: BTreeSet<String>,

    /// Headers removed (lowercased)
    pub strip: BTreeSet<String>,
}

/// Compiled response rendering for one outcome category
#[derive(Debug, Default)]
pub struct CompiledResponseCategory {
    /// Status override
    pub status: Option<u16>,

    /// Inline body program
    pub body: Option<Program>,

    /// Body file path program
    pub body_file: Option<Program>,

    /// When non-empty, only these response headers survive (lowercased)
    pub allow: BTreeSet<String>,

    /// Response headers removed (lowercased)
    pub strip: BTreeSet<String>,

    /// Custom header programs merged last; empty render removes the header
    pub custom: Vec<(String, Program)>,
}

/// Compiled per-outcome response policy
#[derive(Debug, Default)]
pub struct CompiledResponsePolicy {
    /// `pass` category
    pub pass: CompiledResponseCategory,

    /// `fail` category
    pub fail: CompiledResponseCategory,

    /// `error` category
    pub error: CompiledResponseCategory,
}

/// Endpoint TTL ceilings
#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointCachePolicy {
    /// Ceiling for `pass` decisions, seconds
    pub pass_ttl: Option<u64>,

    /// Ceiling for `fail` decisions, seconds
    pub fail_ttl: Option<u64>,
}

/// A compiled, immutable endpoint shared by concurrent requests
#[derive(Debug)]
pub struct EndpointDefinition {
    /// Endpoint name
    pub name: String,

    /// Human-readable description
    pub description: Option<String>,

    /// Endpoint variable programs, in declaration order
    pub variables: Vec<(String, Program)>,

    /// Admission policy
    pub authentication: AdmissionPolicy,

    /// Trusted proxy CIDRs
    pub trusted_proxies: Vec<IpNet>,

    /// Development mode softens forwarding-header failures
    pub development_mode: bool,

    /// Forward proxy metadata headers downstream
    pub forward_proxy_headers: bool,

    /// Curation of the request view
    pub forward_request: ForwardRequestPolicy,

    /// Ordered, resolved rule chain
    pub rules: Vec<Arc<RuleDefinition>>,

    /// Per-outcome response templates
    pub response_policy: CompiledResponsePolicy,

    /// TTL ceilings
    pub cache: EndpointCachePolicy,
}

/// Compile one rule document
pub fn compile_rule(
    name: &str,
    doc: &RuleDoc,
    templates: &TemplateEngine,
) -> Result<RuleDefinition> {
    let mut match_groups = Vec::with_capacity(doc.auth.len());
    let mut credential_sources = CredentialSources::default();
    for group in &doc.auth {
        match_groups.push(compile_match_group(group, &mut credential_sources, templates)?);
    }

    let backend = doc
        .backend_api
        .as_ref()
        .map(|api| compile_backend_api(api, templates))
        .transpose()?;

    Ok(RuleDefinition {
        name: name.to_string(),
        description: doc.description.clone(),
        match_groups,
        credential_sources,
        backend,
        conditions: compile_conditions(&doc.conditions, templates)?,
        locals: compile_named_programs(doc.variables.local.iter(), templates)?,
        exports: compile_named_programs(doc.variables.export.iter(), templates)?,
        responses: CompiledRuleResponses {
            pass: compile_named_templates(doc.responses.pass.iter(), templates)?,
            fail: compile_named_templates(doc.responses.fail.iter(), templates)?,
            error: compile_named_templates(doc.responses.error.iter(), templates)?,
        },
        cache: RuleCachePolicy {
            follow_cache_control: doc.cache.follow_cache_control,
            pass_ttl: doc.cache.pass_ttl,
            fail_ttl: doc.cache.fail_ttl,
            strict: doc.cache.strict,
        },
    })
}

fn compile_match_group(
    group: &MatchGroupDoc,
    sources: &mut CredentialSources,
    templates: &TemplateEngine,
) -> Result<CompiledMatchGroup> {
    let mut matchers = Vec::with_capacity(group.matchers.len());
    for matcher in &group.matchers {
        let name = match matcher.kind {
            MatcherKind::Bearer | MatcherKind::Basic => {
                sources.authorization = true;
                None
            }
            MatcherKind::Header => {
                let name = required_name(matcher.name.as_deref(), "header matcher")?;
                sources.headers.insert(name.clone());
                Some(name)
            }
            MatcherKind::Query => {
                let name = required_name(matcher.name.as_deref(), "query matcher")?;
                sources.query.insert(name.clone());
                Some(name)
            }
        };
        matchers.push(CompiledMatcher {
            kind: matcher.kind,
            name,
        });
    }

    Ok(CompiledMatchGroup {
        matchers,
        forward_headers: compile_named_templates(group.forward_as.headers.iter(), templates)?,
        forward_query: compile_named_templates(group.forward_as.query.iter(), templates)?,
    })
}

fn compile_backend_api(
    api: &BackendApiDoc,
    templates: &TemplateEngine,
) -> Result<CompiledBackendApi> {
    Ok(CompiledBackendApi {
        method: api.method.to_ascii_uppercase(),
        url: Program::template(&api.url, templates)?,
        headers: compile_named_templates(api.headers.iter(), templates)?,
        query: compile_named_templates(api.query.iter(), templates)?,
        body: api
            .body
            .as_deref()
            .map(|b| Program::template(b, templates))
            .transpose()?,
        body_file: api
            .body_file
            .as_deref()
            .map(|b| Program::template(b, templates))
            .transpose()?,
        accepted_status: api.accepted_status.iter().copied().collect(),
        pagination: api.pagination.as_ref().map(|p| match p.kind {
            PaginationKind::LinkHeader => Pagination {
                max_pages: p.max_pages,
            },
        }),
    })
}

fn compile_conditions(
    conditions: &ConditionsDoc,
    templates: &TemplateEngine,
) -> Result<CompiledConditions> {
    Ok(CompiledConditions {
        pass: compile_programs(&conditions.pass, templates)?,
        fail: compile_programs(&conditions.fail, templates)?,
        error: compile_programs(&conditions.error, templates)?,
        accept_no_match: conditions.accept_no_match,
    })
}

fn compile_programs(sources: &[String], templates: &TemplateEngine) -> Result<Vec<Program>> {
    sources
        .iter()
        .map(|s| Program::compile(s, templates))
        .collect()
}

fn compile_named_programs<'a>(
    entries: impl Iterator<Item = (&'a String, &'a String)>,
    templates: &TemplateEngine,
) -> Result<Vec<(String, Program)>> {
    entries
        .map(|(name, source)| Ok((name.clone(), Program::compile(source, templates)?)))
        .collect()
}

fn compile_named_templates<'a>(
    entries: impl Iterator<Item = (&'a String, &'a String)>,
    templates: &TemplateEngine,
) -> Result<Vec<(String, Program)>> {
    entries
        .map(|(name, source)| Ok((name.clone(), Program::template(source, templates)?)))
        .collect()
}

fn required_name(name: Option<&str>, what: &str) -> Result<String> {
    name.filter(|n| !n.is_empty())
        .map(|n| n.to_ascii_lowercase())
        .ok_or_else(|| Error::InvalidConfig(format!("{what} requires a name")))
}

/// Compile one endpoint document, resolving its rule references
pub fn compile_endpoint(
    name: &str,
    doc: &EndpointDoc,
    rules: &std::collections::BTreeMap<String, Arc<RuleDefinition>>,
    templates: &TemplateEngine,
) -> Result<EndpointDefinition> {
    let mut allow = Vec::with_capacity(doc.authentication.allow.len());
    for source in &doc.authentication.allow {
        allow.push(compile_allow_source(source)?);
    }

    let mut chain = Vec::with_capacity(doc.rules.len());
    for rule_name in &doc.rules {
        let rule = rules
            .get(rule_name)
            .ok_or_else(|| Error::InvalidConfig(format!("references missing rule {rule_name:?}")))?;
        chain.push(Arc::clone(rule));
    }

    Ok(EndpointDefinition {
        name: name.to_string(),
        description: doc.description.clone(),
        variables: compile_named_programs(doc.variables.iter(), templates)?,
        authentication: AdmissionPolicy {
            required: doc.authentication.required,
            allow,
            challenge: Challenge {
                scheme: doc.authentication.challenge.scheme.clone(),
                realm: doc.authentication.challenge.realm.clone(),
                charset: doc.authentication.challenge.charset.clone(),
            },
        },
        trusted_proxies: doc.forward_proxy_policy.trusted_proxies.clone(),
        development_mode: doc.forward_proxy_policy.development_mode,
        forward_proxy_headers: doc.forward_proxy_policy.forward_proxy_headers,
        forward_request: ForwardRequestPolicy {
            allow: lowered(&doc.forward_request_policy.allow_headers),
            strip: lowered(&doc.forward_request_policy.strip_headers),
        },
        rules: chain,
        response_policy: CompiledResponsePolicy {
            pass: compile_response_category(&doc.response_policy.pass, templates)?,
            fail: compile_response_category(&doc.response_policy.fail, templates)?,
            error: compile_response_category(&doc.response_policy.error, templates)?,
        },
        cache: EndpointCachePolicy {
            pass_ttl: doc.cache.pass_ttl,
            fail_ttl: doc.cache.fail_ttl,
        },
    })
}

fn compile_allow_source(doc: &AllowSourceDoc) -> Result<AllowSource> {
    Ok(match doc.kind {
        AllowSourceKind::Authorization => AllowSource::Authorization,
        AllowSourceKind::Header => {
            AllowSource::Header(required_name(doc.name.as_deref(), "header allow source")?)
        }
        AllowSourceKind::Query => {
            AllowSource::Query(required_name(doc.name.as_deref(), "query allow source")?)
        }
        AllowSourceKind::None => AllowSource::None,
    })
}

fn compile_response_category(
    doc: &ResponseCategoryDoc,
    templates: &TemplateEngine,
) -> Result<CompiledResponseCategory> {
    Ok(CompiledResponseCategory {
        status: doc.status,
        body: doc
            .body
            .as_deref()
            .map(|b| Program::template(b, templates))
            .transpose()?,
        body_file: doc
            .body_file
            .as_deref()
            .map(|b| Program::template(b, templates))
            .transpose()?,
        allow: lowered(&doc.headers.allow),
        strip: lowered(&doc.headers.strip),
        custom: compile_named_templates(doc.headers.custom.iter(), templates)?,
    })
}

fn lowered(names: &[String]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_ascii_lowercase()).collect()
}
