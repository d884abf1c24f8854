//! The active endpoint set and its construction
//!
//! A snapshot is built once at startup and rebuilt on every reload. It is
//! immutable; readers share it through an `Arc` swapped under a
//! readers-writer lock, so no request ever observes a half-updated set.
//!
//! Definition problems that are not server-fatal — duplicate names across
//! sources, endpoints referencing missing rules, invalid expressions —
//! quarantine the offending definition into `skipped` and leave the rest of
//! the snapshot serving.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::Config;
use crate::engine::TemplateEngine;
use crate::error::Result;
use crate::rules::compile::{compile_endpoint, compile_rule, EndpointDefinition, RuleDefinition};
use crate::rules::loader::{load_documents, SourcedDoc};
use crate::rules::model::{EndpointDoc, RuleDoc};

/// Name given to the built-in fallback endpoint and its deny rule
pub const FALLBACK_NAME: &str = "default";

/// A definition excluded from the active set
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedDefinition {
    /// "rule" or "endpoint"
    pub kind: String,

    /// Definition name
    pub name: String,

    /// Why it was excluded
    pub reason: String,

    /// Sources that declared it
    pub sources: Vec<String>,
}

/// The immutable active endpoint set
#[derive(Debug)]
pub struct EndpointSnapshot {
    /// Compiled endpoints by name
    pub endpoints: BTreeMap<String, Arc<EndpointDefinition>>,

    /// Endpoint served by the root `/auth` route
    pub default_endpoint: Option<String>,

    /// The built-in fallback endpoint is in use
    pub using_fallback: bool,

    /// Rule source labels, in load order
    pub rule_sources: Vec<String>,

    /// Definitions excluded from this snapshot
    pub skipped: Vec<SkippedDefinition>,
}

impl EndpointSnapshot {
    /// Build a snapshot from the configuration
    ///
    /// Fails only on unreadable document sources (configuration-fatal);
    /// definition-level problems quarantine instead.
    pub fn build(config: &Config, templates: &TemplateEngine) -> Result<Self> {
        let documents = load_documents(config)?;
        let mut skipped = Vec::new();

        let rule_docs = dedupe("rule", documents.rules, &mut skipped);
        let endpoint_docs = dedupe("endpoint", documents.endpoints, &mut skipped);

        let mut rules: BTreeMap<String, Arc<RuleDefinition>> = BTreeMap::new();
        for (name, sourced) in rule_docs {
            match compile_rule(&name, &sourced.doc, templates) {
                Ok(rule) => {
                    rules.insert(name, Arc::new(rule));
                }
                Err(e) => {
                    tracing::warn!(rule = %name, "quarantined rule: {e}");
                    skipped.push(SkippedDefinition {
                        kind: "rule".into(),
                        name,
                        reason: e.to_string(),
                        sources: vec![sourced.source],
                    });
                }
            }
        }

        let mut endpoints: BTreeMap<String, Arc<EndpointDefinition>> = BTreeMap::new();
        for (name, sourced) in endpoint_docs {
            match compile_endpoint(&name, &sourced.doc, &rules, templates) {
                Ok(endpoint) => {
                    endpoints.insert(name, Arc::new(endpoint));
                }
                Err(e) => {
                    tracing::warn!(endpoint = %name, "quarantined endpoint: {e}");
                    skipped.push(SkippedDefinition {
                        kind: "endpoint".into(),
                        name,
                        reason: e.to_string(),
                        sources: vec![sourced.source],
                    });
                }
            }
        }

        let using_fallback = endpoints.is_empty();
        if using_fallback {
            tracing::warn!("no endpoints survived configuration; installing deny-all fallback");
            let (name, endpoint) = fallback_endpoint(templates)?;
            endpoints.insert(name, endpoint);
        }

        let default_endpoint = if endpoints.len() == 1 {
            endpoints.keys().next().cloned()
        } else if endpoints.contains_key(FALLBACK_NAME) {
            Some(FALLBACK_NAME.to_string())
        } else {
            None
        };

        Ok(Self {
            endpoints,
            default_endpoint,
            using_fallback,
            rule_sources: documents.sources,
            skipped,
        })
    }

    /// Resolve an endpoint by name, or the root endpoint when `None`
    pub fn resolve(&self, name: Option<&str>) -> Option<Arc<EndpointDefinition>> {
        match name {
            Some(name) => self.endpoints.get(name).cloned(),
            None => self
                .default_endpoint
                .as_deref()
                .and_then(|n| self.endpoints.get(n))
                .cloned(),
        }
    }

    /// Endpoint names, for 404 payloads and health reports
    pub fn available(&self) -> Vec<String> {
        self.endpoints.keys().cloned().collect()
    }

    /// The snapshot is serving degraded (fallback or quarantined definitions)
    pub fn degraded(&self) -> bool {
        self.using_fallback || !self.skipped.is_empty()
    }
}

/// Collapse duplicate names; a name declared by more than one source is
/// excluded entirely and recorded with every declaring source.
fn dedupe<T>(
    kind: &str,
    docs: Vec<SourcedDoc<T>>,
    skipped: &mut Vec<SkippedDefinition>,
) -> BTreeMap<String, SourcedDoc<T>> {
    let mut by_name: BTreeMap<String, Vec<SourcedDoc<T>>> = BTreeMap::new();
    for doc in docs {
        by_name.entry(doc.name.clone()).or_default().push(doc);
    }

    let mut unique = BTreeMap::new();
    for (name, mut declarations) in by_name {
        if declarations.len() == 1 {
            unique.insert(name, declarations.pop().expect("one declaration"));
        } else {
            let sources: Vec<String> = declarations.iter().map(|d| d.source.clone()).collect();
            tracing::warn!(kind, name = %name, ?sources, "duplicate definition quarantined");
            skipped.push(SkippedDefinition {
                kind: kind.to_string(),
                name,
                reason: "duplicate definition across sources".into(),
                sources,
            });
        }
    }
    unique
}

/// Deny-all endpoint installed when nothing else survived
fn fallback_endpoint(
    templates: &TemplateEngine,
) -> Result<(String, Arc<EndpointDefinition>)> {
    let mut rule_doc = RuleDoc::default();
    rule_doc.description = Some("deny-all fallback".into());
    rule_doc.conditions.fail = vec!["true".into()];
    let rule = Arc::new(compile_rule("fallback-deny", &rule_doc, templates)?);

    let mut rules = BTreeMap::new();
    rules.insert("fallback-deny".to_string(), rule);

    let mut endpoint_doc = EndpointDoc::default();
    endpoint_doc.description = Some("deny-all fallback endpoint".into());
    endpoint_doc.rules = vec!["fallback-deny".into()];
    let endpoint = compile_endpoint(FALLBACK_NAME, &endpoint_doc, &rules, templates)?;

    Ok((FALLBACK_NAME.to_string(), Arc::new(endpoint)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn templates() -> TemplateEngine {
        TemplateEngine::default()
    }

    fn config_with_endpoint() -> Config {
        let mut config = Config::default();
        let mut rule = RuleDoc::default();
        rule.conditions.pass = vec!["true".into()];
        config.rules.insert("allow-all".into(), rule);

        let mut endpoint = EndpointDoc::default();
        endpoint.rules = vec!["allow-all".into()];
        config.endpoints.insert("default".into(), endpoint);
        config
    }

    #[test]
    fn test_build_healthy_snapshot() {
        let snapshot = EndpointSnapshot::build(&config_with_endpoint(), &templates()).unwrap();
        assert!(!snapshot.degraded());
        assert!(!snapshot.using_fallback);
        assert_eq!(snapshot.default_endpoint.as_deref(), Some("default"));
        assert!(snapshot.resolve(None).is_some());
        assert!(snapshot.resolve(Some("default")).is_some());
        assert!(snapshot.resolve(Some("missing")).is_none());
    }

    #[test]
    fn test_empty_config_installs_fallback() {
        let snapshot = EndpointSnapshot::build(&Config::default(), &templates()).unwrap();
        assert!(snapshot.using_fallback);
        assert!(snapshot.degraded());
        let endpoint = snapshot.resolve(None).unwrap();
        assert_eq!(endpoint.name, FALLBACK_NAME);
        assert_eq!(endpoint.rules.len(), 1);
    }

    #[test]
    fn test_invalid_rule_is_quarantined() {
        let mut config = config_with_endpoint();
        let mut broken = RuleDoc::default();
        broken.conditions.pass = vec!["1 +".into()];
        config.rules.insert("broken".into(), broken);

        let snapshot = EndpointSnapshot::build(&config, &templates()).unwrap();
        assert!(snapshot.degraded());
        assert_eq!(snapshot.skipped.len(), 1);
        assert_eq!(snapshot.skipped[0].kind, "rule");
        assert_eq!(snapshot.skipped[0].name, "broken");
        // The healthy endpoint still serves.
        assert!(snapshot.resolve(Some("default")).is_some());
    }

    #[test]
    fn test_endpoint_with_missing_rule_is_quarantined() {
        let mut config = config_with_endpoint();
        let mut endpoint = EndpointDoc::default();
        endpoint.rules = vec!["no-such-rule".into()];
        config.endpoints.insert("orphan".into(), endpoint);

        let snapshot = EndpointSnapshot::build(&config, &templates()).unwrap();
        assert!(snapshot.resolve(Some("orphan")).is_none());
        assert!(snapshot
            .skipped
            .iter()
            .any(|s| s.kind == "endpoint" && s.name == "orphan"));
    }

    #[test]
    fn test_duplicate_across_sources_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("dup.yaml"),
            "rules:\n  allow-all:\n    conditions:\n      pass: [\"true\"]\n",
        )
        .unwrap();

        let mut config = config_with_endpoint();
        config.server.rules.rules_folder = Some(dir.path().to_path_buf());

        let snapshot = EndpointSnapshot::build(&config, &templates()).unwrap();
        let dup = snapshot
            .skipped
            .iter()
            .find(|s| s.name == "allow-all")
            .expect("duplicate quarantined");
        assert_eq!(dup.sources.len(), 2);
        // The endpoint referencing the now-missing rule is quarantined too,
        // leaving only the deny-all fallback serving.
        assert!(snapshot
            .skipped
            .iter()
            .any(|s| s.kind == "endpoint" && s.name == "default"));
        assert!(snapshot.using_fallback);
        let fallback = snapshot.resolve(Some("default")).unwrap();
        assert_eq!(fallback.rules.len(), 1);
        assert_eq!(fallback.rules[0].name, "fallback-deny");
    }

    #[test]
    fn test_root_endpoint_selection_prefers_default_name() {
        let mut config = config_with_endpoint();
        let mut second = EndpointDoc::default();
        second.rules = vec!["allow-all".into()];
        config.endpoints.insert("internal".into(), second);

        let snapshot = EndpointSnapshot::build(&config, &templates()).unwrap();
        assert_eq!(snapshot.default_endpoint.as_deref(), Some("default"));
        assert_eq!(snapshot.available(), vec!["default", "internal"]);
    }
}
