//! Rule and endpoint document discovery
//!
//! Documents come from the inline `endpoints.*` / `rules.*` config sections
//! and from `server.rules.rulesFolder` or `server.rules.rulesFile`. File
//! format is chosen by extension: `.yaml`/`.yml`, `.json`, or `.toml`.
//! Duplicate-name detection across sources happens in the snapshot builder,
//! which sees every document with its source attached.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::rules::model::{EndpointDoc, RuleDoc};

/// Source label for documents declared inline in the server config
pub const INLINE_SOURCE: &str = "config";

/// A named document with the source it came from
#[derive(Debug, Clone)]
pub struct SourcedDoc<T> {
    /// Definition name
    pub name: String,

    /// Source label (config or file path)
    pub source: String,

    /// The document
    pub doc: T,
}

/// Every document discovered across all sources
#[derive(Debug, Default)]
pub struct DocumentSet {
    /// Rule documents, possibly with duplicate names
    pub rules: Vec<SourcedDoc<RuleDoc>>,

    /// Endpoint documents, possibly with duplicate names
    pub endpoints: Vec<SourcedDoc<EndpointDoc>>,

    /// Source labels, in load order
    pub sources: Vec<String>,
}

/// The shape of a standalone rule/endpoint document file
#[derive(Debug, Default, Deserialize)]
struct RuleBundleDoc {
    #[serde(default)]
    endpoints: BTreeMap<String, EndpointDoc>,

    #[serde(default)]
    rules: BTreeMap<String, RuleDoc>,
}

/// Load every rule/endpoint document the configuration points at
pub fn load_documents(config: &Config) -> Result<DocumentSet> {
    let mut set = DocumentSet::default();

    if !config.rules.is_empty() || !config.endpoints.is_empty() {
        set.sources.push(INLINE_SOURCE.to_string());
        for (name, doc) in &config.rules {
            set.rules.push(SourcedDoc {
                name: name.clone(),
                source: INLINE_SOURCE.to_string(),
                doc: doc.clone(),
            });
        }
        for (name, doc) in &config.endpoints {
            set.endpoints.push(SourcedDoc {
                name: name.clone(),
                source: INLINE_SOURCE.to_string(),
                doc: doc.clone(),
            });
        }
    }

    if let Some(file) = &config.server.rules.rules_file {
        load_file_into(file, &mut set)?;
    }

    if let Some(folder) = &config.server.rules.rules_folder {
        let mut paths: Vec<_> = std::fs::read_dir(folder)
            .map_err(|e| Error::RuleSource(format!("{}: {e}", folder.display())))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && has_known_extension(path))
            .collect();
        paths.sort();
        for path in paths {
            load_file_into(&path, &mut set)?;
        }
    }

    Ok(set)
}

fn load_file_into(path: &Path, set: &mut DocumentSet) -> Result<()> {
    let bundle = load_bundle(path)?;
    let source = path.display().to_string();
    set.sources.push(source.clone());
    for (name, doc) in bundle.rules {
        set.rules.push(SourcedDoc {
            name,
            source: source.clone(),
            doc,
        });
    }
    for (name, doc) in bundle.endpoints {
        set.endpoints.push(SourcedDoc {
            name,
            source: source.clone(),
            doc,
        });
    }
    Ok(())
}

/// Parse a document file by extension
///
/// Parsing goes straight through serde (not figment) so mapping sections
/// keep their declaration order — endpoint variables are evaluated in the
/// order they were written.
fn load_bundle(path: &Path) -> Result<RuleBundleDoc> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::RuleSource(format!("{}: {e}", path.display())))?;

    let parsed = match extension.as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&raw)
            .map_err(|e| Error::RuleSource(format!("{}: {e}", path.display()))),
        "json" => serde_json::from_str(&raw)
            .map_err(|e| Error::RuleSource(format!("{}: {e}", path.display()))),
        "toml" => toml::from_str(&raw)
            .map_err(|e| Error::RuleSource(format!("{}: {e}", path.display()))),
        other => Err(Error::RuleSource(format!(
            "{}: unsupported extension {other:?}",
            path.display()
        ))),
    }?;

    Ok(parsed)
}

fn has_known_extension(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some(ext) if ["yaml", "yml", "json", "toml"].contains(&ext.to_ascii_lowercase().as_str())
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_inline_documents() {
        let mut config = Config::default();
        config.rules.insert("allow-all".into(), RuleDoc::default());
        config
            .endpoints
            .insert("default".into(), EndpointDoc::default());

        let set = load_documents(&config).unwrap();
        assert_eq!(set.sources, vec![INLINE_SOURCE]);
        assert_eq!(set.rules.len(), 1);
        assert_eq!(set.endpoints.len(), 1);
        assert_eq!(set.rules[0].name, "allow-all");
    }

    #[test]
    fn test_load_rules_folder_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.yaml"),
            "rules:\n  allow-all:\n    conditions:\n      pass: [\"true\"]\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("b.json"),
            r#"{"endpoints": {"default": {"rules": ["allow-all"]}}}"#,
        )
        .unwrap();
        // Not a rule document; must be ignored.
        std::fs::write(dir.path().join("README.md"), "docs").unwrap();

        let mut config = Config::default();
        config.server.rules.rules_folder = Some(dir.path().to_path_buf());

        let set = load_documents(&config).unwrap();
        assert_eq!(set.sources.len(), 2);
        assert_eq!(set.rules.len(), 1);
        assert_eq!(set.endpoints.len(), 1);
        assert_eq!(set.endpoints[0].doc.rules, vec!["allow-all"]);
    }

    #[test]
    fn test_load_rules_file_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.toml");
        std::fs::write(
            &path,
            r#"
[rules.allow-all.conditions]
pass = ["true"]
"#,
        )
        .unwrap();

        let mut config = Config::default();
        config.server.rules.rules_file = Some(path);

        let set = load_documents(&config).unwrap();
        assert_eq!(set.rules.len(), 1);
        assert_eq!(set.rules[0].doc.conditions.pass, vec!["true"]);
    }

    #[test]
    fn test_unsupported_extension_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.ini");
        std::fs::write(&path, "").unwrap();

        let mut config = Config::default();
        config.server.rules.rules_file = Some(path);
        assert!(load_documents(&config).is_err());
    }
}
