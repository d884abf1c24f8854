//! Text template dialect (minijinja)
//!
//! Templates render the same activation namespaces the expression dialect
//! sees. The environment is sandboxed: no filesystem, network, or
//! environment-variable access from inside a template. Process environment
//! data is reachable only through `variables.environment` /
//! `variables.secrets`, or through the opt-in `env` namespace populated from
//! `server.templates.templatesAllowedEnv`.
//!
//! Template file references (`bodyFile` and response-policy body files)
//! resolve against the configured template root; after symlink expansion the
//! resolved path must remain inside the root, otherwise the load fails
//! closed.

use minijinja::{context, Environment, UndefinedBehavior};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::TemplatesConfig;
use crate::engine::activation::Activation;
use crate::error::{Error, Result};

/// Sandboxed template renderer shared by all definitions
#[derive(Debug, Clone, Default)]
pub struct TemplateEngine {
    root: Option<PathBuf>,
    env_vars: BTreeMap<String, String>,
}

impl TemplateEngine {
    /// Build the engine from the template sandbox configuration
    ///
    /// A configured template folder must exist; the canonicalized path is the
    /// sandbox boundary for all file references.
    pub fn new(config: &TemplatesConfig) -> Result<Self> {
        let root = match &config.templates_folder {
            Some(folder) => Some(folder.canonicalize().map_err(|e| {
                Error::InvalidConfig(format!(
                    "templatesFolder {}: {e}",
                    folder.display()
                ))
            })?),
            None => None,
        };

        let mut env_vars = BTreeMap::new();
        if config.templates_allow_env {
            for name in &config.templates_allowed_env {
                if let Ok(value) = std::env::var(name) {
                    env_vars.insert(name.clone(), value);
                }
            }
        }

        Ok(Self { root, env_vars })
    }

    /// Validate template syntax without rendering
    pub fn check(&self, source: &str) -> Result<()> {
        let env = self.environment();
        env.template_from_str(source)?;
        Ok(())
    }

    /// Render a template source against an activation snapshot
    pub fn render(&self, source: &str, activation: &Activation<'_>) -> Result<String> {
        let env = self.environment();
        let tmpl = env.template_from_str(source)?;
        let rendered = tmpl.render(context! {
            now => chrono::Utc::now().to_rfc3339(),
            env => self.env_vars,
            ..minijinja::Value::from_serialize(activation)
        })?;
        Ok(rendered)
    }

    /// Load a template file referenced by a rendered relative path
    ///
    /// Fails when no template root is configured or when the resolved path
    /// escapes it.
    pub fn load_file(&self, relative: &str) -> Result<String> {
        let root = self
            .root
            .as_ref()
            .ok_or_else(|| Error::TemplateSandbox("no template root configured".into()))?;

        let resolved = root
            .join(relative)
            .canonicalize()
            .map_err(|e| Error::TemplateSandbox(format!("{relative}: {e}")))?;

        if !resolved.starts_with(root) {
            return Err(Error::TemplateSandbox(relative.to_string()));
        }

        Ok(std::fs::read_to_string(&resolved)?)
    }

    fn environment(&self) -> Environment<'static> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Lenient);
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::state::RequestState;
    use serde_json::json;
    use std::io::Write;

    fn engine() -> TemplateEngine {
        TemplateEngine::default()
    }

    #[test]
    fn test_render_global_variable() {
        let mut state = RequestState::default();
        state
            .variables
            .global
            .insert("tier_value".into(), json!("premium"));

        let activation = Activation::snapshot(&state);
        let out = engine()
            .render("{\"tier\":\"{{ variables.global.tier_value }}\"}", &activation)
            .unwrap();
        assert_eq!(out, "{\"tier\":\"premium\"}");
    }

    #[test]
    fn test_undefined_renders_empty() {
        let state = RequestState::default();
        let activation = Activation::snapshot(&state);
        let out = engine()
            .render("[{{ variables.global.missing }}]", &activation)
            .unwrap();
        assert_eq!(out, "[]");
    }

    #[test]
    fn test_check_rejects_bad_syntax() {
        assert!(engine().check("{{ unclosed").is_err());
    }

    #[test]
    fn test_file_load_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("body.txt")).unwrap();
        write!(f, "hello {{{{ raw.method }}}}").unwrap();

        let config = TemplatesConfig {
            templates_folder: Some(dir.path().to_path_buf()),
            templates_allow_env: false,
            templates_allowed_env: Vec::new(),
        };
        let engine = TemplateEngine::new(&config).unwrap();
        let source = engine.load_file("body.txt").unwrap();
        assert!(source.contains("raw.method"));
    }

    #[test]
    fn test_file_load_escape_fails_closed() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("templates");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(outer.path().join("secret.txt"), "leak").unwrap();

        let config = TemplatesConfig {
            templates_folder: Some(root),
            templates_allow_env: false,
            templates_allowed_env: Vec::new(),
        };
        let engine = TemplateEngine::new(&config).unwrap();
        assert!(engine.load_file("../secret.txt").is_err());
    }

    #[test]
    fn test_no_root_fails_closed() {
        assert!(engine().load_file("body.txt").is_err());
    }
}
