//! Prompt template loading and rendering
//!
//! Templates live one per YAML file under the knowledge directory and carry
//! their own model tier and temperature. Rendering takes a named parameter
//! map; an unresolved `${placeholder}` is an error rather than being left in
//! the prompt silently.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use regex::Regex;
use serde::Deserialize;

use crate::error::{EngineError, Result};
use crate::llm::client::ModelTier;

/// One prompt template with metadata
#[derive(Debug, Clone, Deserialize)]
pub struct PromptTemplate {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub user_prompt: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub model: ModelTier,
}

fn default_temperature() -> f32 {
    1.0
}

fn placeholder_regex() -> Regex {
    // Compiled per call site; template rendering is far from any hot path.
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid placeholder regex")
}

fn render(template_name: &str, text: &str, params: &HashMap<&str, String>) -> Result<String> {
    let re = placeholder_regex();

    for capture in re.captures_iter(text) {
        let placeholder = &capture[1];
        if !params.contains_key(placeholder) {
            return Err(EngineError::PromptTemplate(format!(
                "unresolved placeholder '${{{placeholder}}}' in template '{template_name}'"
            )));
        }
    }

    Ok(re
        .replace_all(text, |caps: &regex::Captures<'_>| {
            params[&caps[1]].clone()
        })
        .into_owned())
}

impl PromptTemplate {
    /// Enumerate the placeholder names this template recognizes
    pub fn placeholders(&self) -> Vec<String> {
        let re = placeholder_regex();
        let mut names: Vec<String> = re
            .captures_iter(&self.user_prompt)
            .chain(re.captures_iter(&self.system_prompt))
            .map(|c| c[1].to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn render_user(&self, params: &HashMap<&str, String>) -> Result<String> {
        render(&self.name, &self.user_prompt, params)
    }

    pub fn render_system(&self, params: &HashMap<&str, String>) -> Result<String> {
        render(&self.name, &self.system_prompt, params)
    }
}

/// Loads and caches prompt templates from a directory
pub struct PromptStore {
    prompts_dir: PathBuf,
    cache: RwLock<HashMap<String, Arc<PromptTemplate>>>,
}

impl PromptStore {
    pub fn new(prompts_dir: impl Into<PathBuf>) -> Self {
        Self {
            prompts_dir: prompts_dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Load a template by name (`<dir>/<name>.yaml`), cached after first use
    pub fn load(&self, name: &str) -> Result<Arc<PromptTemplate>> {
        if let Some(template) = self.cache.read().expect("prompt cache poisoned").get(name) {
            return Ok(template.clone());
        }

        let path = self.prompts_dir.join(format!("{name}.yaml"));
        let text = std::fs::read_to_string(&path).map_err(|e| {
            EngineError::PromptTemplate(format!(
                "prompt template not found: {} ({e})",
                path.display()
            ))
        })?;

        let mut template: PromptTemplate = serde_yaml::from_str(&text)
            .map_err(|e| EngineError::PromptTemplate(format!("malformed template '{name}': {e}")))?;
        if template.name.is_empty() {
            template.name = name.to_string();
        }

        let template = Arc::new(template);
        self.cache
            .write()
            .expect("prompt cache poisoned")
            .insert(name.to_string(), template.clone());
        Ok(template)
    }
}
