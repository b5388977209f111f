use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a script written in one language is stored and invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageSpec {
    /// Container image the script runs in.
    pub image: String,
    /// File extension (including the leading dot) used when storing the script.
    pub extension: String,
    /// Interpreter argv; the in-container script path is appended.
    pub interpreter: Vec<String>,
}

impl LanguageSpec {
    pub fn new(image: &str, extension: &str, interpreter: &[&str]) -> Self {
        Self {
            image: image.to_string(),
            extension: extension.to_string(),
            interpreter: interpreter.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Language tag -> [`LanguageSpec`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LanguageTable(BTreeMap<String, LanguageSpec>);

impl Default for LanguageTable {
    fn default() -> Self {
        let mut table = BTreeMap::new();
        table.insert(
            "python".to_string(),
            LanguageSpec::new("python:3.11-alpine", ".py", &["python"]),
        );
        table.insert(
            "bash".to_string(),
            LanguageSpec::new("bash:5-alpine", ".sh", &["bash"]),
        );
        table.insert(
            "nodejs".to_string(),
            LanguageSpec::new("node:20-alpine", ".js", &["node"]),
        );
        table.insert(
            "js".to_string(),
            LanguageSpec::new("node:20-alpine", ".js", &["node"]),
        );
        Self(table)
    }
}

impl LanguageTable {
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, language: &str) -> Option<&LanguageSpec> {
        self.0.get(language)
    }

    pub fn insert(&mut self, language: impl Into<String>, spec: LanguageSpec) {
        self.0.insert(language.into(), spec);
    }

    pub fn languages(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &LanguageSpec)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Problems with the table, one message per offending field.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.is_empty() {
            problems.push("languages: at least one language must be configured".to_string());
        }
        for (language, spec) in self.iter() {
            if language.trim().is_empty() {
                problems.push("languages: language tag cannot be blank".to_string());
            }
            if spec.image.trim().is_empty() {
                problems.push(format!("languages.{}: image cannot be empty", language));
            }
            if !spec.extension.starts_with('.') || spec.extension.len() < 2 {
                problems.push(format!(
                    "languages.{}: extension '{}' must start with '.'",
                    language, spec.extension
                ));
            }
            if spec.interpreter.is_empty()
                || spec.interpreter.iter().any(|part| part.trim().is_empty())
            {
                problems.push(format!(
                    "languages.{}: interpreter must be a non-empty command",
                    language
                ));
            }
        }
        problems
    }
}
