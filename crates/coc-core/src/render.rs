//! Prompt rendering by fixed-token substitution.
//!
//! Supported tokens: `{{ directive }}`, `{{ task.id }}`, `{{ task.title }}`,
//! `{{ task.role }}`, `{{ arm.id }}`, `{{ arm.model }}`, `{{ docs }}`.
//! Unknown tokens are left untouched. There are no loops or conditionals.
//!
//! Rendering never fails: a missing template id, an unreadable file or an id
//! that escapes the template directory all fall back to a JSON dump of the
//! context.

use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::json;
use tracing::debug;

use crate::bandit::Arm;
use crate::domain::Task;
use crate::registry::Document;

const DOC_SEPARATOR: &str = "\n---\n";

fn token_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.]*)\s*\}\}").ok())
        .as_ref()
}

/// Values available to a template.
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub directive: &'a str,
    pub task: &'a Task,
    pub arm: &'a Arm,
    pub docs: &'a [Document],
}

impl PromptContext<'_> {
    fn token(&self, name: &str) -> Option<String> {
        match name {
            "directive" => Some(self.directive.to_string()),
            "task.id" => Some(self.task.id.clone()),
            "task.title" => Some(self.task.title.clone()),
            "task.role" => Some(self.task.role.clone()),
            "arm.id" => Some(self.arm.id.clone()),
            "arm.model" => Some(self.arm.model_name.clone().unwrap_or_default()),
            "docs" => Some(
                self.docs
                    .iter()
                    .map(|d| d.content.as_str())
                    .collect::<Vec<_>>()
                    .join(DOC_SEPARATOR),
            ),
            _ => None,
        }
    }

    /// `{"ctx": {...}}` dump used when no template applies.
    fn dump(&self) -> String {
        json!({
            "ctx": {
                "directive": self.directive,
                "task": self.task,
                "arm": self.arm,
                "docs": self.docs,
            }
        })
        .to_string()
    }
}

/// Loads templates from a directory and fills their tokens.
#[derive(Debug, Clone)]
pub struct PromptRenderer {
    template_dir: PathBuf,
}

impl PromptRenderer {
    pub fn new(template_dir: impl Into<PathBuf>) -> Self {
        Self {
            template_dir: template_dir.into(),
        }
    }

    pub fn template_dir(&self) -> &Path {
        &self.template_dir
    }

    /// Render `template_id` with `ctx`.
    pub fn render(&self, template_id: Option<&str>, ctx: &PromptContext<'_>) -> String {
        let Some(template) = template_id.and_then(|id| self.load(id)) else {
            return ctx.dump();
        };
        match token_pattern() {
            Some(re) => fill(re, &template, ctx),
            None => ctx.dump(),
        }
    }

    fn load(&self, template_id: &str) -> Option<String> {
        let relative = Path::new(template_id);
        let contained = !template_id.trim().is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !contained {
            debug!(template = %template_id, "template id rejected");
            return None;
        }
        let path = self.template_dir.join(relative);
        match std::fs::read_to_string(&path) {
            Ok(text) => Some(text),
            Err(err) => {
                debug!(path = %path.display(), error = %err, "template unavailable, using context dump");
                None
            }
        }
    }
}

fn fill(re: &Regex, template: &str, ctx: &PromptContext<'_>) -> String {
    re.replace_all(template, |caps: &Captures<'_>| {
        ctx.token(&caps[1]).unwrap_or_else(|| caps[0].to_string())
    })
    .into_owned()
}
