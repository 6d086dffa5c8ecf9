//! Prompt templates and the minimal substitution engine that renders them.
//!
//! Three templates exist: the shared system prompt, the one-shot plan prompt,
//! and the interactive-step prompt. Templates can be overridden from a
//! directory on disk; the built-in defaults apply otherwise.

use std::path::Path;

use serde_json::Value;
use tracing::warn;

/// The interactive-step template never sees more DOM than this.
pub const INTERACTIVE_DOM_LIMIT: usize = 4_000;

const DEFAULT_SYSTEM: &str = include_str!("prompts/system.txt");
const DEFAULT_PLAN: &str = include_str!("prompts/plan.txt");
const DEFAULT_INTERACTIVE: &str = include_str!("prompts/interactive_step.txt");

#[derive(Clone, Debug)]
pub struct PromptStore {
    system: String,
    plan: String,
    interactive: String,
}

impl Default for PromptStore {
    fn default() -> Self {
        Self {
            system: DEFAULT_SYSTEM.to_string(),
            plan: DEFAULT_PLAN.to_string(),
            interactive: DEFAULT_INTERACTIVE.to_string(),
        }
    }
}

impl PromptStore {
    /// Load templates from `dir`, falling back to the built-in defaults for
    /// any file that is missing or unreadable.
    pub fn load(dir: Option<&Path>) -> Self {
        let defaults = Self::default();
        let Some(dir) = dir else {
            return defaults;
        };
        Self {
            system: read_or(dir, "system.txt", defaults.system),
            plan: read_or(dir, "plan.txt", defaults.plan),
            interactive: read_or(dir, "interactive_step.txt", defaults.interactive),
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system
    }

    pub fn render_plan_prompt(&self, vars: &Value) -> String {
        render(&self.plan, vars)
    }

    pub fn render_interactive_prompt(&self, vars: &Value) -> String {
        let mut vars = vars.clone();
        if let Some(dom) = vars.get("dom").and_then(Value::as_str) {
            if dom.len() > INTERACTIVE_DOM_LIMIT {
                let truncated = truncate_chars(dom, INTERACTIVE_DOM_LIMIT);
                vars["dom"] = Value::String(truncated);
            }
        }
        render(&self.interactive, &vars)
    }
}

fn read_or(dir: &Path, file: &str, default: String) -> String {
    let path = dir.join(file);
    match std::fs::read_to_string(&path) {
        Ok(content) if !content.trim().is_empty() => content,
        Ok(_) => default,
        Err(err) => {
            if path.exists() {
                warn!(path = %path.display(), %err, "failed to read prompt template");
            }
            default
        }
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// Render a template against a JSON variable bag.
///
/// Supported syntax: `{{var}}`, `{{object.field}}`, and
/// `{{#if X}}...{{else}}...{{/if}}` selected by the truthiness of `X`.
pub fn render(template: &str, vars: &Value) -> String {
    substitute(&render_conditionals(template, vars), vars)
}

fn render_conditionals(template: &str, vars: &Value) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{#if ") {
        output.push_str(&rest[..start]);
        let after_tag = &rest[start + "{{#if ".len()..];
        let Some(name_end) = after_tag.find("}}") else {
            output.push_str(&rest[start..]);
            return output;
        };
        let var_name = after_tag[..name_end].trim().to_string();
        let body_start = &after_tag[name_end + 2..];
        let Some((body, remainder)) = split_if_block(body_start) else {
            output.push_str(&rest[start..]);
            return output;
        };
        let (then_branch, else_branch) = split_else(body);
        let chosen = if is_truthy(lookup(vars, &var_name)) {
            then_branch
        } else {
            else_branch
        };
        output.push_str(&render_conditionals(chosen, vars));
        rest = remainder;
    }
    output.push_str(rest);
    output
}

// Find the body up to the matching {{/if}}, accounting for nested blocks.
fn split_if_block(input: &str) -> Option<(&str, &str)> {
    let mut depth = 1usize;
    let mut cursor = 0usize;
    while cursor < input.len() {
        let open = input[cursor..].find("{{#if ").map(|idx| idx + cursor);
        let close = input[cursor..].find("{{/if}}").map(|idx| idx + cursor);
        match (open, close) {
            (Some(o), Some(c)) if o < c => {
                depth += 1;
                cursor = o + "{{#if ".len();
            }
            (_, Some(c)) => {
                depth -= 1;
                if depth == 0 {
                    return Some((&input[..c], &input[c + "{{/if}}".len()..]));
                }
                cursor = c + "{{/if}}".len();
            }
            _ => return None,
        }
    }
    None
}

fn split_else(body: &str) -> (&str, &str) {
    // Only split on an {{else}} that belongs to this block, not a nested one.
    let mut depth = 0usize;
    let mut cursor = 0usize;
    while cursor < body.len() {
        let open = body[cursor..].find("{{#if ").map(|idx| idx + cursor);
        let close = body[cursor..].find("{{/if}}").map(|idx| idx + cursor);
        let else_at = body[cursor..].find("{{else}}").map(|idx| idx + cursor);
        let next = [open, close, else_at]
            .into_iter()
            .flatten()
            .min();
        let Some(next) = next else { break };
        if Some(next) == open {
            depth += 1;
            cursor = next + "{{#if ".len();
        } else if Some(next) == close {
            depth = depth.saturating_sub(1);
            cursor = next + "{{/if}}".len();
        } else {
            if depth == 0 {
                return (&body[..next], &body[next + "{{else}}".len()..]);
            }
            cursor = next + "{{else}}".len();
        }
    }
    (body, "")
}

fn substitute(template: &str, vars: &Value) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let name = after[..end].trim();
                match lookup(vars, name) {
                    Some(value) => output.push_str(&stringify(value)),
                    None => {} // unknown variables render as empty
                }
                rest = &after[end + 2..];
            }
            None => {
                output.push_str(&rest[start..]);
                return output;
            }
        }
    }
    output.push_str(rest);
    output
}

fn lookup<'a>(vars: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = vars;
    for key in path.split('.') {
        current = current.get(key)?;
    }
    Some(current)
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(_)) => true,
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn substitutes_plain_and_dotted_variables() {
        let vars = json!({ "name": "page", "task": { "url": "https://example.com" } });
        assert_eq!(
            render("watch {{name}} at {{task.url}}", &vars),
            "watch page at https://example.com"
        );
    }

    #[test]
    fn unknown_variables_render_empty() {
        assert_eq!(render("a{{missing}}b", &json!({})), "ab");
    }

    #[test]
    fn if_blocks_select_by_truthiness() {
        let template = "{{#if pageText}}with text{{else}}without text{{/if}}";
        assert_eq!(
            render(template, &json!({ "pageText": "hello" })),
            "with text"
        );
        assert_eq!(render(template, &json!({ "pageText": "" })), "without text");
        assert_eq!(render(template, &json!({})), "without text");
    }

    #[test]
    fn nested_if_blocks_resolve_one_level() {
        let template = "{{#if a}}A{{#if b}}B{{/if}}{{else}}C{{/if}}";
        assert_eq!(render(template, &json!({ "a": true, "b": true })), "AB");
        assert_eq!(render(template, &json!({ "a": true })), "A");
        assert_eq!(render(template, &json!({})), "C");
    }

    #[test]
    fn interactive_prompt_truncates_dom() {
        let store = PromptStore::default();
        let dom = "x".repeat(INTERACTIVE_DOM_LIMIT * 2);
        let rendered = store.render_interactive_prompt(&json!({
            "instruction": "get title",
            "url": "https://example.com",
            "dom": dom,
            "history": "",
        }));
        assert!(rendered.len() < INTERACTIVE_DOM_LIMIT * 2);
    }

    #[test]
    fn load_falls_back_to_defaults_for_missing_dir() {
        let store = PromptStore::load(Some(Path::new("/nonexistent/prompts")));
        assert!(!store.system_prompt().is_empty());
    }

    #[test]
    fn load_prefers_templates_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("system.txt"), "custom system prompt").unwrap();
        let store = PromptStore::load(Some(dir.path()));
        assert_eq!(store.system_prompt(), "custom system prompt");
        // Missing files keep their defaults.
        assert!(store.plan.contains("{{instruction}}"));
    }
}
