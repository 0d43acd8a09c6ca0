//! Template expansion for rule labels, annotations and notifications.
//!
//! Templates use handlebars syntax. Rule templates may also use the
//! Prometheus-style variables `$value`, `$values.<ref_id>` and
//! `$labels.<name>`, which are rewritten to their handlebars equivalents
//! before rendering:
//!
//! ```text
//! {{ $labels.instance }} is at {{ humanize $value }}
//! ```
//!
//! Registered helpers: `humanize`, `humanizePercentage`, `humanizeDuration`,
//! `toUpper`, `toLower`, `title`, `join`. Notification templates also see the
//! configured external URL as `externalURL` in their data.

use std::collections::BTreeMap;

use handlebars::{Handlebars, handlebars_helper};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::error::{AlertError, Result};
use crate::labels::Labels;

handlebars_helper!(humanize_helper: |v: f64| humanize(v));
handlebars_helper!(humanize_percentage_helper: |v: f64| humanize_percentage(v));
handlebars_helper!(humanize_duration_helper: |v: f64| humanize_duration(v));
handlebars_helper!(to_upper_helper: |s: String| s.to_uppercase());
handlebars_helper!(to_lower_helper: |s: String| s.to_lowercase());
handlebars_helper!(title_helper: |s: String| title_case(&s));
handlebars_helper!(join_helper: |items: Value, sep: String| join_values(&items, &sep));

/// Data available to rule label and annotation templates.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuleTemplateData {
    /// Instance labels.
    pub labels: Labels,
    /// Condition value.
    pub value: Option<f64>,
    /// Values of all queries by `ref_id`.
    pub values: BTreeMap<String, f64>,
}

/// A handlebars registry with the alerting helpers installed.
#[derive(Debug, Clone)]
pub struct TemplateEngine {
    registry: Handlebars<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Creates an engine with the standard helpers and no escaping.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        registry.register_helper("humanize", Box::new(humanize_helper));
        registry.register_helper("humanizePercentage", Box::new(humanize_percentage_helper));
        registry.register_helper("humanizeDuration", Box::new(humanize_duration_helper));
        registry.register_helper("toUpper", Box::new(to_upper_helper));
        registry.register_helper("toLower", Box::new(to_lower_helper));
        registry.register_helper("title", Box::new(title_helper));
        registry.register_helper("join", Box::new(join_helper));
        Self { registry }
    }

    /// Registers a named template that other templates can include as a partial.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Template` if the template does not parse.
    pub fn register(&mut self, name: &str, source: &str) -> Result<()> {
        self.registry
            .register_template_string(name, source)
            .map_err(|e| AlertError::Template {
                reason: format!("template {name:?}: {e}"),
            })?;
        self.registry
            .register_partial(name, source)
            .map_err(|e| AlertError::Template {
                reason: format!("template {name:?}: {e}"),
            })
    }

    /// Checks that a template parses.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Template` if it does not.
    pub fn check(source: &str) -> Result<()> {
        handlebars::Template::compile(&rewrite_variables(source))
            .map(|_| ())
            .map_err(|e| AlertError::Template {
                reason: e.to_string(),
            })
    }

    /// Returns true if a named template is registered.
    #[must_use]
    pub fn has_template(&self, name: &str) -> bool {
        self.registry.has_template(name)
    }

    /// Renders an inline template.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Template` if the template fails to parse or render.
    pub fn render<T: Serialize>(&self, source: &str, data: &T) -> Result<String> {
        self.registry
            .render_template(&rewrite_variables(source), data)
            .map_err(|e| AlertError::Template {
                reason: e.to_string(),
            })
    }

    /// Renders a registered template.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::Template` if the template is missing or fails to render.
    pub fn render_named<T: Serialize>(&self, name: &str, data: &T) -> Result<String> {
        self.registry
            .render(name, data)
            .map_err(|e| AlertError::Template {
                reason: e.to_string(),
            })
    }

    /// Expands a rule template, keeping the raw text on failure.
    #[must_use]
    pub fn expand(&self, source: &str, data: &RuleTemplateData) -> String {
        if !source.contains("{{") {
            return source.to_string();
        }
        match self.render(source, data) {
            Ok(out) => out,
            Err(e) => {
                warn!(template = source, error = %e, "failed to expand template");
                source.to_string()
            }
        }
    }
}

/// Prometheus-style template variables.
static VARIABLE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$(labels|values|value)\b").unwrap_or_else(|_| unreachable!()));

/// A single `{{ ... }}` block.
static MUSTACHE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{[^}]*\}\}").unwrap_or_else(|_| unreachable!()));

/// Rewrites `$labels`, `$values` and `$value` inside `{{ }}` blocks.
#[must_use]
pub fn rewrite_variables(source: &str) -> String {
    if !source.contains('$') {
        return source.to_string();
    }
    MUSTACHE_REGEX
        .replace_all(source, |caps: &regex::Captures<'_>| {
            VARIABLE_REGEX.replace_all(&caps[0], "$1").into_owned()
        })
        .into_owned()
}

const SI_LARGE: [&str; 8] = ["k", "M", "G", "T", "P", "E", "Z", "Y"];
const SI_SMALL: [&str; 8] = ["m", "u", "n", "p", "f", "a", "z", "y"];

/// Formats a number with an SI prefix, e.g. `1234` → `1.234k`.
#[must_use]
pub fn humanize(v: f64) -> String {
    if v == 0.0 || !v.is_finite() {
        return format_significant(v);
    }
    let mut scaled = v;
    let mut prefix = "";
    if v.abs() >= 1.0 {
        for p in SI_LARGE {
            if scaled.abs() < 1000.0 {
                break;
            }
            scaled /= 1000.0;
            prefix = p;
        }
    } else {
        for p in SI_SMALL {
            if scaled.abs() >= 1.0 {
                break;
            }
            scaled *= 1000.0;
            prefix = p;
        }
    }
    format!("{}{prefix}", format_significant(scaled))
}

/// Formats a ratio as a percentage, e.g. `0.1234` → `12.34%`.
#[must_use]
pub fn humanize_percentage(v: f64) -> String {
    format!("{}%", format_significant(v * 100.0))
}

/// Formats seconds as a duration, e.g. `3725` → `1h 2m 5s`.
#[must_use]
pub fn humanize_duration(seconds: f64) -> String {
    if !seconds.is_finite() {
        return format_significant(seconds);
    }
    if seconds.abs() < 1.0 {
        return format!("{}ms", format_significant(seconds * 1000.0));
    }
    let sign = if seconds < 0.0 { "-" } else { "" };
    let total = seconds.abs() as u64;
    let (days, rem) = (total / 86_400, total % 86_400);
    let (hours, rem) = (rem / 3600, rem % 3600);
    let (minutes, secs) = (rem / 60, rem % 60);
    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    if secs > 0 || parts.is_empty() {
        parts.push(format!("{secs}s"));
    }
    format!("{sign}{}", parts.join(" "))
}

/// Four significant digits, trailing zeros trimmed.
fn format_significant(v: f64) -> String {
    if !v.is_finite() {
        return v.to_string();
    }
    if v == 0.0 {
        return "0".to_string();
    }
    let magnitude = v.abs().log10().floor() as i32;
    let decimals = (3 - magnitude).clamp(0, 10) as usize;
    let text = format!("{v:.decimals$}");
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text
    }
}

fn title_case(s: &str) -> String {
    s.split(' ')
        .map(|word| {
            let mut chars = word.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars).collect()
            })
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn join_values(items: &Value, sep: &str) -> String {
    match items {
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map_or_else(|| v.to_string(), str::to_string))
            .collect::<Vec<_>>()
            .join(sep),
        Value::Object(map) => map
            .values()
            .map(|v| v.as_str().map_or_else(|| v.to_string(), str::to_string))
            .collect::<Vec<_>>()
            .join(sep),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
