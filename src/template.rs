//! Placeholder rendering for task titles and descriptions.
//!
//! Templates use `{name}` placeholders; `{{` and `}}` produce literal braces.
//! Only the fields of [`TemplateContext`] can be referenced. Anything else is a
//! template error, which callers turn into a default text via [`render_or_default`].

use crate::error::{EngineError, Result};
use log::warn;

pub const PLACEHOLDERS: [&str; 7] = [
    "obligation_name",
    "client_name",
    "period_description",
    "year",
    "month_name",
    "quarter",
    "deadline",
];

#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub obligation_name: String,
    pub client_name: String,
    pub period_description: String,
    pub year: String,
    pub month_name: String,
    pub quarter: String,
    pub deadline: String,
}

impl TemplateContext {
    fn lookup(&self, name: &str) -> Option<&str> {
        let value = match name {
            "obligation_name" => &self.obligation_name,
            "client_name" => &self.client_name,
            "period_description" => &self.period_description,
            "year" => &self.year,
            "month_name" => &self.month_name,
            "quarter" => &self.quarter,
            "deadline" => &self.deadline,
            _ => return None,
        };
        Some(value.as_str())
    }
}

pub fn render_template(template: &str, context: &TemplateContext) -> Result<String> {
    let mut output = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                output.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                output.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == '}' {
                        closed = true;
                        break;
                    }
                    name.push(next);
                }

                if !closed {
                    return Err(EngineError::Template(format!(
                        "unclosed placeholder in '{}'",
                        template
                    )));
                }

                let value = context.lookup(name.trim()).ok_or_else(|| {
                    EngineError::Template(format!(
                        "unknown placeholder '{{{}}}' (allowed: {})",
                        name,
                        PLACEHOLDERS.join(", ")
                    ))
                })?;
                output.push_str(value);
            }
            '}' => {
                return Err(EngineError::Template(format!(
                    "unmatched '}}' in '{}'",
                    template
                )));
            }
            other => output.push(other),
        }
    }

    Ok(output)
}

/// Renders `template`, falling back to `default` (rendered with the same context) on error.
pub fn render_or_default(template: &str, context: &TemplateContext, default: &str) -> String {
    match render_template(template, context) {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) => render_template(default, context).unwrap_or_else(|_| default.to_string()),
        Err(e) => {
            warn!(
                "Falling back to default text for '{}': {}",
                context.obligation_name, e
            );
            render_template(default, context).unwrap_or_else(|_| default.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> TemplateContext {
        TemplateContext {
            obligation_name: "IVA Trimestral".to_string(),
            client_name: "Padaria Central".to_string(),
            period_description: "Q1 2024".to_string(),
            year: "2024".to_string(),
            month_name: "March".to_string(),
            quarter: "1".to_string(),
            deadline: "2024-04-20".to_string(),
        }
    }

    #[test]
    fn test_renders_all_placeholders() {
        let text = render_template(
            "{obligation_name} | {client_name} | {period_description} | {year} | {month_name} | Q{quarter} | {deadline}",
            &context(),
        )
        .unwrap();
        assert_eq!(
            text,
            "IVA Trimestral | Padaria Central | Q1 2024 | 2024 | March | Q1 | 2024-04-20"
        );
    }

    #[test]
    fn test_escaped_braces() {
        let text = render_template("{{literal}} {year}", &context()).unwrap();
        assert_eq!(text, "{literal} 2024");
    }

    #[test]
    fn test_unknown_placeholder_is_an_error() {
        assert!(matches!(
            render_template("{nif} {client_name}", &context()),
            Err(EngineError::Template(_))
        ));
        assert!(render_template("{client_name", &context()).is_err());
        assert!(render_template("client}", &context()).is_err());
    }

    #[test]
    fn test_fallback_never_fails() {
        let text = render_or_default("{nif}", &context(), "{obligation_name} - {client_name}");
        assert_eq!(text, "IVA Trimestral - Padaria Central");

        let text = render_or_default("   ", &context(), "{obligation_name}");
        assert_eq!(text, "IVA Trimestral");
    }
}
