//! `{placeholder}` substitution for playbook narrative templates.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::models::{Severity, Signal};

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER_RE: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER_RE.get_or_init(|| {
        Regex::new(r"\{\s*([A-Za-z0-9_.]+)\s*\}").expect("placeholder regex should compile")
    })
}

/// Values a template may reference: the rule itself plus the signals that
/// matched it, in evidence order.
pub struct TemplateContext<'a> {
    pub rule_name: &'a str,
    pub category: &'a str,
    pub severity: Severity,
    pub signals: Vec<&'a Signal>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Rendered {
    pub text: String,
    /// Placeholders that resolved to nothing and were rendered empty.
    pub unresolved: Vec<String>,
}

impl TemplateContext<'_> {
    pub fn render(&self, template: &str) -> Rendered {
        let mut unresolved = Vec::new();
        let text = placeholder_regex()
            .replace_all(template, |caps: &Captures| {
                let name = &caps[1];
                match self.resolve(name) {
                    Some(value) => display_value(&value),
                    None => {
                        unresolved.push(name.to_string());
                        String::new()
                    }
                }
            })
            .into_owned();
        Rendered { text, unresolved }
    }

    fn resolve(&self, name: &str) -> Option<Value> {
        match name {
            "rule_name" => return Some(Value::from(self.rule_name)),
            "category" => return Some(Value::from(self.category)),
            "severity" => return Some(Value::from(self.severity.as_str())),
            _ => {}
        }

        // late_invoice_risk.late_percentage
        if let Some((kind, path)) = name.split_once('.') {
            if let Some(signal) = self.signals.iter().find(|s| s.kind.as_str() == kind) {
                if let Some(value) = signal.field(path) {
                    return Some(value);
                }
            }
        }

        // late_invoice_risk_late_percentage
        for signal in &self.signals {
            if let Some(field) = name
                .strip_prefix(signal.kind.as_str())
                .and_then(|rest| rest.strip_prefix('_'))
            {
                if let Some(value) = signal.field(field) {
                    return Some(value);
                }
            }
        }

        self.signals.iter().find_map(|signal| signal.field(name))
    }
}

/// Integers print without a fractional part; strings print unquoted.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                int.to_string()
            } else if let Some(float) = number.as_f64() {
                if float.fract() == 0.0 && float.abs() < 1e15 {
                    format!("{}", float as i64)
                } else {
                    float.to_string()
                }
            } else {
                number.to_string()
            }
        }
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SignalKind;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use uuid::Uuid;

    fn late_invoice_signal() -> Signal {
        Signal {
            id: Uuid::new_v4(),
            kind: SignalKind::LateInvoiceRisk,
            score: 0.82,
            threshold: 0.7,
            payload: json!({"late_percentage": 0.35, "late_invoices": 7, "total_invoices": 20})
                .as_object()
                .cloned()
                .unwrap(),
            period_start: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
            period_end: Utc.with_ymd_and_hms(2026, 3, 31, 0, 0, 0).unwrap(),
        }
    }

    fn context(signal: &Signal) -> TemplateContext<'_> {
        TemplateContext {
            rule_name: "Late Invoice Alert",
            category: "finance",
            severity: Severity::High,
            signals: vec![signal],
        }
    }

    #[test]
    fn substitutes_rule_and_signal_fields() {
        let signal = late_invoice_signal();
        let rendered = context(&signal).render(
            "[{severity}] {rule_name}: {late_invoices} of {late_invoice_risk_total_invoices} late ({late_invoice_risk.score})",
        );
        assert_eq!(rendered.text, "[high] Late Invoice Alert: 7 of 20 late (0.82)");
        assert!(rendered.unresolved.is_empty());
    }

    #[test]
    fn unresolved_placeholders_render_empty_and_are_reported() {
        let signal = late_invoice_signal();
        let rendered = context(&signal).render("Overdue: {late_amonut} ({ late_invoices })");
        assert_eq!(rendered.text, "Overdue:  (7)");
        assert_eq!(rendered.unresolved, vec!["late_amonut".to_string()]);
    }

    #[test]
    fn plain_text_passes_through() {
        let signal = late_invoice_signal();
        let rendered = context(&signal).render("High risk of late payments detected");
        assert_eq!(rendered.text, "High risk of late payments detected");
    }

    #[test]
    fn numbers_render_compactly() {
        assert_eq!(display_value(&json!(7)), "7");
        assert_eq!(display_value(&json!(20.0)), "20");
        assert_eq!(display_value(&json!(0.35)), "0.35");
        assert_eq!(display_value(&json!(["a"])), r#"["a"]"#);
    }
}
