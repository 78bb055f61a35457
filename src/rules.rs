//! Playbook decoding and the evaluation run over all enabled rules.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::condition::{Condition, DefinitionError, SignalCatalog};
use crate::models::{Rule, Severity, Signal};

/// A rule's decoded definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Playbook {
    pub when: Condition,
    pub narrative_template: String,
    pub title_template: Option<String>,
    pub actions: Vec<String>,
    pub severity: Severity,
}

impl Playbook {
    pub fn parse(definition: &str, catalog: &SignalCatalog) -> Result<Self, DefinitionError> {
        let value: Value = serde_json::from_str(definition)
            .map_err(|err| DefinitionError::InvalidJson(err.to_string()))?;
        Self::from_json(&value, catalog)
    }

    pub fn from_json(value: &Value, catalog: &SignalCatalog) -> Result<Self, DefinitionError> {
        let root = value
            .as_object()
            .ok_or_else(|| DefinitionError::Malformed("definition must be an object".to_string()))?;
        let then = root.get("then").and_then(Value::as_object);
        let field = |key: &str| lookup(root, then, key);

        let when = root.get("when").ok_or(DefinitionError::MissingField("when"))?;
        let when = Condition::from_json(when, catalog)?;

        let narrative_template = field("narrative_template")
            .and_then(Value::as_str)
            .ok_or(DefinitionError::MissingField("narrative_template"))?
            .to_string();

        let title_template = field("title_template")
            .or_else(|| field("title"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let actions = match field("actions") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| item.as_str().map(str::to_string).ok_or_else(malformed_actions))
                .collect::<Result<Vec<String>, _>>()?,
            Some(_) => return Err(malformed_actions()),
        };

        let severity = match field("severity") {
            None | Some(Value::Null) => Severity::default(),
            Some(Value::String(name)) => Severity::parse(name)
                .ok_or_else(|| DefinitionError::UnknownSeverity(name.clone()))?,
            Some(other) => return Err(DefinitionError::UnknownSeverity(other.to_string())),
        };

        Ok(Self {
            when,
            narrative_template,
            title_template,
            actions,
            severity,
        })
    }
}

fn malformed_actions() -> DefinitionError {
    DefinitionError::Malformed("`actions` must be a list of strings".to_string())
}

/// Narrative keys may sit at the top level or under `then`.
fn lookup<'a>(
    root: &'a Map<String, Value>,
    then: Option<&'a Map<String, Value>>,
    key: &str,
) -> Option<&'a Value> {
    root.get(key).or_else(|| then.and_then(|t| t.get(key)))
}

/// Outcome of evaluating one rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleResult {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub priority: i32,
    pub category: String,
    pub matched: bool,
    pub evidence: Vec<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A rule matched the current signal set. Never persisted.
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub category: String,
    pub playbook: Arc<Playbook>,
    pub matching_signal_ids: Vec<Uuid>,
    pub evaluated_at: DateTime<Utc>,
}

/// Cooperative cancellation shared between a caller and a run.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct Evaluated {
    /// In processing order, up to the cancellation point.
    pub results: Vec<RuleResult>,
    pub triggers: Vec<TriggerEvent>,
    pub cancelled: bool,
}

pub struct RuleEngine {
    catalog: Arc<SignalCatalog>,
    max_concurrency: usize,
}

impl RuleEngine {
    pub fn new(catalog: SignalCatalog, max_concurrency: usize) -> Self {
        Self {
            catalog: Arc::new(catalog),
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn catalog(&self) -> &SignalCatalog {
        &self.catalog
    }

    /// Ascending priority, then creation time; id breaks any remaining tie.
    pub fn order(rules: &mut [Rule]) {
        rules.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
    }

    /// Evaluates every rule against the full signal set. Rules run on the
    /// blocking pool, at most `max_concurrency` at a time; results come back
    /// in priority order regardless of completion order.
    pub async fn evaluate_all(
        &self,
        rules: Vec<Rule>,
        signals: Arc<Vec<Signal>>,
        cancel: &CancelFlag,
    ) -> Evaluated {
        self.evaluate_all_observed(rules, signals, cancel, log_result)
            .await
    }

    /// Like `evaluate_all`, handing each result to `observe` as it is
    /// collected. A rule not yet started when the flag is raised never runs.
    pub async fn evaluate_all_observed<F>(
        &self,
        mut rules: Vec<Rule>,
        signals: Arc<Vec<Signal>>,
        cancel: &CancelFlag,
        mut observe: F,
    ) -> Evaluated
    where
        F: FnMut(&RuleResult),
    {
        Self::order(&mut rules);

        let mut pending = stream::iter(rules.into_iter().map(|rule| {
            let catalog = Arc::clone(&self.catalog);
            let signals = Arc::clone(&signals);
            let cancel = cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    return None;
                }
                let fallback = failed_result(&rule, "rule evaluation panicked".to_string());
                let task = move || evaluate_rule(&rule, &signals, &catalog);
                let outcome = tokio::task::spawn_blocking(task).await;
                Some(outcome.unwrap_or((fallback, None)))
            }
        }))
        .buffered(self.max_concurrency);

        let mut evaluated = Evaluated::default();
        while let Some(outcome) = pending.next().await {
            let Some((result, trigger)) = outcome else {
                evaluated.cancelled = true;
                break;
            };
            observe(&result);
            evaluated.results.push(result);
            evaluated.triggers.extend(trigger);
        }
        evaluated
    }
}

fn log_result(result: &RuleResult) {
    match &result.error {
        Some(error) => {
            warn!(rule = %result.rule_name, %error, "skipping rule with invalid definition")
        }
        None => debug!(
            rule = %result.rule_name,
            priority = result.priority,
            matched = result.matched,
            evidence = result.evidence.len(),
            "rule evaluated"
        ),
    }
}

fn failed_result(rule: &Rule, error: String) -> RuleResult {
    RuleResult {
        rule_id: rule.id,
        rule_name: rule.name.clone(),
        priority: rule.priority,
        category: rule.category.clone(),
        matched: false,
        evidence: Vec::new(),
        severity: None,
        error: Some(error),
    }
}

/// Decodes and evaluates one rule; pure.
pub fn evaluate_rule(
    rule: &Rule,
    signals: &[Signal],
    catalog: &SignalCatalog,
) -> (RuleResult, Option<TriggerEvent>) {
    let playbook = match Playbook::parse(&rule.definition, catalog) {
        Ok(playbook) => Arc::new(playbook),
        Err(err) => return (failed_result(rule, err.to_string()), None),
    };

    let evaluation = playbook.when.evaluate(signals);
    let result = RuleResult {
        rule_id: rule.id,
        rule_name: rule.name.clone(),
        priority: rule.priority,
        category: rule.category.clone(),
        matched: evaluation.matched,
        evidence: evaluation.evidence.clone(),
        severity: Some(playbook.severity),
        error: None,
    };

    let trigger = evaluation.matched.then(|| TriggerEvent {
        rule_id: rule.id,
        rule_name: rule.name.clone(),
        category: rule.category.clone(),
        playbook: Arc::clone(&playbook),
        matching_signal_ids: evaluation.evidence,
        evaluated_at: Utc::now(),
    });

    (result, trigger)
}

/// Builds the definition JSON operators write, for seeding and tests.
pub fn definition_json(
    when: Value,
    template: &str,
    actions: &[&str],
    severity: Severity,
) -> String {
    let mut root = Map::new();
    root.insert("when".into(), when);
    root.insert("narrative_template".into(), Value::from(template));
    root.insert(
        "actions".into(),
        Value::Array(actions.iter().map(|a| Value::from(*a)).collect()),
    );
    root.insert("severity".into(), Value::from(severity.as_str()));
    Value::Object(root).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SignalKind;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

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

    fn rule(name: &str, priority: i32, created_offset_secs: i64, definition: String) -> Rule {
        Rule {
            id: Uuid::new_v4(),
            name: name.into(),
            priority,
            category: "finance".into(),
            enabled: true,
            definition,
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
                + Duration::seconds(created_offset_secs),
        }
    }

    fn late_invoice_definition() -> String {
        definition_json(
            json!({"all": [{"signal": "late_invoice_risk", "where": {"score": {"gte": 0.7}}}]}),
            "High risk of late payments detected",
            &["Review payment terms", "Contact customers"],
            Severity::High,
        )
    }

    fn engine() -> RuleEngine {
        RuleEngine::new(SignalCatalog::default(), 4)
    }

    #[test]
    fn parses_top_level_and_nested_then_definitions() {
        let catalog = SignalCatalog::default();
        let top = Playbook::parse(&late_invoice_definition(), &catalog).unwrap();
        assert_eq!(top.severity, Severity::High);
        assert_eq!(top.actions, vec!["Review payment terms", "Contact customers"]);
        assert_eq!(top.title_template, None);

        let nested = Playbook::parse(
            &json!({
                "when": {"signal": "support_churn_flag"},
                "then": {
                    "narrative_template": "Churn risk",
                    "title": "Churn {severity}",
                    "actions": ["Call"]
                }
            })
            .to_string(),
            &catalog,
        )
        .unwrap();
        assert_eq!(nested.narrative_template, "Churn risk");
        assert_eq!(nested.title_template.as_deref(), Some("Churn {severity}"));
        assert_eq!(nested.severity, Severity::Medium);
    }

    #[test]
    fn rejects_incomplete_definitions() {
        let catalog = SignalCatalog::default();
        assert_eq!(
            Playbook::parse(r#"{"narrative_template": "x"}"#, &catalog),
            Err(DefinitionError::MissingField("when"))
        );
        assert_eq!(
            Playbook::parse(r#"{"when": {"all": []}}"#, &catalog),
            Err(DefinitionError::MissingField("narrative_template"))
        );
        let dire = r#"{"when": {"all": []}, "narrative_template": "x", "severity": "dire"}"#;
        assert_eq!(
            Playbook::parse(dire, &catalog),
            Err(DefinitionError::UnknownSeverity("dire".into()))
        );
        assert!(matches!(
            Playbook::parse("{not json", &catalog),
            Err(DefinitionError::InvalidJson(_))
        ));
    }

    #[tokio::test]
    async fn late_invoice_rule_matches_example_signal() {
        let signal = late_invoice_signal();
        let rules = vec![rule("Late Invoice Alert", 1, 0, late_invoice_definition())];

        let evaluated = engine()
            .evaluate_all(rules, Arc::new(vec![signal.clone()]), &CancelFlag::new())
            .await;

        assert_eq!(evaluated.results.len(), 1);
        let result = &evaluated.results[0];
        assert!(result.matched);
        assert_eq!(result.evidence, vec![signal.id]);
        assert_eq!(result.severity, Some(Severity::High));
        assert_eq!(evaluated.triggers.len(), 1);
        assert_eq!(evaluated.triggers[0].matching_signal_ids, vec![signal.id]);
    }

    #[tokio::test]
    async fn processes_rules_by_priority_then_creation_time() {
        let definition = late_invoice_definition();
        let rules = vec![
            rule("second", 2, 0, definition.clone()),
            rule("first-older", 1, 0, definition.clone()),
            rule("third", 3, 0, definition.clone()),
            rule("first-newer", 1, 60, definition),
        ];

        let evaluated = engine()
            .evaluate_all(rules, Arc::new(vec![late_invoice_signal()]), &CancelFlag::new())
            .await;

        let order: Vec<_> = evaluated.results.iter().map(|r| &r.rule_name).collect();
        assert_eq!(order, ["first-older", "first-newer", "second", "third"]);
        let trigger_order: Vec<_> = evaluated.triggers.iter().map(|t| &t.rule_name).collect();
        assert_eq!(trigger_order, order);
    }

    #[tokio::test]
    async fn invalid_definitions_do_not_abort_the_run() {
        let broken = json!({
            "when": {"signal": "late_invoice_risk", "where": {"score": {"approx": 1}}},
            "narrative_template": "x"
        });
        let unknown = json!({"when": {"signal": "weather"}, "narrative_template": "x"});
        let rules = vec![
            rule("broken", 1, 0, broken.to_string()),
            rule("unknown kind", 2, 0, unknown.to_string()),
            rule("good", 3, 0, late_invoice_definition()),
        ];

        let evaluated = engine()
            .evaluate_all(rules, Arc::new(vec![late_invoice_signal()]), &CancelFlag::new())
            .await;

        assert_eq!(evaluated.results.len(), 3);
        assert_eq!(evaluated.results[0].error.as_deref(), Some("unknown operator `approx`"));
        assert!(!evaluated.results[0].matched);
        assert_eq!(evaluated.results[1].error.as_deref(), Some("unknown signal kind `weather`"));
        assert!(evaluated.results[2].matched);
        assert_eq!(evaluated.triggers.len(), 1);
        assert_eq!(evaluated.triggers[0].rule_name, "good");
    }

    #[tokio::test]
    async fn repeated_runs_are_deterministic() {
        let signals = Arc::new(vec![late_invoice_signal()]);
        let rules: Vec<_> = (0..6)
            .map(|i| rule(&format!("rule-{i}"), (i % 3) as i32 + 1, i, late_invoice_definition()))
            .collect();

        let first = engine()
            .evaluate_all(rules.clone(), Arc::clone(&signals), &CancelFlag::new())
            .await;
        let second = engine()
            .evaluate_all(rules, signals, &CancelFlag::new())
            .await;
        assert_eq!(first.results, second.results);
    }

    #[tokio::test]
    async fn cancelled_runs_return_no_further_results() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let rules = vec![rule("a", 1, 0, late_invoice_definition())];

        let evaluated = engine()
            .evaluate_all(rules, Arc::new(vec![late_invoice_signal()]), &cancel)
            .await;

        assert!(evaluated.cancelled);
        assert!(evaluated.results.is_empty());
        assert!(evaluated.triggers.is_empty());
    }

    #[tokio::test]
    async fn cancelling_mid_run_stops_after_the_current_rule() {
        let cancel = CancelFlag::new();
        let rules: Vec<_> = (0..5)
            .map(|i| rule(&format!("rule-{i}"), i as i32 + 1, 0, late_invoice_definition()))
            .collect();
        let stop_after = 2;

        let mut seen = 0;
        let evaluated = RuleEngine::new(SignalCatalog::default(), 1)
            .evaluate_all_observed(rules, Arc::new(vec![late_invoice_signal()]), &cancel, |_| {
                seen += 1;
                if seen == stop_after {
                    cancel.cancel();
                }
            })
            .await;

        assert!(evaluated.cancelled);
        assert_eq!(evaluated.results.len(), stop_after);
        assert_eq!(evaluated.triggers.len(), stop_after);
        let names: Vec<_> = evaluated.results.iter().map(|r| &r.rule_name).collect();
        assert_eq!(names, ["rule-0", "rule-1"]);
    }
}
