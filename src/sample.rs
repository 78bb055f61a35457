//! Realistic signals and playbooks for `seed` and `--memory`.

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::models::{Rule, Severity, Signal, SignalKind};
use crate::rules::definition_json;
use crate::store::MemoryStore;

fn day(year: i32, month: u32, day: u32) -> anyhow::Result<DateTime<Utc>> {
    let date = NaiveDate::from_ymd_opt(year, month, day).context("invalid date")?;
    Ok(date.and_hms_opt(0, 0, 0).context("invalid time")?.and_utc())
}

fn payload(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

pub fn signals() -> anyhow::Result<Vec<Signal>> {
    let start = day(2026, 9, 1)?;
    let end = day(2026, 9, 30)?;

    let signals = vec![
        (
            0x5a01,
            SignalKind::LateInvoiceRisk,
            0.82,
            0.7,
            json!({
                "late_percentage": 0.35,
                "late_invoices": 7,
                "total_invoices": 20,
                "late_amount": 18450.0
            }),
        ),
        (
            0x5a02,
            SignalKind::PipelineVelocityDelta,
            0.64,
            0.5,
            json!({"delta": -0.18, "current_velocity": 12.4, "previous_velocity": 15.1}),
        ),
        (
            0x5a03,
            SignalKind::StalledDealMotif,
            0.71,
            0.6,
            json!({"stalled_deals": 6, "avg_stall_duration": 23}),
        ),
        (
            0x5a04,
            SignalKind::SupportChurnFlag,
            0.42,
            0.5,
            json!({"churn_score": 0.42, "open_tickets": 31}),
        ),
        (
            0x5a05,
            SignalKind::MarketHeadwind,
            0.58,
            0.5,
            json!({"region": "emea"}),
        ),
    ];

    Ok(signals
        .into_iter()
        .map(|(id, kind, score, threshold, fields)| Signal {
            id: Uuid::from_u128(id),
            kind,
            score,
            threshold,
            payload: payload(fields),
            period_start: start,
            period_end: end,
        })
        .collect())
}

pub fn rules() -> anyhow::Result<Vec<Rule>> {
    let created_at = day(2026, 8, 15)?;

    let late_invoice = definition_json(
        json!({"all": [{"signal": "late_invoice_risk", "where": {"score": {"gte": 0.7}}}]}),
        "High risk of late payments detected",
        &["Review payment terms", "Contact customers"],
        Severity::High,
    );

    let pipeline_slowdown = json!({
        "when": {"all": [
            {"signal": "pipeline_velocity_delta", "where": {"delta": {"lt": 0}}},
            {"signal": "stalled_deal_motif", "where": {"stalled_deals": {"gte": 5}}}
        ]},
        "then": {
            "title_template": "Pipeline slowdown ({severity})",
            "narrative_template": "Velocity moved {pipeline_velocity_delta.delta} while {stalled_deal_motif.stalled_deals} deals sat idle for {avg_stall_duration} days on average.",
            "actions": ["Run a stalled-deal review", "Re-qualify aging opportunities"]
        },
        "severity": "critical"
    })
    .to_string();

    let churn_watch = json!({
        "when": {"any": [
            {"signal": "support_churn_flag", "where": {"score": {"gte": 0.6}}},
            {"signal": "customer_satisfaction", "where": {"score": {"lt": 0.4}}}
        ]},
        "narrative_template": "Churn indicators are elevated (score {support_churn_flag.score}).",
        "actions": ["Schedule account health reviews"],
        "severity": "medium"
    })
    .to_string();

    Ok(vec![
        Rule {
            id: Uuid::from_u128(0x7b01),
            name: "Late Invoice Alert".to_string(),
            priority: 1,
            category: "finance".to_string(),
            enabled: true,
            definition: late_invoice,
            created_at,
        },
        Rule {
            id: Uuid::from_u128(0x7b02),
            name: "Pipeline Slowdown".to_string(),
            priority: 2,
            category: "sales".to_string(),
            enabled: true,
            definition: pipeline_slowdown,
            created_at,
        },
        Rule {
            id: Uuid::from_u128(0x7b03),
            name: "Churn Watch".to_string(),
            priority: 3,
            category: "support".to_string(),
            enabled: true,
            definition: churn_watch,
            created_at,
        },
    ])
}

/// In-process stores preloaded with the sample data.
pub async fn memory_store() -> anyhow::Result<MemoryStore> {
    let store = MemoryStore::new();
    for signal in signals()? {
        store.insert_signal(signal).await;
    }
    for rule in rules()? {
        store.insert_rule(rule).await;
    }
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::SignalCatalog;
    use crate::rules::Playbook;

    #[test]
    fn sample_signals_respect_invariants() {
        for signal in signals().unwrap() {
            assert!((0.0..=1.0).contains(&signal.score));
            assert!((0.0..=1.0).contains(&signal.threshold));
            assert!(signal.period_start <= signal.period_end);
        }
    }

    #[test]
    fn sample_playbooks_decode() {
        let catalog = SignalCatalog::default();
        for rule in rules().unwrap() {
            Playbook::parse(&rule.definition, &catalog)
                .unwrap_or_else(|err| panic!("{} failed to decode: {err}", rule.name));
        }
    }
}
