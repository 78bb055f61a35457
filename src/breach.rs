use serde::Serialize;
use serde_json::Value;

use crate::models::{Signal, SignalKind};

/// Signals whose score exceeds their threshold, highest score first. Ties
/// fall back to kind, period and id so the order is stable across runs.
pub fn breaching_signals(signals: &[Signal]) -> Vec<&Signal> {
    let mut breaching: Vec<&Signal> = signals.iter().filter(|s| s.is_breaching()).collect();
    breaching.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.kind.cmp(&b.kind))
            .then_with(|| a.period_start.cmp(&b.period_start))
            .then_with(|| a.id.cmp(&b.id))
    });
    breaching
}

#[derive(Debug, Clone, PartialEq)]
pub struct DefaultContent {
    pub title: String,
    pub summary: String,
    pub actions: Vec<String>,
}

fn actions(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

fn percent(ratio: f64) -> String {
    format!("{:.0}%", ratio * 100.0)
}

/// Kind-specific narrative for a breaching signal with no matching rule.
pub fn default_content(signal: &Signal) -> DefaultContent {
    let number = |field: &str| signal.payload_number(field).unwrap_or(0.0);

    match &signal.kind {
        SignalKind::PipelineVelocityDelta => {
            let delta = number("delta");
            if delta > 0.0 {
                DefaultContent {
                    title: "Pipeline Velocity Improving".to_string(),
                    summary: format!(
                        "Sales pipeline velocity has improved by {} compared to the previous period.",
                        percent(delta)
                    ),
                    actions: actions(&[
                        "Continue current sales practices",
                        "Share best practices with team",
                        "Monitor for sustained improvement",
                    ]),
                }
            } else {
                DefaultContent {
                    title: "Pipeline Velocity Declining".to_string(),
                    summary: format!(
                        "Sales pipeline velocity has declined by {} compared to the previous period.",
                        percent(delta.abs())
                    ),
                    actions: actions(&[
                        "Review sales process bottlenecks",
                        "Analyze deal stage progression",
                        "Implement velocity improvement initiatives",
                    ]),
                }
            }
        }
        SignalKind::LateInvoiceRisk => {
            let mut summary = format!(
                "High risk of late payments detected: {} of invoices overdue",
                percent(number("late_percentage"))
            );
            if let Some(amount) = signal.payload_number("late_amount") {
                summary.push_str(&format!(", representing ${amount:.0} in overdue payments"));
            }
            summary.push('.');
            DefaultContent {
                title: "High Late Invoice Risk".to_string(),
                summary,
                actions: actions(&[
                    "Implement stricter payment terms",
                    "Automate payment reminders",
                    "Review credit policies for high-risk customers",
                ]),
            }
        }
        SignalKind::StalledDealMotif => DefaultContent {
            title: "Deals Stalled in Pipeline".to_string(),
            summary: format!(
                "{:.0} deals are stalled with an average stall duration of {:.0} days.",
                number("stalled_deals"),
                number("avg_stall_duration")
            ),
            actions: actions(&[
                "Review stalled deal strategies",
                "Implement deal acceleration programs",
                "Provide additional sales support resources",
            ]),
        },
        SignalKind::SupportChurnFlag => DefaultContent {
            title: "Customer Support Churn Risk".to_string(),
            summary: format!(
                "Customer support metrics indicate a churn risk score of {}.",
                percent(signal.payload_number("churn_score").unwrap_or(signal.score))
            ),
            actions: actions(&[
                "Review support ticket resolution times",
                "Implement customer satisfaction surveys",
                "Develop proactive customer success programs",
            ]),
        },
        other => DefaultContent {
            title: format!("{} Alert", other.display_name()),
            summary: format!(
                "Signal {} has been triggered with a score of {:.2} (threshold {:.2}).",
                other, signal.score, signal.threshold
            ),
            actions: actions(&[
                "Review signal details",
                "Investigate root causes",
                "Develop mitigation strategies",
            ]),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Insights {
    pub confidence: f64,
    pub priority: &'static str,
}

/// Confidence and priority derived from a narrative's evidence.
pub fn insights(evidence: &Value) -> Insights {
    let snapshots: Vec<&Value> = match (evidence.get("signal"), evidence.get("matching_signals")) {
        (Some(signal), _) => vec![signal],
        (None, Some(Value::Array(signals))) => signals.iter().collect(),
        _ => Vec::new(),
    };

    let top_score = snapshots
        .iter()
        .filter_map(|s| s.get("score").and_then(Value::as_f64))
        .fold(None, |acc: Option<f64>, score| Some(acc.map_or(score, |a| a.max(score))));

    let mut factors = Vec::new();
    if let Some(score) = top_score {
        factors.push(score);
    }
    if !snapshots.is_empty() {
        factors.push((snapshots.len() as f64 / 5.0).min(1.0));
        let payload_fields = snapshots
            .iter()
            .filter_map(|s| s.get("payload").and_then(Value::as_object))
            .map(|payload| payload.len())
            .max()
            .unwrap_or(0);
        factors.push((payload_fields as f64 / 10.0).min(1.0));
    }

    let confidence = if factors.is_empty() {
        0.5
    } else {
        factors.iter().sum::<f64>() / factors.len() as f64
    };

    let priority = match top_score {
        Some(score) if score > 0.8 => "high",
        Some(score) if score > 0.5 => "medium",
        _ => "low",
    };

    Insights { confidence, priority }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use uuid::Uuid;

    fn signal(kind: SignalKind, score: f64, threshold: f64, payload: Value) -> Signal {
        Signal {
            id: Uuid::new_v4(),
            kind,
            score,
            threshold,
            payload: payload.as_object().cloned().unwrap_or_default(),
            period_start: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
            period_end: Utc.with_ymd_and_hms(2026, 3, 31, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn selects_only_signals_above_threshold() {
        let signals = vec![
            signal(SignalKind::LateInvoiceRisk, 0.82, 0.7, json!({})),
            signal(SignalKind::SupportChurnFlag, 0.5, 0.5, json!({})),
            signal(SignalKind::StalledDealMotif, 0.95, 0.4, json!({})),
        ];
        let breaching = breaching_signals(&signals);
        assert_eq!(breaching.len(), 2);
        assert_eq!(breaching[0].kind, SignalKind::StalledDealMotif);
        assert_eq!(breaching[1].kind, SignalKind::LateInvoiceRisk);
    }

    #[test]
    fn late_invoice_summary_mentions_overdue_share() {
        let content = default_content(&signal(
            SignalKind::LateInvoiceRisk,
            0.82,
            0.7,
            json!({"late_percentage": 0.35, "late_invoices": 7, "total_invoices": 20}),
        ));
        assert_eq!(content.title, "High Late Invoice Risk");
        assert_eq!(
            content.summary,
            "High risk of late payments detected: 35% of invoices overdue."
        );
        assert_eq!(content.actions.len(), 3);
    }

    #[test]
    fn velocity_direction_picks_the_template() {
        let velocity = |delta: f64| {
            let payload = json!({ "delta": delta });
            default_content(&signal(SignalKind::PipelineVelocityDelta, 0.3, 0.1, payload))
        };

        let up = velocity(0.12);
        assert_eq!(up.title, "Pipeline Velocity Improving");
        assert!(up.summary.contains("improved by 12%"));

        let down = velocity(-0.2);
        assert_eq!(down.title, "Pipeline Velocity Declining");
        assert!(down.summary.contains("declined by 20%"));
    }

    #[test]
    fn unknown_kinds_get_a_generic_alert() {
        let content = default_content(&signal(SignalKind::MarketHeadwind, 0.66, 0.5, json!({})));
        assert_eq!(content.title, "Market Headwind Alert");
        assert!(content.summary.contains("score of 0.66"));
    }

    #[test]
    fn insights_follow_top_signal_score() {
        let evidence = json!({
            "source": "auto",
            "signal": {"score": 0.82, "payload": {"a": 1, "b": 2, "c": 3, "d": 4, "e": 5}}
        });
        let result = insights(&evidence);
        assert_eq!(result.priority, "high");
        let expected = (0.82 + 0.2 + 0.5) / 3.0;
        assert!((result.confidence - expected).abs() < 1e-9);

        let empty = insights(&json!("raw text"));
        assert_eq!(empty.priority, "low");
        assert_eq!(empty.confidence, 0.5);
    }
}
