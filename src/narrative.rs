//! Turns trigger events and raw breaches into narratives, and writes them
//! without ever creating two live narratives for the same dedup key.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::breach;
use crate::error::{bounded, StoreError};
use crate::models::{DedupKey, NewNarrative, Period, Signal, AUTO_AUTHOR};
use crate::rules::TriggerEvent;
use crate::store::{CreateOutcome, NarrativeStore};
use crate::template::TemplateContext;

/// A narrative ready for the dedup check, plus the number of template
/// placeholders that could not be resolved while drafting it.
#[derive(Debug, Clone)]
pub struct Draft {
    pub narrative: NewNarrative,
    pub anomalies: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisOutcome {
    Created { id: Uuid, anomalies: usize },
    /// An active narrative already covers the dedup key.
    Duplicate { existing: Uuid },
}

/// Drafts the narrative for a matched rule. `None` when none of the
/// trigger's evidence signals are in `signals`.
pub fn draft_from_trigger(trigger: &TriggerEvent, signals: &[Signal]) -> Option<Draft> {
    let matching: Vec<&Signal> = trigger
        .matching_signal_ids
        .iter()
        .filter_map(|id| signals.iter().find(|s| &s.id == id))
        .collect();
    let period = Period::spanning(matching.iter().copied())?;

    let playbook = &trigger.playbook;
    let context = TemplateContext {
        rule_name: &trigger.rule_name,
        category: &trigger.category,
        severity: playbook.severity,
        signals: matching.clone(),
    };

    let summary = context.render(&playbook.narrative_template);
    let (title, title_anomalies) = match &playbook.title_template {
        Some(template) => {
            let rendered = context.render(template);
            (rendered.text, rendered.unresolved.len())
        }
        None => (trigger.rule_name.clone(), 0),
    };

    let evidence = json!({
        "source": "rule",
        "rule_id": trigger.rule_id,
        "rule_name": trigger.rule_name,
        "severity": playbook.severity,
        "evaluated_at": trigger.evaluated_at,
        "matching_signals": matching.iter().map(|s| s.snapshot()).collect::<Vec<_>>(),
    });

    let signal_ids: BTreeSet<Uuid> = matching.iter().map(|s| s.id).collect();
    Some(Draft {
        narrative: NewNarrative {
            title,
            summary: summary.text,
            actions: playbook.actions.clone(),
            evidence,
            author: trigger.rule_name.clone(),
            generated_at: Utc::now(),
            dedup: DedupKey::new(trigger.rule_name.clone(), signal_ids, period),
        },
        anomalies: summary.unresolved.len() + title_anomalies,
    })
}

/// Drafts the default narrative for a signal breaching its threshold.
pub fn draft_from_breach(signal: &Signal) -> Draft {
    let content = breach::default_content(signal);
    Draft {
        narrative: NewNarrative {
            title: content.title,
            summary: content.summary,
            actions: content.actions,
            evidence: json!({
                "source": AUTO_AUTHOR,
                "signal": signal.snapshot(),
            }),
            author: AUTO_AUTHOR.to_string(),
            generated_at: Utc::now(),
            dedup: DedupKey::new(AUTO_AUTHOR, BTreeSet::from([signal.id]), signal.period()),
        },
        anomalies: 0,
    }
}

pub struct Synthesizer {
    store: Arc<dyn NarrativeStore>,
    timeout: Duration,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Synthesizer {
    pub fn new(store: Arc<dyn NarrativeStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, lock_key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().await;
        Arc::clone(locks.entry(lock_key.to_string()).or_default())
    }

    /// Drops the key's lock once no other synthesis holds or waits on it.
    async fn release(&self, lock_key: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.key_locks.lock().await;
        // One reference in the map, one in `lock`.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(lock_key);
        }
    }

    #[cfg(test)]
    async fn tracked_keys(&self) -> usize {
        self.key_locks.lock().await.len()
    }

    /// Writes the draft unless an active narrative with a colliding dedup key
    /// exists. Drafts sharing a lock key are serialized in-process; the store
    /// repeats the check atomically with the insert for other processes.
    pub async fn synthesize(&self, draft: Draft) -> Result<SynthesisOutcome, StoreError> {
        let lock_key = draft.narrative.dedup.lock_key();
        let lock = self.lock_for(&lock_key).await;
        let outcome = {
            let _guard = lock.lock().await;
            self.write_unless_active(draft).await
        };
        self.release(&lock_key, lock).await;
        outcome
    }

    async fn write_unless_active(&self, draft: Draft) -> Result<SynthesisOutcome, StoreError> {
        let key = draft.narrative.dedup.clone();
        let existing = bounded(
            "find_active_narrative",
            self.timeout,
            self.store.find_active_narrative(&key),
        )
        .await?;
        if let Some(existing) = existing {
            let existing = existing.id;
            debug!(author = %key.author, %existing, "narrative already active, skipping");
            return Ok(SynthesisOutcome::Duplicate { existing });
        }

        let title = draft.narrative.title.clone();
        let outcome = bounded(
            "create_narrative",
            self.timeout,
            self.store.create_narrative(draft.narrative),
        )
        .await?;

        match outcome {
            CreateOutcome::Created(id) => {
                if draft.anomalies > 0 {
                    warn!(
                        %id,
                        author = %key.author,
                        anomalies = draft.anomalies,
                        "narrative created with unresolved template placeholders"
                    );
                }
                info!(%id, author = %key.author, %title, "narrative created");
                Ok(SynthesisOutcome::Created {
                    id,
                    anomalies: draft.anomalies,
                })
            }
            CreateOutcome::Duplicate(existing) => {
                debug!(author = %key.author, %existing, "narrative created elsewhere, skipping");
                Ok(SynthesisOutcome::Duplicate { existing })
            }
        }
    }
}

/// Ids of every signal referenced by rule evidence, for excluding them from
/// the auto-generate pass.
pub fn covered_signal_ids(triggers: &[TriggerEvent]) -> BTreeSet<Uuid> {
    triggers
        .iter()
        .flat_map(|trigger| trigger.matching_signal_ids.iter().copied())
        .collect()
}

/// Decoded evidence as exported for a draft; used by previews.
pub fn preview_json(draft: &Draft) -> Value {
    json!({
        "title": draft.narrative.title,
        "summary": draft.narrative.summary,
        "actions": draft.narrative.actions,
        "evidence": draft.narrative.evidence,
        "author": draft.narrative.author,
        "template_anomalies": draft.anomalies,
    })
}
