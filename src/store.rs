//! Store seams consumed and produced by the engine, plus an in-process
//! implementation used by `--memory` and by tests.

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    DedupKey, Narrative, NarrativeStatus, NewNarrative, Period, Rule, Signal, SignalKind,
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalFilter {
    pub kind: Option<SignalKind>,
    /// Keeps signals whose period ends within this window.
    pub ends_within: Option<Period>,
}

impl SignalFilter {
    pub fn accepts(&self, signal: &Signal) -> bool {
        let kind_ok = self.kind.as_ref().map_or(true, |kind| &signal.kind == kind);
        let window_ok = self
            .ends_within
            .map_or(true, |window| window.contains(signal.period_end));
        kind_ok && window_ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(Uuid),
    /// An active narrative with a colliding dedup key already exists.
    Duplicate(Uuid),
}

#[async_trait]
pub trait SignalStore: Send + Sync {
    async fn list_signals(&self, filter: &SignalFilter) -> Result<Vec<Signal>, StoreError>;
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn list_enabled_rules(&self) -> Result<Vec<Rule>, StoreError>;
}

#[async_trait]
pub trait NarrativeStore: Send + Sync {
    async fn find_active_narrative(&self, key: &DedupKey) -> Result<Option<Narrative>, StoreError>;

    /// Inserts unless a colliding active narrative exists; the check and the
    /// insert are atomic with respect to other writers of the same store.
    async fn create_narrative(&self, narrative: NewNarrative) -> Result<CreateOutcome, StoreError>;

    async fn get_narrative(&self, id: Uuid) -> Result<Option<Narrative>, StoreError>;

    /// Newest first.
    async fn list_narratives(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Narrative>, StoreError>;
}

#[derive(Default)]
pub struct MemoryStore {
    signals: RwLock<Vec<Signal>>,
    rules: RwLock<Vec<Rule>>,
    narratives: Mutex<Vec<Narrative>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_signal(&self, signal: Signal) {
        self.signals.write().await.push(signal);
    }

    pub async fn insert_rule(&self, rule: Rule) {
        self.rules.write().await.push(rule);
    }

    /// Stores a narrative exactly as given, bypassing dedup.
    #[cfg(test)]
    pub async fn insert_narrative(&self, narrative: Narrative) {
        self.narratives.lock().await.push(narrative);
    }

    pub async fn archive_narrative(&self, id: Uuid) -> bool {
        let mut narratives = self.narratives.lock().await;
        match narratives.iter_mut().find(|n| n.id == id) {
            Some(narrative) => {
                narrative.status = NarrativeStatus::Archived;
                true
            }
            None => false,
        }
    }

    /// Every narrative in insertion order.
    pub async fn narratives(&self) -> Vec<Narrative> {
        self.narratives.lock().await.clone()
    }
}

fn find_colliding<'a>(narratives: &'a [Narrative], key: &DedupKey) -> Option<&'a Narrative> {
    narratives
        .iter()
        .find(|narrative| narrative.is_active() && narrative.dedup.collides_with(key))
}

#[async_trait]
impl SignalStore for MemoryStore {
    async fn list_signals(&self, filter: &SignalFilter) -> Result<Vec<Signal>, StoreError> {
        Ok(self
            .signals
            .read()
            .await
            .iter()
            .filter(|signal| filter.accepts(signal))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn list_enabled_rules(&self) -> Result<Vec<Rule>, StoreError> {
        Ok(self
            .rules
            .read()
            .await
            .iter()
            .filter(|rule| rule.enabled)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl NarrativeStore for MemoryStore {
    async fn find_active_narrative(
        &self,
        key: &DedupKey,
    ) -> Result<Option<Narrative>, StoreError> {
        let narratives = self.narratives.lock().await;
        Ok(find_colliding(&narratives, key).cloned())
    }

    async fn create_narrative(&self, narrative: NewNarrative) -> Result<CreateOutcome, StoreError> {
        let mut narratives = self.narratives.lock().await;
        if let Some(existing) = find_colliding(&narratives, &narrative.dedup) {
            return Ok(CreateOutcome::Duplicate(existing.id));
        }
        let id = Uuid::new_v4();
        narratives.push(Narrative::from_new(id, narrative));
        Ok(CreateOutcome::Created(id))
    }

    async fn get_narrative(&self, id: Uuid) -> Result<Option<Narrative>, StoreError> {
        let narratives = self.narratives.lock().await;
        Ok(narratives.iter().find(|n| n.id == id).cloned())
    }

    async fn list_narratives(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Narrative>, StoreError> {
        let mut narratives = self.narratives.lock().await.clone();
        // Stable sort keeps insertion order among equal timestamps; reverse it
        // so the most recent insert comes first.
        narratives.reverse();
        narratives.sort_by(|a, b| b.generated_at.cmp(&a.generated_at));
        Ok(narratives.into_iter().skip(offset).take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;
    use std::collections::BTreeSet;

    fn signal(kind: SignalKind, day: u32) -> Signal {
        let start = Utc.with_ymd_and_hms(2026, 3, day, 0, 0, 0).unwrap();
        Signal {
            id: Uuid::new_v4(),
            kind,
            score: 0.6,
            threshold: 0.5,
            payload: Default::default(),
            period_start: start,
            period_end: start + Duration::days(6),
        }
    }

    fn new_narrative(author: &str, signal: &Signal) -> NewNarrative {
        NewNarrative {
            title: "Title".into(),
            summary: "Summary".into(),
            actions: vec!["Act".into()],
            evidence: json!({"signal": signal.id}),
            author: author.into(),
            generated_at: Utc::now(),
            dedup: DedupKey::new(author, BTreeSet::from([signal.id]), signal.period()),
        }
    }

    #[tokio::test]
    async fn filters_signals_by_kind_and_period_end() {
        let store = MemoryStore::new();
        // Periods run six days from the given day.
        store.insert_signal(signal(SignalKind::LateInvoiceRisk, 1)).await;
        store.insert_signal(signal(SignalKind::LateInvoiceRisk, 10)).await;
        store.insert_signal(signal(SignalKind::LateInvoiceRisk, 20)).await;
        store.insert_signal(signal(SignalKind::SupportChurnFlag, 20)).await;

        let all = store.list_signals(&SignalFilter::default()).await.unwrap();
        assert_eq!(all.len(), 4);

        let filter = SignalFilter {
            kind: Some(SignalKind::LateInvoiceRisk),
            ends_within: Some(Period::new(
                Utc.with_ymd_and_hms(2026, 3, 14, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2026, 3, 24, 0, 0, 0).unwrap(),
            )),
        };
        let scoped = store.list_signals(&filter).await.unwrap();
        let starts: Vec<_> = scoped
            .iter()
            .map(|s| s.period_start.format("%d").to_string())
            .collect();
        // Day 10 ends on the 16th. Day 20 overlaps the window but ends on the 26th.
        assert_eq!(starts, ["10"]);
    }

    #[tokio::test]
    async fn create_is_skipped_while_a_colliding_narrative_is_active() {
        let store = MemoryStore::new();
        let late = signal(SignalKind::LateInvoiceRisk, 1);

        let first = store.create_narrative(new_narrative("auto", &late)).await;
        let Ok(CreateOutcome::Created(id)) = first else {
            panic!("first insert should create");
        };
        let second = store.create_narrative(new_narrative("auto", &late)).await;
        assert!(matches!(second, Ok(CreateOutcome::Duplicate(existing)) if existing == id));

        let rule_authored = new_narrative("Late Invoice Alert", &late);
        let other_author = store.create_narrative(rule_authored).await;
        assert!(matches!(other_author, Ok(CreateOutcome::Created(_))));

        assert!(store.archive_narrative(id).await);
        let after_archive = store.create_narrative(new_narrative("auto", &late)).await;
        assert!(matches!(after_archive, Ok(CreateOutcome::Created(_))));
        assert_eq!(store.narratives().await.len(), 3);
    }

    #[tokio::test]
    async fn only_enabled_rules_are_listed() {
        let store = MemoryStore::new();
        for (name, enabled) in [("on", true), ("off", false)] {
            store
                .insert_rule(Rule {
                    id: Uuid::new_v4(),
                    name: name.into(),
                    priority: 1,
                    category: "general".into(),
                    enabled,
                    definition: "{}".into(),
                    created_at: Utc::now(),
                })
                .await;
        }
        let rules = store.list_enabled_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "on");
    }

    #[tokio::test]
    async fn lists_newest_first_with_paging() {
        let store = MemoryStore::new();
        for day in 1..=3 {
            let s = signal(SignalKind::LateInvoiceRisk, day);
            let mut narrative = new_narrative("auto", &s);
            narrative.title = format!("day {day}");
            narrative.generated_at = Utc.with_ymd_and_hms(2026, 3, day, 12, 0, 0).unwrap();
            store.create_narrative(narrative).await.unwrap();
        }
        let page = store.list_narratives(2, 0).await.unwrap();
        let titles: Vec<_> = page.iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, ["day 3", "day 2"]);
        let rest = store.list_narratives(2, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].title, "day 1");
    }
}
