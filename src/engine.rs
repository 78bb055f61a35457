//! Wires the stores, rule engine and synthesizer into the runs callers
//! trigger: "Evaluate Rules", "Auto-Generate", preview and export.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::breach::{self, Insights};
use crate::condition::SignalCatalog;
use crate::config::EngineConfig;
use crate::error::{bounded, EngineError, StoreError};
use crate::models::{Narrative, Period, Signal};
use crate::narrative::{self, SynthesisOutcome, Synthesizer};
use crate::report::{self, ExportFormat};
use crate::rules::{CancelFlag, Playbook, RuleEngine, RuleResult, TriggerEvent};
use crate::store::{NarrativeStore, RuleStore, SignalFilter, SignalStore};

/// Page size used when reading every narrative from the store.
const NARRATIVE_PAGE: usize = 100;

/// What a run did, including everything completed before a failure or
/// cancellation.
#[derive(Debug, Default, Serialize)]
pub struct RunReport {
    pub results: Vec<RuleResult>,
    pub created: Vec<Uuid>,
    pub duplicates_skipped: usize,
    /// Matched rules whose evidence named no signal in scope.
    pub skipped_no_evidence: usize,
    pub template_anomalies: usize,
    pub cancelled: bool,
    #[serde(skip)]
    pub failure: Option<EngineError>,
}

impl RunReport {
    fn record(&mut self, outcome: SynthesisOutcome) {
        match outcome {
            SynthesisOutcome::Created { id, anomalies } => {
                self.created.push(id);
                self.template_anomalies += anomalies;
            }
            SynthesisOutcome::Duplicate { .. } => self.duplicates_skipped += 1,
        }
    }

    fn fail(&mut self, err: StoreError) {
        warn!(error = %err, "run aborted by store failure");
        self.failure = Some(EngineError::TransientStore(err));
    }

    pub fn matched(&self) -> usize {
        self.results.iter().filter(|r| r.matched).count()
    }

    pub fn invalid(&self) -> usize {
        self.results.iter().filter(|r| r.error.is_some()).count()
    }
}

/// Dry-run of an unsaved playbook definition.
#[derive(Debug, Serialize)]
pub struct Preview {
    pub matched: bool,
    pub evidence: Vec<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub narrative: Option<Value>,
}

pub struct NarrativeEngine {
    signals: Arc<dyn SignalStore>,
    rules: Arc<dyn RuleStore>,
    narratives: Arc<dyn NarrativeStore>,
    rule_engine: RuleEngine,
    synthesizer: Synthesizer,
    config: EngineConfig,
}

impl NarrativeEngine {
    pub fn new(
        signals: Arc<dyn SignalStore>,
        rules: Arc<dyn RuleStore>,
        narratives: Arc<dyn NarrativeStore>,
        config: EngineConfig,
    ) -> Self {
        let catalog = SignalCatalog::new(config.extra_signal_kinds.iter().cloned());
        Self {
            rule_engine: RuleEngine::new(catalog, config.max_concurrent_rules),
            synthesizer: Synthesizer::new(Arc::clone(&narratives), config.store_timeout),
            signals,
            rules,
            narratives,
            config,
        }
    }

    pub fn catalog(&self) -> &SignalCatalog {
        self.rule_engine.catalog()
    }

    fn signal_filter(&self) -> SignalFilter {
        let now = Utc::now();
        SignalFilter {
            kind: None,
            ends_within: self
                .config
                .lookback_days
                .map(|days| Period::new(now - Duration::days(days), now)),
        }
    }

    async fn load_signals(&self) -> Result<Vec<Signal>, StoreError> {
        let filter = self.signal_filter();
        bounded(
            "list_signals",
            self.config.store_timeout,
            self.signals.list_signals(&filter),
        )
        .await
    }

    /// "Evaluate Rules": evaluates every enabled rule and creates a narrative
    /// for each match.
    pub async fn evaluate_rules(&self, cancel: &CancelFlag) -> RunReport {
        self.run(cancel, false).await
    }

    /// "Auto-Generate": an evaluation run followed by a default narrative for
    /// each breaching signal no matched rule already covers.
    pub async fn auto_generate(&self, cancel: &CancelFlag) -> RunReport {
        self.run(cancel, true).await
    }

    async fn run(&self, cancel: &CancelFlag, with_breaches: bool) -> RunReport {
        let mut report = RunReport::default();

        let rules = match bounded(
            "list_enabled_rules",
            self.config.store_timeout,
            self.rules.list_enabled_rules(),
        )
        .await
        {
            Ok(rules) => rules,
            Err(err) => {
                report.fail(err);
                return report;
            }
        };
        let signals = match self.load_signals().await {
            Ok(signals) => Arc::new(signals),
            Err(err) => {
                report.fail(err);
                return report;
            }
        };

        let evaluated = self
            .rule_engine
            .evaluate_all(rules, Arc::clone(&signals), cancel)
            .await;
        report.results = evaluated.results;
        report.cancelled = evaluated.cancelled;

        let mut drafts = Vec::new();
        for trigger in &evaluated.triggers {
            match narrative::draft_from_trigger(trigger, &signals) {
                Some(draft) => drafts.push(draft),
                None => {
                    warn!(rule = %trigger.rule_name, "rule matched without citing a signal");
                    report.skipped_no_evidence += 1;
                }
            }
        }

        if with_breaches {
            let covered = narrative::covered_signal_ids(&evaluated.triggers);
            drafts.extend(
                breach::breaching_signals(&signals)
                    .into_iter()
                    .filter(|signal| !covered.contains(&signal.id))
                    .map(narrative::draft_from_breach),
            );
        }

        for draft in drafts {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            match self.synthesizer.synthesize(draft).await {
                Ok(outcome) => report.record(outcome),
                Err(err) => {
                    report.fail(err);
                    break;
                }
            }
        }

        info!(
            rules = report.results.len(),
            matched = report.matched(),
            invalid = report.invalid(),
            created = report.created.len(),
            duplicates = report.duplicates_skipped,
            no_evidence = report.skipped_no_evidence,
            anomalies = report.template_anomalies,
            cancelled = report.cancelled,
            failed = report.failure.is_some(),
            auto = with_breaches,
            "narrative run finished"
        );
        report
    }

    /// Evaluates an unsaved definition against the current signals without
    /// writing anything.
    pub async fn preview(&self, name: &str, definition: &Value) -> Result<Preview, EngineError> {
        let playbook = Arc::new(Playbook::from_json(definition, self.catalog())?);
        let signals = self.load_signals().await?;
        let evaluation = playbook.when.evaluate(&signals);

        let narrative = if evaluation.matched {
            let trigger = TriggerEvent {
                rule_id: Uuid::nil(),
                rule_name: name.to_string(),
                category: "preview".to_string(),
                playbook,
                matching_signal_ids: evaluation.evidence.clone(),
                evaluated_at: Utc::now(),
            };
            narrative::draft_from_trigger(&trigger, &signals)
                .map(|draft| narrative::preview_json(&draft))
        } else {
            None
        };

        Ok(Preview {
            matched: evaluation.matched,
            evidence: evaluation.evidence,
            narrative,
        })
    }

    pub async fn narrative(&self, id: Uuid) -> Result<Narrative, EngineError> {
        bounded(
            "get_narrative",
            self.config.store_timeout,
            self.narratives.get_narrative(id),
        )
        .await?
        .ok_or(EngineError::NotFound(id))
    }

    pub async fn list_narratives(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Narrative>, EngineError> {
        Ok(bounded(
            "list_narratives",
            self.config.store_timeout,
            self.narratives.list_narratives(limit, offset),
        )
        .await?)
    }

    /// Every active narrative, newest first, read from the store page by page.
    pub async fn active_narratives(&self) -> Result<Vec<Narrative>, EngineError> {
        let mut active = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.list_narratives(NARRATIVE_PAGE, offset).await?;
            if page.is_empty() {
                break;
            }
            offset += page.len();
            active.extend(page.into_iter().filter(Narrative::is_active));
        }
        Ok(active)
    }

    pub async fn export(&self, id: Uuid, format: ExportFormat) -> Result<Vec<u8>, EngineError> {
        let narrative = self.narrative(id).await?;
        Ok(report::format(&narrative, format))
    }

    pub async fn insights(&self, id: Uuid) -> Result<Insights, EngineError> {
        let narrative = self.narrative(id).await?;
        Ok(breach::insights(&narrative.evidence.to_json()))
    }
}
