use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    DedupKey, Narrative, NarrativeStatus, NewNarrative, Period, Rule, Signal, SignalKind, Stored,
};
use crate::sample;
use crate::store::{CreateOutcome, NarrativeStore, RuleStore, SignalFilter, SignalStore};

const SIGNAL_COLUMNS: &str = "id, kind, score, threshold, payload, period_start, period_end";
const NARRATIVE_COLUMNS: &str = "id, title, summary, actions, evidence, status, author, \
     generated_at, period_start, period_end, evidence_signal_ids";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

async fn insert_signal(pool: &PgPool, signal: &Signal) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO narrative_engine.signals
        (id, kind, score, threshold, payload, period_start, period_end)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (kind, period_start, period_end) DO NOTHING
        "#,
    )
    .bind(signal.id)
    .bind(signal.kind.as_str())
    .bind(signal.score)
    .bind(signal.threshold)
    .bind(Value::Object(signal.payload.clone()).to_string())
    .bind(signal.period_start)
    .bind(signal.period_end)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    for signal in sample::signals()? {
        insert_signal(pool, &signal)
            .await
            .with_context(|| format!("failed to seed {} signal", signal.kind))?;
    }

    for rule in sample::rules()? {
        sqlx::query(
            r#"
            INSERT INTO narrative_engine.rules
            (id, name, priority, category, enabled, definition, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, priority = EXCLUDED.priority,
                category = EXCLUDED.category, definition = EXCLUDED.definition
            "#,
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(rule.priority)
        .bind(&rule.category)
        .bind(rule.enabled)
        .bind(&rule.definition)
        .bind(rule.created_at)
        .execute(pool)
        .await
        .with_context(|| format!("failed to seed rule {}", rule.name))?;
    }

    Ok(())
}

/// One line of a metrics job export.
#[derive(Debug, serde::Deserialize)]
struct CsvRow {
    kind: String,
    score: f64,
    threshold: f64,
    payload: Option<String>,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
}

fn signal_from_csv(row: CsvRow) -> Result<Signal, String> {
    if !(0.0..=1.0).contains(&row.score) {
        return Err(format!("score {} outside [0, 1]", row.score));
    }
    if !(0.0..=1.0).contains(&row.threshold) {
        return Err(format!("threshold {} outside [0, 1]", row.threshold));
    }
    if row.period_start > row.period_end {
        return Err("period_start is after period_end".to_string());
    }
    if row.kind.trim().is_empty() {
        return Err("kind is empty".to_string());
    }

    let payload = match row.payload.as_deref().map(str::trim) {
        None | Some("") => Map::new(),
        Some(raw) => serde_json::from_str::<Map<String, Value>>(raw)
            .map_err(|err| format!("payload is not a JSON object: {err}"))?,
    };

    Ok(Signal {
        id: Uuid::new_v4(),
        kind: SignalKind::from_name(row.kind.trim()),
        score: row.score,
        threshold: row.threshold,
        payload,
        period_start: row.period_start,
        period_end: row.period_end,
    })
}

pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut inserted = 0usize;

    for (index, result) in reader.deserialize::<CsvRow>().enumerate() {
        let line = index + 2;
        let parsed = result.map_err(|err| err.to_string());
        let signal = match parsed.and_then(signal_from_csv) {
            Ok(signal) => signal,
            Err(reason) => {
                warn!(line, %reason, "skipping signal row");
                continue;
            }
        };

        if insert_signal(pool, &signal).await? {
            inserted += 1;
        }
    }

    Ok(inserted)
}

fn signal_from_row(row: &PgRow) -> Signal {
    let id: Uuid = row.get("id");
    let raw: String = row.get("payload");
    let payload = match serde_json::from_str::<Map<String, Value>>(&raw) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(%id, error = %err, "signal payload is not a JSON object, using an empty payload");
            Map::new()
        }
    };

    Signal {
        id,
        kind: SignalKind::from_name(row.get::<String, _>("kind").as_str()),
        score: row.get("score"),
        threshold: row.get("threshold"),
        payload,
        period_start: row.get("period_start"),
        period_end: row.get("period_end"),
    }
}

fn narrative_from_row(row: &PgRow) -> Narrative {
    let id: Uuid = row.get("id");
    let actions = Stored::decode(row.get::<String, _>("actions").as_str());
    let evidence = Stored::decode(row.get::<String, _>("evidence").as_str());
    if matches!(actions, Stored::Raw(_)) || matches!(evidence, Stored::Raw(_)) {
        warn!(%id, "narrative has undecodable actions or evidence, keeping raw text");
    }

    let author: String = row.get("author");
    let signal_ids: Vec<Uuid> = row.get("evidence_signal_ids");
    let period = Period::new(row.get("period_start"), row.get("period_end"));

    Narrative {
        id,
        title: row.get("title"),
        summary: row.get("summary"),
        actions,
        evidence,
        status: NarrativeStatus::from_db(row.get::<String, _>("status").as_str()),
        generated_at: row.get("generated_at"),
        dedup: DedupKey::new(author.clone(), signal_ids.into_iter().collect(), period),
        author,
    }
}

/// Signal, rule and narrative stores backed by PostgreSQL.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SignalStore for PgStore {
    async fn list_signals(&self, filter: &SignalFilter) -> Result<Vec<Signal>, StoreError> {
        let mut query = format!("SELECT {SIGNAL_COLUMNS} FROM narrative_engine.signals WHERE TRUE");
        let mut param = 0;

        if filter.kind.is_some() {
            param += 1;
            query.push_str(&format!(" AND kind = ${param}"));
        }
        if filter.ends_within.is_some() {
            query.push_str(&format!(
                " AND period_end >= ${} AND period_end <= ${}",
                param + 1,
                param + 2
            ));
        }
        query.push_str(" ORDER BY period_start, kind, id");

        let mut rows = sqlx::query(&query);
        if let Some(kind) = &filter.kind {
            rows = rows.bind(kind.as_str().to_string());
        }
        if let Some(window) = filter.ends_within {
            rows = rows.bind(window.start).bind(window.end);
        }

        let records = rows.fetch_all(&self.pool).await?;
        Ok(records.iter().map(signal_from_row).collect())
    }
}

#[async_trait]
impl RuleStore for PgStore {
    async fn list_enabled_rules(&self) -> Result<Vec<Rule>, StoreError> {
        let records = sqlx::query(
            r#"
            SELECT id, name, priority, category, enabled, definition, created_at
            FROM narrative_engine.rules
            WHERE enabled
            ORDER BY priority, created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut rules = Vec::new();
        for row in records {
            rules.push(Rule {
                id: row.get("id"),
                name: row.get("name"),
                priority: row.get("priority"),
                category: row.get("category"),
                enabled: row.get("enabled"),
                definition: row.get("definition"),
                created_at: row.get("created_at"),
            });
        }

        Ok(rules)
    }
}

#[async_trait]
impl NarrativeStore for PgStore {
    async fn find_active_narrative(
        &self,
        key: &DedupKey,
    ) -> Result<Option<Narrative>, StoreError> {
        let ids: Vec<Uuid> = key.signal_ids.iter().copied().collect();
        let row = sqlx::query(&format!(
            "SELECT {NARRATIVE_COLUMNS} FROM narrative_engine.narratives \
             WHERE status = 'active' AND author = $1 AND period_start = $2 AND period_end = $3 \
             AND evidence_signal_ids && $4::uuid[] \
             ORDER BY generated_at LIMIT 1"
        ))
        .bind(&key.author)
        .bind(key.period.start)
        .bind(key.period.end)
        .bind(ids)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(narrative_from_row))
    }

    async fn create_narrative(&self, narrative: NewNarrative) -> Result<CreateOutcome, StoreError> {
        let key = &narrative.dedup;
        let ids: Vec<Uuid> = key.signal_ids.iter().copied().collect();
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key.lock_key())
            .execute(&mut *tx)
            .await?;

        let existing = sqlx::query(
            r#"
            SELECT id FROM narrative_engine.narratives
            WHERE status = 'active' AND author = $1 AND period_start = $2 AND period_end = $3
              AND evidence_signal_ids && $4::uuid[]
            LIMIT 1
            "#,
        )
        .bind(&key.author)
        .bind(key.period.start)
        .bind(key.period.end)
        .bind(&ids)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            tx.rollback().await?;
            return Ok(CreateOutcome::Duplicate(row.get("id")));
        }

        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO narrative_engine.narratives
            (id, title, summary, actions, evidence, status, author, generated_at,
             period_start, period_end, evidence_signal_ids, dedup_fingerprint)
            VALUES ($1, $2, $3, $4, $5, 'active', $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(id)
        .bind(&narrative.title)
        .bind(&narrative.summary)
        .bind(json!(narrative.actions).to_string())
        .bind(narrative.evidence.to_string())
        .bind(&narrative.author)
        .bind(narrative.generated_at)
        .bind(key.period.start)
        .bind(key.period.end)
        .bind(&ids)
        .bind(key.fingerprint())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(CreateOutcome::Created(id))
    }

    async fn get_narrative(&self, id: Uuid) -> Result<Option<Narrative>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {NARRATIVE_COLUMNS} FROM narrative_engine.narratives WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(narrative_from_row))
    }

    async fn list_narratives(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Narrative>, StoreError> {
        let records = sqlx::query(&format!(
            "SELECT {NARRATIVE_COLUMNS} FROM narrative_engine.narratives \
             ORDER BY generated_at DESC, id DESC LIMIT $1 OFFSET $2"
        ))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(records.iter().map(narrative_from_row).collect())
    }
}
