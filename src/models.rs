use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Metric family a signal belongs to.
///
/// The eight built-in kinds are produced by the upstream metrics job; any
/// other name read from the store becomes `Custom` and is only matchable when
/// registered in the [`SignalCatalog`](crate::condition::SignalCatalog).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SignalKind {
    PipelineVelocityDelta,
    LateInvoiceRisk,
    StalledDealMotif,
    SupportChurnFlag,
    MarketHeadwind,
    RevenueTrend,
    CustomerSatisfaction,
    OperationalEfficiency,
    Custom(String),
}

impl SignalKind {
    pub const BUILT_IN: [SignalKind; 8] = [
        SignalKind::PipelineVelocityDelta,
        SignalKind::LateInvoiceRisk,
        SignalKind::StalledDealMotif,
        SignalKind::SupportChurnFlag,
        SignalKind::MarketHeadwind,
        SignalKind::RevenueTrend,
        SignalKind::CustomerSatisfaction,
        SignalKind::OperationalEfficiency,
    ];

    pub fn from_name(name: &str) -> Self {
        match name {
            "pipeline_velocity_delta" => SignalKind::PipelineVelocityDelta,
            "late_invoice_risk" => SignalKind::LateInvoiceRisk,
            "stalled_deal_motif" => SignalKind::StalledDealMotif,
            "support_churn_flag" => SignalKind::SupportChurnFlag,
            "market_headwind" => SignalKind::MarketHeadwind,
            "revenue_trend" => SignalKind::RevenueTrend,
            "customer_satisfaction" => SignalKind::CustomerSatisfaction,
            "operational_efficiency" => SignalKind::OperationalEfficiency,
            other => SignalKind::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SignalKind::PipelineVelocityDelta => "pipeline_velocity_delta",
            SignalKind::LateInvoiceRisk => "late_invoice_risk",
            SignalKind::StalledDealMotif => "stalled_deal_motif",
            SignalKind::SupportChurnFlag => "support_churn_flag",
            SignalKind::MarketHeadwind => "market_headwind",
            SignalKind::RevenueTrend => "revenue_trend",
            SignalKind::CustomerSatisfaction => "customer_satisfaction",
            SignalKind::OperationalEfficiency => "operational_efficiency",
            SignalKind::Custom(name) => name,
        }
    }

    pub fn is_built_in(&self) -> bool {
        !matches!(self, SignalKind::Custom(_))
    }

    /// "late_invoice_risk" -> "Late Invoice Risk"
    pub fn display_name(&self) -> String {
        self.as_str()
            .split('_')
            .filter(|word| !word.is_empty())
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl From<String> for SignalKind {
    fn from(value: String) -> Self {
        SignalKind::from_name(&value)
    }
}

impl From<SignalKind> for String {
    fn from(value: SignalKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed time window `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Period {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Period {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant <= self.end
    }

    /// Smallest period covering every signal, `None` for an empty slice.
    pub fn spanning<'a>(signals: impl IntoIterator<Item = &'a Signal>) -> Option<Period> {
        signals.into_iter().fold(None, |acc: Option<Period>, signal| {
            let period = signal.period();
            Some(match acc {
                Some(current) => Period {
                    start: current.start.min(period.start),
                    end: current.end.max(period.end),
                },
                None => period,
            })
        })
    }
}

/// A computed, time-boxed metric. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub kind: SignalKind,
    pub score: f64,
    pub threshold: f64,
    pub payload: Map<String, Value>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

impl Signal {
    pub fn period(&self) -> Period {
        Period::new(self.period_start, self.period_end)
    }

    pub fn is_breaching(&self) -> bool {
        self.score > self.threshold
    }

    /// Resolves a dotted path into the payload. Numeric segments index arrays.
    pub fn payload_field(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.payload.get(first)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Like [`payload_field`](Self::payload_field) but also answers `score`
    /// and `threshold` from the signal itself.
    pub fn field(&self, path: &str) -> Option<Value> {
        match path {
            "score" => Some(Value::from(self.score)),
            "threshold" => Some(Value::from(self.threshold)),
            _ => self.payload_field(path).cloned(),
        }
    }

    pub fn payload_number(&self, path: &str) -> Option<f64> {
        self.payload_field(path).and_then(Value::as_f64)
    }

    pub fn snapshot(&self) -> SignalSnapshot {
        SignalSnapshot {
            id: self.id,
            kind: self.kind.clone(),
            score: self.score,
            threshold: self.threshold,
            payload: self.payload.clone(),
            period_start: self.period_start,
            period_end: self.period_end,
        }
    }
}

/// Evidence copy of a signal as it was when a narrative was generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSnapshot {
    pub id: Uuid,
    pub kind: SignalKind,
    pub score: f64,
    pub threshold: f64,
    pub payload: Map<String, Value>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-authored playbook. `definition` is the JSON text as stored; the
/// rule engine decodes it per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub name: String,
    pub priority: i32,
    pub category: String,
    pub enabled: bool,
    pub definition: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NarrativeStatus {
    Active,
    Archived,
}

impl NarrativeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NarrativeStatus::Active => "active",
            NarrativeStatus::Archived => "archived",
        }
    }

    /// Anything other than `active` is treated as no longer live.
    pub fn from_db(value: &str) -> Self {
        if value == "active" {
            NarrativeStatus::Active
        } else {
            NarrativeStatus::Archived
        }
    }
}

/// A serialized column decoded at the store boundary. Undecodable text is
/// kept verbatim so it can still be shown.
#[derive(Debug, Clone, PartialEq)]
pub enum Stored<T> {
    Decoded(T),
    Raw(String),
}

impl<T: DeserializeOwned> Stored<T> {
    pub fn decode(raw: &str) -> Self {
        match serde_json::from_str(raw) {
            Ok(value) => Stored::Decoded(value),
            Err(_) => Stored::Raw(raw.to_string()),
        }
    }
}

impl<T: Serialize> Stored<T> {
    pub fn encode(&self) -> String {
        match self {
            Stored::Decoded(value) => serde_json::to_string(value).unwrap_or_default(),
            Stored::Raw(raw) => raw.clone(),
        }
    }

    /// Decoded values as structured JSON, raw text as a JSON string.
    pub fn to_json(&self) -> Value {
        match self {
            Stored::Decoded(value) => match serde_json::to_value(value) {
                Ok(json) => json,
                Err(_) => Value::String(self.encode()),
            },
            Stored::Raw(raw) => Value::String(raw.clone()),
        }
    }
}

/// Who generated a narrative from which signals over which period.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub author: String,
    pub signal_ids: BTreeSet<Uuid>,
    pub period: Period,
}

impl DedupKey {
    pub fn new(author: impl Into<String>, signal_ids: BTreeSet<Uuid>, period: Period) -> Self {
        Self {
            author: author.into(),
            signal_ids,
            period,
        }
    }

    /// Narratives sharing a lock key may collide, so their check-then-insert
    /// must be serialized.
    pub fn lock_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.author,
            self.period.start.to_rfc3339(),
            self.period.end.to_rfc3339()
        )
    }

    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.lock_key().as_bytes());
        for id in &self.signal_ids {
            hasher.update(b"|");
            hasher.update(id.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn collides_with(&self, other: &DedupKey) -> bool {
        self.author == other.author
            && self.period == other.period
            && !self.signal_ids.is_disjoint(&other.signal_ids)
    }
}

/// A narrative ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewNarrative {
    pub title: String,
    pub summary: String,
    pub actions: Vec<String>,
    pub evidence: Value,
    pub author: String,
    pub generated_at: DateTime<Utc>,
    pub dedup: DedupKey,
}

/// A narrative as held by the narrative store.
#[derive(Debug, Clone, PartialEq)]
pub struct Narrative {
    pub id: Uuid,
    pub title: String,
    pub summary: String,
    pub actions: Stored<Vec<String>>,
    pub evidence: Stored<Value>,
    pub status: NarrativeStatus,
    pub generated_at: DateTime<Utc>,
    pub author: String,
    pub dedup: DedupKey,
}

impl Narrative {
    pub fn from_new(id: Uuid, new: NewNarrative) -> Self {
        Self {
            id,
            title: new.title,
            summary: new.summary,
            actions: Stored::Decoded(new.actions),
            evidence: Stored::Decoded(new.evidence),
            status: NarrativeStatus::Active,
            generated_at: new.generated_at,
            author: new.author,
            dedup: new.dedup,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == NarrativeStatus::Active
    }
}

pub const AUTO_AUTHOR: &str = "auto";

pub const RULE_CATEGORIES: [&str; 6] = [
    "sales",
    "finance",
    "support",
    "operations",
    "marketing",
    "general",
];
