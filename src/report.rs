use std::fmt::Write;
use std::str::FromStr;

use serde_json::{json, Value};

use crate::error::EngineError;
use crate::models::{Narrative, Stored};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Markdown,
    Json,
}

impl ExportFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Markdown => "text/markdown; charset=utf-8",
            ExportFormat::Json => "application/json",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "markdown" | "md" => Ok(ExportFormat::Markdown),
            "json" => Ok(ExportFormat::Json),
            other => Err(EngineError::UnsupportedFormat(other.to_string())),
        }
    }
}

pub fn format(narrative: &Narrative, format: ExportFormat) -> Vec<u8> {
    match format {
        ExportFormat::Markdown => build_markdown(narrative).into_bytes(),
        ExportFormat::Json => build_json(narrative).into_bytes(),
    }
}

/// The full record with actions and evidence decoded; undecodable columns
/// are emitted as the raw stored string.
pub fn narrative_json(narrative: &Narrative) -> Value {
    json!({
        "id": narrative.id,
        "title": narrative.title,
        "summary": narrative.summary,
        "actions": narrative.actions.to_json(),
        "evidence": narrative.evidence.to_json(),
        "status": narrative.status.as_str(),
        "generated_at": narrative.generated_at,
        "author": narrative.author,
        "period_start": narrative.dedup.period.start,
        "period_end": narrative.dedup.period.end,
        "evidence_signal_ids": narrative.dedup.signal_ids,
    })
}

fn pretty(value: &Value) -> String {
    match serde_json::to_string_pretty(value) {
        Ok(text) => text,
        Err(_) => value.to_string(),
    }
}

fn build_json(narrative: &Narrative) -> String {
    pretty(&narrative_json(narrative))
}

fn build_markdown(narrative: &Narrative) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# {}", narrative.title);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Summary");
    let _ = writeln!(output, "{}", narrative.summary);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Actions");

    match &narrative.actions {
        Stored::Decoded(actions) if actions.is_empty() => {
            let _ = writeln!(output, "No actions recommended.");
        }
        Stored::Decoded(actions) => {
            for action in actions {
                let _ = writeln!(output, "- {action}");
            }
        }
        Stored::Raw(raw) => {
            let _ = writeln!(output, "{raw}");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Evidence");
    let evidence = match &narrative.evidence {
        Stored::Decoded(value) => pretty(value),
        Stored::Raw(raw) => raw.clone(),
    };
    let _ = writeln!(output, "```json");
    let _ = writeln!(output, "{evidence}");
    let _ = writeln!(output, "```");

    let _ = writeln!(output);
    let _ = writeln!(output, "---");
    let _ = writeln!(
        output,
        "*Generated on {} | Author: {} | Status: {}*",
        narrative.generated_at.format("%Y-%m-%d %H:%M UTC"),
        narrative.author,
        narrative.status.as_str()
    );

    output
}

/// Markdown digest of active narratives, newest first.
pub fn build_digest(narratives: &[Narrative]) -> String {
    let mut active: Vec<&Narrative> = narratives.iter().filter(|n| n.is_active()).collect();
    active.sort_by(|a, b| b.generated_at.cmp(&a.generated_at));

    let mut output = String::new();
    let _ = writeln!(output, "# Narrative Digest");
    let _ = writeln!(output, "{} active narratives", active.len());
    let _ = writeln!(output);

    if active.is_empty() {
        let _ = writeln!(output, "No active narratives.");
        return output;
    }

    for narrative in active {
        let _ = writeln!(output, "## {}", narrative.title);
        let _ = writeln!(
            output,
            "_{} on {}_",
            narrative.author,
            narrative.generated_at.format("%Y-%m-%d %H:%M UTC")
        );
        let _ = writeln!(output);
        let _ = writeln!(output, "{}", narrative.summary);
        let _ = writeln!(output);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DedupKey, NarrativeStatus, NewNarrative, Period};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn narrative(title: &str, day: u32) -> Narrative {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let signal_id = Uuid::new_v4();
        let evidence = json!({
            "source": "rule",
            "matching_signals": [{"id": signal_id, "score": 0.82}]
        });
        let signal_ids = BTreeSet::from([signal_id]);
        Narrative::from_new(
            Uuid::new_v4(),
            NewNarrative {
                title: title.into(),
                summary: "High risk of late payments detected".into(),
                actions: vec!["Review payment terms".into(), "Contact customers".into()],
                evidence,
                author: "Late Invoice Alert".into(),
                generated_at: Utc.with_ymd_and_hms(2026, 4, day, 9, 30, 0).unwrap(),
                dedup: DedupKey::new("Late Invoice Alert", signal_ids, Period::new(start, start)),
            },
        )
    }

    #[test]
    fn parses_format_names() {
        assert_eq!("markdown".parse::<ExportFormat>().unwrap(), ExportFormat::Markdown);
        assert_eq!("JSON".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert!(matches!(
            "pdf".parse::<ExportFormat>(),
            Err(EngineError::UnsupportedFormat(f)) if f == "pdf"
        ));
    }

    #[test]
    fn markdown_sections_come_in_order() {
        let bytes = format(&narrative("Late Invoice Alert", 2), ExportFormat::Markdown);
        let text = String::from_utf8(bytes).unwrap();
        let sections = [
            "# Late Invoice Alert",
            "## Summary",
            "## Actions",
            "## Evidence",
            "```json",
            "Author: Late Invoice Alert",
        ];
        let positions: Vec<usize> = sections
            .iter()
            .map(|needle| text.find(needle).unwrap_or_else(|| panic!("missing {needle}")))
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(text.contains("- Review payment terms\n- Contact customers\n"));
        assert!(text.contains("Generated on 2026-04-02 09:30 UTC"));
    }

    #[test]
    fn json_export_round_trips_actions_and_evidence() {
        let original = narrative("Late Invoice Alert", 2);
        let bytes = format(&original, ExportFormat::Json);
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(parsed["actions"], json!(["Review payment terms", "Contact customers"]));
        let Stored::Decoded(evidence) = &original.evidence else { unreachable!() };
        assert_eq!(&parsed["evidence"], evidence);
        assert_eq!(parsed["status"], json!("active"));
        assert_eq!(parsed["id"], json!(original.id));
    }

    #[test]
    fn malformed_stored_columns_fall_back_to_raw_text() {
        let mut broken = narrative("Broken", 2);
        broken.actions = Stored::decode("[\"Review payment terms\"");
        broken.evidence = Stored::decode("{not json");

        let markdown = String::from_utf8(format(&broken, ExportFormat::Markdown)).unwrap();
        assert!(markdown.contains("[\"Review payment terms\""));
        assert!(markdown.contains("```json\n{not json\n```"));

        let parsed: Value = serde_json::from_slice(&format(&broken, ExportFormat::Json)).unwrap();
        assert_eq!(parsed["evidence"], json!("{not json"));
        assert_eq!(parsed["actions"], json!("[\"Review payment terms\""));
    }

    #[test]
    fn digest_lists_only_active_narratives_newest_first() {
        let older = narrative("Older", 1);
        let newer = narrative("Newer", 5);
        let mut archived = narrative("Archived", 9);
        archived.status = NarrativeStatus::Archived;

        let digest = build_digest(&[older, archived, newer]);
        assert!(digest.contains("2 active narratives"));
        assert!(!digest.contains("Archived"));
        assert!(digest.find("## Newer").unwrap() < digest.find("## Older").unwrap());

        assert!(build_digest(&[]).contains("No active narratives."));
    }
}
