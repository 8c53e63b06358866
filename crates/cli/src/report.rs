use providers::IndexRecord;
use serde::Serialize;
use snapdex_core::JobState;

/// Terminal outcome of one ingested file.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub id: String,
    pub path: String,
    #[serde(flatten)]
    pub state: JobState,
}

/// A file whose content hash matched a job already submitted in the same run.
#[derive(Debug, Clone, Serialize)]
pub struct Duplicate {
    pub id: String,
    pub path: String,
}

#[derive(Debug, Default, Serialize)]
pub struct IngestSummary {
    pub discovered: usize,
    pub committed: usize,
    pub failed: usize,
    pub items: Vec<IngestOutcome>,
    pub duplicates: Vec<Duplicate>,
}

impl IngestSummary {
    pub fn skip_duplicate(&mut self, id: String, path: String) {
        self.duplicates.push(Duplicate { id, path });
    }

    pub fn push(&mut self, outcome: IngestOutcome) {
        match outcome.state {
            JobState::Committed => self.committed += 1,
            _ => self.failed += 1,
        }
        self.items.push(outcome);
    }
}

pub fn outcome_line(outcome: &IngestOutcome) -> String {
    format!("{}  {}  {}", outcome.id, outcome.path, outcome.state)
}

pub fn summary_line(summary: &IngestSummary) -> String {
    format!(
        "ingest: discovered {}, committed {}, failed {}, duplicates {}",
        summary.discovered,
        summary.committed,
        summary.failed,
        summary.duplicates.len()
    )
}

pub fn status_json(id: &str, state: &JobState) -> serde_json::Value {
    let mut value = serde_json::json!({ "id": id });
    if let (Some(obj), Ok(serde_json::Value::Object(fields))) =
        (value.as_object_mut(), serde_json::to_value(state))
    {
        obj.extend(fields);
    }
    value
}

pub fn hit_line(record: &IndexRecord) -> String {
    let labels: Vec<String> = record
        .labels
        .iter()
        .map(|l| format!("{}:{:.2}", l.text, l.score))
        .collect();
    let color = record
        .dominant_color
        .map(|c| format!("#{:02x}{:02x}{:02x}", c.rgb.0, c.rgb.1, c.rgb.2))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{}  {}  {}  [{}]",
        record.id,
        record.source_path,
        color,
        labels.join(", ")
    )
}
