//! Turns raw annotator output into the canonical record written to the index.
//!
//! Normalization is total: out-of-range or NaN numbers are clamped, never
//! rejected, so a record can always be produced for an annotation.

use crate::models::MediaItem;
use providers::{AnnotationResult, ColorFact, IndexRecord, Label, RawColor};
use std::collections::HashMap;

pub fn normalize(item: &MediaItem, annotation: &AnnotationResult) -> IndexRecord {
    IndexRecord {
        id: item.id.clone(),
        labels: dedup_labels(&annotation.labels),
        dominant_color: dominant_color(&annotation.dominant_colors),
        source_path: item.source_path.clone(),
        submitted_at: item.submitted_at,
    }
}

/// Rebuilds an annotation that normalizes back to `record`.
pub fn annotation_from_record(record: &IndexRecord) -> AnnotationResult {
    AnnotationResult {
        labels: record.labels.clone(),
        dominant_colors: record
            .dominant_color
            .iter()
            .map(|c| {
                RawColor::new(
                    (f32::from(c.rgb.0), f32::from(c.rgb.1), f32::from(c.rgb.2)),
                    c.weight,
                )
            })
            .collect(),
    }
}

fn dedup_labels(labels: &[Label]) -> Vec<Label> {
    let mut best: HashMap<&str, f32> = HashMap::with_capacity(labels.len());
    for label in labels {
        let score = clamp_unit(label.score);
        best.entry(label.text.as_str())
            .and_modify(|s| *s = s.max(score))
            .or_insert(score);
    }
    let mut out: Vec<Label> = best
        .into_iter()
        .map(|(text, score)| Label::new(text, score))
        .collect();
    out.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.text.cmp(&b.text)));
    out
}

fn dominant_color(colors: &[RawColor]) -> Option<ColorFact> {
    let mut best: Option<ColorFact> = None;
    for color in colors {
        let fact = ColorFact {
            rgb: (
                clamp_channel(color.rgb.0),
                clamp_channel(color.rgb.1),
                clamp_channel(color.rgb.2),
            ),
            weight: clamp_unit(color.weight),
        };
        // Strictly greater: the first of equal weights wins.
        if best.map_or(true, |b| fact.weight > b.weight) {
            best = Some(fact);
        }
    }
    best
}

/// Maps into `[0, 1]`. NaN becomes `0.0` and `-0.0` becomes `+0.0`, so
/// `total_cmp` sees all zero scores as equal.
fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0) + 0.0
    }
}

fn clamp_channel(v: f32) -> u8 {
    if v.is_nan() {
        0
    } else {
        v.round().clamp(0.0, 255.0) as u8
    }
}
