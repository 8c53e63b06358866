use crate::{IndexError, IndexRecord, IndexWriter, RecordStream};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::RwLock;

/// In-process index. Each record is replaced as a whole under the write lock,
/// so readers see either the old or the new record for an id, never a mix.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    records: RwLock<HashMap<String, IndexRecord>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<IndexRecord> {
        self.records.read().ok()?.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn matches(&self, query: &str) -> Result<Vec<IndexRecord>, IndexError> {
        let needle = query.trim().to_lowercase();
        let records = self
            .records
            .read()
            .map_err(|_| IndexError::Unavailable("memory index lock poisoned".into()))?;
        let mut hits: Vec<(f32, IndexRecord)> = records
            .values()
            .filter_map(|record| {
                let best = record
                    .labels
                    .iter()
                    .filter(|l| needle.is_empty() || l.text.to_lowercase().contains(&needle))
                    .map(|l| l.score)
                    .fold(None, |acc: Option<f32>, s| Some(acc.map_or(s, |a| a.max(s))))?;
                Some((best, record.clone()))
            })
            .collect();
        hits.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));
        Ok(hits.into_iter().map(|(_, r)| r).collect())
    }
}

#[async_trait::async_trait]
impl IndexWriter for MemoryIndex {
    async fn upsert(&self, record: &IndexRecord) -> Result<(), IndexError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| IndexError::Unavailable("memory index lock poisoned".into()))?;
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn search(&self, query: &str) -> RecordStream {
        match self.matches(query) {
            Ok(hits) => stream::iter(hits.into_iter().map(Ok)).boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ColorFact, Label};
    use chrono::Utc;
    use futures::TryStreamExt;

    fn record(id: &str, labels: &[(&str, f32)]) -> IndexRecord {
        IndexRecord {
            id: id.to_string(),
            labels: labels.iter().map(|(t, s)| Label::new(*t, *s)).collect(),
            dominant_color: Some(ColorFact {
                rgb: (1, 2, 3),
                weight: 1.0,
            }),
            source_path: format!("/media/{id}.jpg"),
            submitted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_twice_keeps_one_entry() {
        let index = MemoryIndex::new();
        let r = record("a", &[("cat", 0.9)]);
        index.upsert(&r).await.unwrap();
        index.upsert(&r).await.unwrap();
        assert_eq!(index.len(), 1);
        let hits: Vec<_> = index.search("cat").try_collect().await.unwrap();
        assert_eq!(hits, vec![r]);
    }

    #[tokio::test]
    async fn upsert_replaces_without_merging() {
        let index = MemoryIndex::new();
        index.upsert(&record("a", &[("cat", 0.9)])).await.unwrap();
        let r2 = record("a", &[("dog", 0.4)]);
        index.upsert(&r2).await.unwrap();
        assert_eq!(index.get("a"), Some(r2));
        let cats: Vec<_> = index.search("cat").try_collect().await.unwrap();
        assert!(cats.is_empty());
    }

    #[tokio::test]
    async fn search_orders_by_best_matching_label() {
        let index = MemoryIndex::new();
        index.upsert(&record("low", &[("Panda", 0.3)])).await.unwrap();
        index
            .upsert(&record("high", &[("red panda", 0.8), ("tree", 0.99)]))
            .await
            .unwrap();
        index.upsert(&record("other", &[("tree", 0.7)])).await.unwrap();
        let ids: Vec<String> = index
            .search("panda")
            .map_ok(|r| r.id)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(ids, vec!["high", "low"]);
    }
}
