//! Long-term memory: a bounded, importance-ranked list of consolidated records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::emotion::parse_integer;

pub const DEFAULT_MEMORY_CAPACITY: usize = 50;
pub const MIN_IMPORTANCE: u8 = 1;
pub const MAX_IMPORTANCE: u8 = 10;
pub const MAX_TAGS: usize = 3;
pub const MAX_TAG_CHARS: usize = 32;
pub const SUMMARY_RENDER_CHARS: usize = 120;
pub const EMPTY_MEMORY_TEXT: &str = "No significant memories yet.";

/// A distilled memory produced by one successful consolidation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub summary: String,
    #[serde(deserialize_with = "deserialize_importance")]
    pub importance: u8,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl MemoryRecord {
    /// Build a record with normalized tags. Importance is taken as given;
    /// callers holding untrusted values go through [`clamp_importance`].
    pub fn new(summary: impl Into<String>, importance: u8, tags: Vec<String>) -> Self {
        Self {
            summary: summary.into().trim().to_string(),
            importance,
            tags: normalize_tags(tags),
            created_at: Utc::now(),
        }
    }

    /// One prompt line: `[Imp 7 | family, travel] summary...`
    pub fn render_line(&self) -> String {
        format!(
            "[Imp {} | {}] {}",
            self.importance,
            self.tags.join(", "),
            truncate_chars(&self.summary, SUMMARY_RENDER_CHARS)
        )
    }

    fn repaired(mut self) -> Self {
        self.tags = normalize_tags(std::mem::take(&mut self.tags));
        self
    }

    /// Persisted records may predate importance clamping.
    fn restored(self) -> Self {
        let mut record = self.repaired();
        record.importance = clamp_importance(record.importance as i64);
        record
    }
}

pub fn clamp_importance(importance: i64) -> u8 {
    importance.clamp(MIN_IMPORTANCE as i64, MAX_IMPORTANCE as i64) as u8
}

/// Older blobs carry the model's raw score: strings, floats, out-of-range.
fn deserialize_importance<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    parse_integer(&raw)
        .map(clamp_importance)
        .ok_or_else(|| serde::de::Error::custom(format!("importance is not numeric: {}", raw)))
}

/// Trim, drop empties, dedupe case-insensitively, cap length and count.
pub fn normalize_tags<I>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let tag = truncate_chars(tag.trim(), MAX_TAG_CHARS).trim().to_string();
        let folded = tag.to_lowercase();
        if tag.is_empty() || out.iter().any(|known| known.to_lowercase() == folded) {
            continue;
        }
        out.push(tag);
        if out.len() == MAX_TAGS {
            break;
        }
    }
    out
}

fn truncate_chars(input: &str, max_chars: usize) -> String {
    input.chars().take(max_chars).collect()
}

/// Records kept sorted by importance, highest first. Equal importance keeps
/// insertion order, so older memories win ties at the eviction boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct LongTermMemoryStore {
    records: Vec<MemoryRecord>,
    capacity: usize,
}

impl LongTermMemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    /// Build from persisted records, re-establishing bounds, order and capacity.
    pub fn from_records(records: Vec<MemoryRecord>, capacity: usize) -> Self {
        let mut store = Self::new(capacity);
        store.records = records.into_iter().map(MemoryRecord::restored).collect();
        store.rerank();
        store
    }

    /// Insert, re-rank, and return whatever fell off the end.
    pub fn insert(&mut self, record: MemoryRecord) -> Vec<MemoryRecord> {
        self.records.push(record.repaired());
        self.rerank()
    }

    fn rerank(&mut self) -> Vec<MemoryRecord> {
        // sort_by is stable
        self.records.sort_by(|a, b| b.importance.cmp(&a.importance));
        if self.records.len() > self.capacity {
            self.records.split_off(self.capacity)
        } else {
            Vec::new()
        }
    }

    pub fn render(&self) -> String {
        if self.records.is_empty() {
            return EMPTY_MEMORY_TEXT.to_string();
        }
        self.records
            .iter()
            .map(MemoryRecord::render_line)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn records(&self) -> &[MemoryRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for LongTermMemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(summary: &str, importance: u8) -> MemoryRecord {
        MemoryRecord::new(summary, importance, vec!["tag".to_string()])
    }

    fn is_ranked(store: &LongTermMemoryStore) -> bool {
        store
            .records()
            .windows(2)
            .all(|pair| pair[0].importance >= pair[1].importance)
    }

    #[test]
    fn empty_store_renders_sentinel() {
        let store = LongTermMemoryStore::default();
        assert_eq!(store.render(), "No significant memories yet.");
    }

    #[test]
    fn overflow_evicts_lowest_importance() {
        let mut store = LongTermMemoryStore::default();
        let mut evicted = Vec::new();
        // 20 is coprime with 51, so this visits 1..=51 in scrambled order
        for step in 0..51u32 {
            let importance = ((step * 20) % 51 + 1) as u8;
            evicted.extend(store.insert(record(&format!("m{}", importance), importance)));
        }

        assert_eq!(store.len(), 50);
        assert!(is_ranked(&store));
        assert_eq!(store.records()[0].importance, 51);
        assert_eq!(store.records()[49].importance, 2);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].summary, "m1");
    }

    #[test]
    fn ties_preserve_insertion_order() {
        let mut store = LongTermMemoryStore::new(3);
        store.insert(record("first", 5));
        store.insert(record("second", 5));
        store.insert(record("third", 5));
        let evicted = store.insert(record("fourth", 5));

        let summaries: Vec<_> = store.records().iter().map(|r| r.summary.as_str()).collect();
        assert_eq!(summaries, vec!["first", "second", "third"]);
        assert_eq!(evicted[0].summary, "fourth");

        store.insert(record("urgent", 9));
        let summaries: Vec<_> = store.records().iter().map(|r| r.summary.as_str()).collect();
        assert_eq!(summaries, vec!["urgent", "first", "second"]);
    }

    #[test]
    fn render_truncates_summary_and_joins_tags() {
        let long = "x".repeat(200);
        let mut store = LongTermMemoryStore::default();
        store.insert(MemoryRecord::new(
            long,
            7,
            vec!["family".to_string(), "travel".to_string()],
        ));
        store.insert(MemoryRecord::new("Likes tea", 3, Vec::new()));

        let rendered = store.render();
        let lines: Vec<_> = rendered.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], format!("[Imp 7 | family, travel] {}", "x".repeat(120)));
        assert_eq!(lines[1], "[Imp 3 | ] Likes tea");
    }

    #[test]
    fn render_truncates_on_char_boundaries() {
        let summary = "é".repeat(130);
        let line = MemoryRecord::new(summary, 4, Vec::new()).render_line();
        assert!(line.ends_with(&"é".repeat(120)));
    }

    #[test]
    fn summary_and_tags_are_normalized() {
        let record = MemoryRecord::new(
            "  spoke about work  ",
            clamp_importance(42),
            vec![
                " work ".to_string(),
                "WORK".to_string(),
                "".to_string(),
                "stress".to_string(),
                "deadlines".to_string(),
                "overflow".to_string(),
            ],
        );
        assert_eq!(record.summary, "spoke about work");
        assert_eq!(record.importance, 10);
        assert_eq!(record.tags, vec!["work", "stress", "deadlines"]);
        assert_eq!(clamp_importance(-3), 1);
        assert_eq!(clamp_importance(0), 1);
        assert_eq!(clamp_importance(6), 6);
    }

    #[test]
    fn from_records_reranks_and_truncates() {
        let mut records = Vec::new();
        for importance in [2, 9, 4, 9, 1] {
            records.push(record(&format!("m{}", importance), importance));
        }
        records[0].tags = vec!["a".to_string(), "A".to_string(), " ".to_string()];
        let store = LongTermMemoryStore::from_records(records, 4);

        assert_eq!(store.len(), 4);
        assert!(is_ranked(&store));
        let summaries: Vec<_> = store.records().iter().map(|r| r.summary.as_str()).collect();
        assert_eq!(summaries, vec!["m9", "m9", "m4", "m2"]);
        assert_eq!(store.records()[3].tags, vec!["a"]);
    }

    #[test]
    fn tags_dedupe_beyond_ascii() {
        let tags = normalize_tags(vec!["Été".to_string(), "été".to_string(), "ÉTÉ".to_string()]);
        assert_eq!(tags, vec!["Été"]);
    }

    #[test]
    fn from_records_clamps_importance() {
        let mut high = record("raw score", 1);
        high.importance = 15;
        let mut zero = record("zero", 1);
        zero.importance = 0;
        let store = LongTermMemoryStore::from_records(vec![zero, high], 50);

        let importances: Vec<u8> = store.records().iter().map(|r| r.importance).collect();
        assert_eq!(importances, vec![10, 1]);
    }

    #[test]
    fn importance_decodes_leniently() {
        let json = r#"[
            {"summary": "a", "importance": "8"},
            {"summary": "b", "importance": 6.6},
            {"summary": "c", "importance": -2}
        ]"#;
        let records: Vec<MemoryRecord> = serde_json::from_str(json).unwrap();
        let importances: Vec<u8> = records.iter().map(|r| r.importance).collect();
        assert_eq!(importances, vec![8, 7, 1]);
        assert!(serde_json::from_str::<MemoryRecord>(r#"{"summary": "d", "importance": "lots"}"#).is_err());
    }

    #[test]
    fn legacy_records_without_timestamp_deserialize() {
        let json = r#"[{"summary": "met the cat", "importance": 6, "tags": ["pets"]}]"#;
        let records: Vec<MemoryRecord> = serde_json::from_str(json).unwrap();
        assert_eq!(records[0].summary, "met the cat");
        assert_eq!(records[0].tags, vec!["pets"]);
    }
}
