use chrono::DateTime;
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

use super::Source;
use crate::errors::SourceError;
use crate::normalize::parse_timestamp_text;
use crate::record::Record;
use crate::window::Window;

const EXTENSIONS: [&str; 3] = ["jsonl", "ndjson", "json"];

/// Replays previously captured items from newline-delimited JSON.
///
/// `path` is a single file or a directory whose `.jsonl`, `.ndjson` and
/// `.json` files are read in name order. Lines that are not JSON objects are
/// skipped.
#[derive(Debug, Clone, Default)]
pub struct JsonLinesSource {
    records: Vec<Record>,
}

impl JsonLinesSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await.map_err(SourceError::Unreadable)?;

        let files = if metadata.is_dir() {
            let mut files = Vec::new();
            let mut entries = tokio::fs::read_dir(path).await.map_err(SourceError::Unreadable)?;
            while let Some(entry) = entries.next_entry().await.map_err(SourceError::Unreadable)? {
                let file = entry.path();
                let known = file
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| EXTENSIONS.contains(&e));
                if known {
                    files.push(file);
                }
            }
            files.sort();
            files
        } else {
            vec![path.to_path_buf()]
        };

        let mut records = Vec::new();
        for file in &files {
            records.extend(read_file(file).await?);
        }
        info!(
            "Loaded {} records from {} files under {}",
            records.len(),
            files.len(),
            path.display()
        );
        Ok(Self { records })
    }

    pub fn from_records(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

async fn read_file(path: &Path) -> Result<Vec<Record>, SourceError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(SourceError::Unreadable)?;

    let mut records = Vec::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match Record::from_json_str(line) {
            Ok(record) => records.push(record),
            Err(e) => warn!("Skipping line {} of {}: {}", number + 1, path.display(), e),
        }
    }
    Ok(records)
}

fn created_at_ms(record: &Record) -> Option<i64> {
    match record.get("created_at")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => parse_timestamp_text(s),
        _ => None,
    }
}

fn matches_query(record: &Record, query: &str) -> bool {
    let query = query.trim();
    if query.is_empty() {
        return true;
    }
    let needle = query.to_lowercase();
    ["full_text", "text"].iter().any(|field| {
        record
            .get(field)
            .and_then(Value::as_str)
            .is_some_and(|text| text.to_lowercase().contains(&needle))
    })
}

fn screen_name(record: &Record) -> Option<String> {
    let user = match record.get("user")? {
        Value::String(raw) => serde_json::from_str::<Value>(raw).ok()?,
        other => other.clone(),
    };
    user.get("screen_name")
        .and_then(Value::as_str)
        .map(str::to_string)
}

impl Source for JsonLinesSource {
    async fn fetch_window(&self, query: &str, window: &Window) -> Result<Vec<Record>, SourceError> {
        Ok(self
            .records
            .iter()
            .filter(|r| {
                created_at_ms(r)
                    .and_then(DateTime::from_timestamp_millis)
                    .is_some_and(|created| window.contains(created))
            })
            .filter(|r| matches_query(r, query))
            .cloned()
            .collect())
    }

    async fn fetch_ids(&self, ids: &[i64]) -> Result<Vec<Record>, SourceError> {
        let wanted: HashSet<i64> = ids.iter().copied().collect();
        Ok(self
            .records
            .iter()
            .filter(|r| r.id().is_some_and(|id| wanted.contains(&id)))
            .cloned()
            .collect())
    }

    async fn fetch_timeline(&self, user: &str) -> Result<Vec<Record>, SourceError> {
        Ok(self
            .records
            .iter()
            .filter(|r| screen_name(r).is_some_and(|name| name.eq_ignore_ascii_case(user)))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    const FIRST: &str = r#"{"id": 1, "full_text": "Masks work", "created_at": "Wed Jan 01 00:05:00 +0000 2020", "user": {"screen_name": "alice"}}
not json at all
{"id": 2, "full_text": "unrelated", "created_at": "2020-01-01T00:15:00Z", "user": {"screen_name": "bob"}}
"#;
    const SECOND: &str = r#"{"id": 3, "full_text": "more masks", "created_at": 1577837100000, "user": "{\"screen_name\": \"Alice\"}"}
"#;

    async fn fixture() -> (TempDir, JsonLinesSource) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.jsonl"), FIRST).unwrap();
        std::fs::write(dir.path().join("b.jsonl"), SECOND).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let source = JsonLinesSource::open(dir.path()).await.unwrap();
        (dir, source)
    }

    fn ids(records: &[Record]) -> Vec<i64> {
        records.iter().filter_map(Record::id).collect()
    }

    #[tokio::test]
    async fn test_open_skips_malformed_lines_and_other_files() {
        let (_dir, source) = fixture().await;
        assert_eq!(source.len(), 3);
    }

    #[tokio::test]
    async fn test_fetch_window_filters_time_and_query() {
        let (_dir, source) = fixture().await;
        let window = Window::new(
            Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2020, 1, 1, 0, 10, 0).unwrap(),
        )
        .unwrap();

        let all = source.fetch_window("", &window).await.unwrap();
        assert_eq!(ids(&all), vec![1, 3]);
        let masks = source.fetch_window("MASKS", &window).await.unwrap();
        assert_eq!(ids(&masks), vec![1, 3]);
        let none = source.fetch_window("unrelated", &window).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_ids_and_timeline() {
        let (_dir, source) = fixture().await;
        assert_eq!(ids(&source.fetch_ids(&[2, 3, 99]).await.unwrap()), vec![2, 3]);
        assert_eq!(ids(&source.fetch_timeline("alice").await.unwrap()), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_missing_path_is_unreadable() {
        let err = JsonLinesSource::open("/no/such/replay").await.unwrap_err();
        assert!(matches!(err, SourceError::Unreadable(_)));
    }
}
