//! Converts flushed post tables into idempotent graph upserts.
//!
//! Every row becomes a set of parameter maps grouped by statement kind. Each
//! kind has one fixed Cypher text that UNWINDs a `$rows` list and MERGEs on
//! natural ids, so replaying a batch leaves the graph unchanged.

pub mod memory;
pub mod neo4j;

use arrow::array::{Array, BooleanArray, Int64Array, StringArray, TimestampMillisecondArray};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use crate::errors::GraphError;
use crate::hydration::HydrationStatus;

pub use memory::MemoryGraphStore;
pub use neo4j::Neo4jGraphStore;

/// A statement parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Int(i64),
    Text(String),
    Bool(bool),
    Null,
}

impl From<Option<i64>> for Param {
    fn from(value: Option<i64>) -> Self {
        value.map_or(Param::Null, Param::Int)
    }
}

impl From<Option<String>> for Param {
    fn from(value: Option<String>) -> Self {
        value.map_or(Param::Null, Param::Text)
    }
}

impl From<Option<bool>> for Param {
    fn from(value: Option<bool>) -> Self {
        value.map_or(Param::Null, Param::Bool)
    }
}

pub type ParamRow = BTreeMap<&'static str, Param>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatementKind {
    MergePosts,
    MergeAuthors,
    MergeReplies,
    MergeQuotes,
    MergeReposts,
    MergeMentions,
    MergeUrls,
}

impl StatementKind {
    /// Execution order within one batch: posts first so relationship
    /// statements can MATCH them.
    pub const ALL: [StatementKind; 7] = [
        StatementKind::MergePosts,
        StatementKind::MergeAuthors,
        StatementKind::MergeReplies,
        StatementKind::MergeQuotes,
        StatementKind::MergeReposts,
        StatementKind::MergeMentions,
        StatementKind::MergeUrls,
    ];

    pub fn text(self) -> &'static str {
        match self {
            StatementKind::MergePosts => MERGE_POSTS,
            StatementKind::MergeAuthors => MERGE_AUTHORS,
            StatementKind::MergeReplies => MERGE_REPLIES,
            StatementKind::MergeQuotes => MERGE_QUOTES,
            StatementKind::MergeReposts => MERGE_REPOSTS,
            StatementKind::MergeMentions => MERGE_MENTIONS,
            StatementKind::MergeUrls => MERGE_URLS,
        }
    }

    /// Relationship type created by this statement.
    pub fn relationship(self) -> Option<&'static str> {
        match self {
            StatementKind::MergePosts => None,
            StatementKind::MergeAuthors => Some("AUTHORED"),
            StatementKind::MergeReplies => Some("REPLIED"),
            StatementKind::MergeQuotes => Some("QUOTED"),
            StatementKind::MergeReposts => Some("REPOSTED"),
            StatementKind::MergeMentions => Some("MENTIONS"),
            StatementKind::MergeUrls => Some("INCLUDES_URL"),
        }
    }
}

const MERGE_POSTS: &str = "UNWIND $rows AS row
MERGE (p:Post {id: row.id})
SET p.text = row.text,
    p.created_at = row.created_at,
    p.lang = row.lang,
    p.favorite_count = row.favorite_count,
    p.repost_count = row.repost_count,
    p.possibly_sensitive = row.possibly_sensitive,
    p.kind = row.kind,
    p.hydrated = 'FULL'";

const MERGE_AUTHORS: &str = "UNWIND $rows AS row
MATCH (p:Post {id: row.post_id})
MERGE (a:Account {id: row.account_id})
SET a.screen_name = row.screen_name,
    a.name = row.name,
    a.followers_count = row.followers_count,
    a.verified = row.verified
MERGE (a)-[:AUTHORED]->(p)";

const MERGE_REPLIES: &str = "UNWIND $rows AS row
MATCH (p:Post {id: row.post_id})
MERGE (t:Post {id: row.target_id})
ON CREATE SET t.hydrated = 'PARTIAL'
MERGE (p)-[:REPLIED]->(t)";

const MERGE_QUOTES: &str = "UNWIND $rows AS row
MATCH (p:Post {id: row.post_id})
MERGE (t:Post {id: row.target_id})
ON CREATE SET t.hydrated = 'PARTIAL'
MERGE (p)-[:QUOTED]->(t)";

const MERGE_REPOSTS: &str = "UNWIND $rows AS row
MATCH (p:Post {id: row.post_id})
MERGE (t:Post {id: row.target_id})
ON CREATE SET t.hydrated = 'PARTIAL'
MERGE (p)-[:REPOSTED]->(t)";

const MERGE_MENTIONS: &str = "UNWIND $rows AS row
MATCH (p:Post {id: row.post_id})
MERGE (a:Account {id: row.account_id})
ON CREATE SET a.screen_name = row.screen_name
MERGE (p)-[:MENTIONS]->(a)";

const MERGE_URLS: &str = "UNWIND $rows AS row
MATCH (p:Post {id: row.post_id})
MERGE (u:Url {full_url: row.full_url})
ON CREATE SET u.scheme = row.scheme,
    u.host = row.host,
    u.port = row.port,
    u.path = row.path,
    u.query = row.query,
    u.fragment = row.fragment
MERGE (p)-[:INCLUDES_URL]->(u)";

pub const HYDRATION_STATUS: &str = "UNWIND $ids AS id
MATCH (p:Post {id: id})
RETURN p.id AS id, coalesce(p.hydrated, 'PARTIAL') AS hydrated";

/// One chunk of rows bound to a fixed statement.
#[derive(Debug, Clone, Copy)]
pub struct Statement<'a> {
    pub kind: StatementKind,
    pub rows: &'a [ParamRow],
}

impl Statement<'_> {
    pub fn text(&self) -> &'static str {
        self.kind.text()
    }
}

/// A store that executes batch-merge statements and answers hydration
/// status lookups.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Runs one statement in its own transaction.
    async fn run(&self, statement: Statement<'_>) -> Result<(), GraphError>;

    async fn hydration_status(&self, ids: &[i64]) -> Result<HashMap<i64, HydrationStatus>, GraphError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PostKind {
    Original,
    Reply,
    Quote,
    Repost,
}

impl PostKind {
    /// A reply wins over a quote, a quote over a repost.
    pub fn detect(reply_to: Option<i64>, quoted: Option<i64>, reposted: Option<i64>) -> Self {
        if reply_to.is_some() {
            PostKind::Reply
        } else if quoted.is_some() {
            PostKind::Quote
        } else if reposted.is_some() {
            PostKind::Repost
        } else {
            PostKind::Original
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PostKind::Original => "ORIGINAL",
            PostKind::Reply => "REPLY",
            PostKind::Quote => "QUOTE",
            PostKind::Repost => "REPOST",
        }
    }
}

/// Parameter rows for every statement kind, extracted from one table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphRows {
    rows: BTreeMap<StatementKind, Vec<ParamRow>>,
    /// Table rows without a usable post id.
    pub skipped: usize,
}

impl GraphRows {
    pub fn from_batch(batch: &RecordBatch) -> Self {
        let columns = Columns::new(batch);
        let mut out = GraphRows::default();

        for i in 0..batch.num_rows() {
            let Some(post_id) = columns.int("id", i).filter(|id| *id > 0) else {
                out.skipped += 1;
                continue;
            };

            let reply_to = columns.int("in_reply_to_status_id", i).filter(|id| *id > 0);
            let quoted = columns.int("quoted_status_id", i).filter(|id| *id > 0);
            let reposted = columns.json("retweeted_status", i).as_ref().and_then(object_id);
            let kind = PostKind::detect(reply_to, quoted, reposted);

            out.push(
                StatementKind::MergePosts,
                BTreeMap::from([
                    ("id", Param::Int(post_id)),
                    ("text", columns.text("full_text", i).into()),
                    ("created_at", columns.timestamp("created_at", i).into()),
                    ("lang", columns.text("lang", i).into()),
                    ("favorite_count", columns.int("favorite_count", i).into()),
                    ("repost_count", columns.int("retweet_count", i).into()),
                    ("possibly_sensitive", columns.flag("possibly_sensitive", i).into()),
                    ("kind", Param::Text(kind.as_str().to_string())),
                ]),
            );

            if let Some(user) = columns.json("user", i) {
                if let Some(account_id) = object_id(&user) {
                    out.push(
                        StatementKind::MergeAuthors,
                        BTreeMap::from([
                            ("post_id", Param::Int(post_id)),
                            ("account_id", Param::Int(account_id)),
                            ("screen_name", text_field(&user, "screen_name").into()),
                            ("name", text_field(&user, "name").into()),
                            ("followers_count", user.get("followers_count").and_then(Value::as_i64).into()),
                            ("verified", user.get("verified").and_then(Value::as_bool).into()),
                        ]),
                    );
                }
            }

            for (kind, target) in [
                (StatementKind::MergeReplies, reply_to),
                (StatementKind::MergeQuotes, quoted),
                (StatementKind::MergeReposts, reposted),
            ] {
                if let Some(target_id) = target {
                    out.push(
                        kind,
                        BTreeMap::from([
                            ("post_id", Param::Int(post_id)),
                            ("target_id", Param::Int(target_id)),
                        ]),
                    );
                }
            }

            if let Some(entities) = columns.json("entities", i) {
                out.push_entities(post_id, &entities);
            }
        }

        out
    }

    fn push_entities(&mut self, post_id: i64, entities: &Value) {
        let list = |key: &str| {
            entities
                .get(key)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        };

        for mention in list("user_mentions") {
            if let Some(account_id) = object_id(&mention) {
                self.push(
                    StatementKind::MergeMentions,
                    BTreeMap::from([
                        ("post_id", Param::Int(post_id)),
                        ("account_id", Param::Int(account_id)),
                        ("screen_name", text_field(&mention, "screen_name").into()),
                    ]),
                );
            }
        }

        for link in list("urls") {
            let Some(full_url) = text_field(&link, "expanded_url").or_else(|| text_field(&link, "url")) else {
                continue;
            };
            match url::Url::parse(&full_url) {
                Ok(parsed) => self.push(
                    StatementKind::MergeUrls,
                    BTreeMap::from([
                        ("post_id", Param::Int(post_id)),
                        ("scheme", Param::Text(parsed.scheme().to_string())),
                        ("host", parsed.host_str().map(str::to_string).into()),
                        ("port", parsed.port().map(i64::from).into()),
                        ("path", Param::Text(parsed.path().to_string())),
                        ("query", parsed.query().map(str::to_string).into()),
                        ("fragment", parsed.fragment().map(str::to_string).into()),
                        ("full_url", Param::Text(full_url)),
                    ]),
                ),
                Err(e) => debug!("Skipping unparseable url '{}': {}", full_url, e),
            }
        }
    }

    fn push(&mut self, kind: StatementKind, row: ParamRow) {
        self.rows.entry(kind).or_default().push(row);
    }

    pub fn rows(&self, kind: StatementKind) -> &[ParamRow] {
        self.rows.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn post_ids(&self) -> Vec<i64> {
        self.rows(StatementKind::MergePosts)
            .iter()
            .filter_map(|row| match row.get("id") {
                Some(Param::Int(id)) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.values().all(Vec::is_empty)
    }

    /// Total relationship rows across all kinds.
    pub fn relationship_count(&self) -> usize {
        StatementKind::ALL
            .iter()
            .filter(|k| k.relationship().is_some())
            .map(|k| self.rows(*k).len())
            .sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphWriteSummary {
    pub posts: usize,
    pub relationships: usize,
    pub statements: usize,
    pub skipped: usize,
}

/// Writes tables to a graph store as chunked bulk statements.
pub struct GraphBatchWriter {
    store: Arc<dyn GraphStore>,
    chunk_size: usize,
}

impl GraphBatchWriter {
    pub fn new(store: Arc<dyn GraphStore>, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    pub async fn write(&self, batch: &RecordBatch) -> Result<GraphWriteSummary, GraphError> {
        let rows = GraphRows::from_batch(batch);
        let mut summary = GraphWriteSummary {
            posts: rows.rows(StatementKind::MergePosts).len(),
            relationships: rows.relationship_count(),
            statements: 0,
            skipped: rows.skipped,
        };

        for kind in StatementKind::ALL {
            for chunk in rows.rows(kind).chunks(self.chunk_size) {
                self.store.run(Statement { kind, rows: chunk }).await?;
                summary.statements += 1;
            }
        }

        info!(
            "Merged {} posts and {} relationships in {} statements ({} rows without id)",
            summary.posts, summary.relationships, summary.statements, summary.skipped
        );
        Ok(summary)
    }
}

/// Typed, by-name access to the columns a table happens to have.
struct Columns<'a> {
    batch: &'a RecordBatch,
}

impl<'a> Columns<'a> {
    fn new(batch: &'a RecordBatch) -> Self {
        Self { batch }
    }

    fn column<T: 'static>(&self, name: &str) -> Option<&'a T> {
        self.batch
            .column_by_name(name)
            .and_then(|c| c.as_any().downcast_ref::<T>())
    }

    fn int(&self, name: &str, row: usize) -> Option<i64> {
        self.column::<Int64Array>(name)
            .filter(|c| c.is_valid(row))
            .map(|c| c.value(row))
    }

    fn timestamp(&self, name: &str, row: usize) -> Option<i64> {
        self.column::<TimestampMillisecondArray>(name)
            .filter(|c| c.is_valid(row))
            .map(|c| c.value(row))
    }

    fn flag(&self, name: &str, row: usize) -> Option<bool> {
        self.column::<BooleanArray>(name)
            .filter(|c| c.is_valid(row))
            .map(|c| c.value(row))
    }

    fn text(&self, name: &str, row: usize) -> Option<String> {
        self.column::<StringArray>(name)
            .filter(|c| c.is_valid(row))
            .map(|c| c.value(row).to_string())
    }

    /// A JSON text cell parsed back into a value; null and non-JSON cells are
    /// treated as absent.
    fn json(&self, name: &str, row: usize) -> Option<Value> {
        self.column::<StringArray>(name)
            .filter(|c| c.is_valid(row))
            .and_then(|c| serde_json::from_str::<Value>(c.value(row)).ok())
            .filter(|v| !v.is_null())
    }
}

/// The positive `id` (or `id_str`) of a JSON object.
fn object_id(value: &Value) -> Option<i64> {
    let id = match value.get("id") {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
    .or_else(|| value.get("id_str").and_then(Value::as_str).and_then(|s| s.parse().ok()));
    id.filter(|id| *id > 0)
}

fn text_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}
