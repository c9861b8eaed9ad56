pub mod jsonl;

use crate::errors::SourceError;
use crate::record::Record;
use crate::window::Window;

pub use jsonl::JsonLinesSource;

/// A rate-limited upstream that returns raw post-like items.
///
/// Transport, credentials and pagination are the implementation's business;
/// a failed call surfaces as [`SourceError`] and the caller skips the unit of
/// work.
pub trait Source {
    /// Items matching `query` created inside `window`.
    fn fetch_window(
        &self,
        query: &str,
        window: &Window,
    ) -> impl Future<Output = Result<Vec<Record>, SourceError>> + Send;

    /// Full items for the given ids; unknown ids are silently absent.
    fn fetch_ids(&self, ids: &[i64]) -> impl Future<Output = Result<Vec<Record>, SourceError>> + Send;

    /// Recent items posted by `user`.
    fn fetch_timeline(&self, user: &str) -> impl Future<Output = Result<Vec<Record>, SourceError>> + Send;
}
