use std::time::Duration;

use futures_util::stream::{self, Stream, StreamExt};
use tokio::time::Instant;

pub const DEFAULT_MAX_BATCH_ITEMS: usize = 100;
pub const DEFAULT_MAX_BATCH_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub max_items: usize,
    pub max_wait: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_MAX_BATCH_ITEMS,
            max_wait: DEFAULT_MAX_BATCH_WAIT,
        }
    }
}

/// A batch flushes at `max_items` or `max_wait` after its first item, whichever
/// comes first. A source error ends the stream and drops the buffered items.
pub fn batched<S, T, E>(source: S, settings: BatchSettings) -> impl Stream<Item = Result<Vec<T>, E>>
where
    S: Stream<Item = Result<T, E>> + Unpin,
{
    let max_items = settings.max_items.max(1);
    let max_wait = settings.max_wait;
    stream::unfold(Some(source), move |state| async move {
        let mut source = state?;
        let mut batch = Vec::with_capacity(max_items);

        match source.next().await {
            None => return None,
            Some(Err(err)) => return Some((Err(err), None)),
            Some(Ok(item)) => batch.push(item),
        }

        let deadline = Instant::now() + max_wait;
        while batch.len() < max_items {
            match tokio::time::timeout_at(deadline, source.next()).await {
                Err(_) => break,
                Ok(None) => return Some((Ok(batch), None)),
                Ok(Some(Err(err))) => return Some((Err(err), None)),
                Ok(Some(Ok(item))) => batch.push(item),
            }
        }
        Some((Ok(batch), Some(source)))
    })
}
