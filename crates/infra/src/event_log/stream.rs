use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, BoxStream, StreamExt};

use keel_events::{AggregateEventTag, Offset};

use super::r#trait::{EventLog, EventLogError, StoredEvent};

/// Live stream of one tag's events.
pub type TagStream = BoxStream<'static, Result<StoredEvent, EventLogError>>;

struct Cursor {
    log: Arc<dyn EventLog>,
    tag: AggregateEventTag,
    after: Offset,
    buffer: VecDeque<StoredEvent>,
    poll_interval: Duration,
    page_size: usize,
    failed: bool,
}

/// Stream the events of `tag` strictly after `from`, forever.
///
/// Reads pages of `page_size` and, once caught up, polls every
/// `poll_interval`. The first read error is yielded and ends the stream; the
/// caller restarts from its last committed offset.
pub fn event_stream(
    log: Arc<dyn EventLog>,
    tag: AggregateEventTag,
    from: Offset,
    poll_interval: Duration,
    page_size: usize,
) -> TagStream {
    let cursor = Cursor {
        log,
        tag,
        after: from,
        buffer: VecDeque::new(),
        poll_interval,
        page_size: page_size.max(1),
        failed: false,
    };

    stream::unfold(cursor, |mut cursor| async move {
        loop {
            if cursor.failed {
                return None;
            }
            if let Some(event) = cursor.buffer.pop_front() {
                cursor.after = event.offset;
                return Some((Ok(event), cursor));
            }
            match cursor
                .log
                .events_by_tag(&cursor.tag, cursor.after, cursor.page_size)
                .await
            {
                Ok(page) if page.is_empty() => tokio::time::sleep(cursor.poll_interval).await,
                Ok(page) => cursor.buffer.extend(page),
                Err(err) => {
                    cursor.failed = true;
                    return Some((Err(err), cursor));
                }
            }
        }
    })
    .boxed()
}
