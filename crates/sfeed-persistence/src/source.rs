//! ---
//! sfeed_section: "03-persistence-sources"
//! sfeed_subsection: "module"
//! sfeed_type: "source"
//! sfeed_scope: "code"
//! sfeed_description: "Event sources and append-only stream storage."
//! sfeed_version: "v0.1.0"
//! sfeed_owner: "tbd"
//! ---
use std::collections::VecDeque;

use sfeed_messaging::Event;

use crate::SourceError;

/// Lazy, finite, timestamp-ordered sequence of events.
///
/// Implementations hold at most one record of look-ahead.
pub trait EventSource: Send {
    /// Whether another event is available.
    fn has_next(&self) -> bool;

    /// Next event, or `None` once the source is exhausted.
    fn next_event(&mut self) -> Result<Option<Event>, SourceError>;

    /// Skip forward to the first event at or after `timestamp_ms`.
    ///
    /// Never moves backwards.
    fn seek(&mut self, timestamp_ms: i64) -> Result<(), SourceError>;
}

impl<S: EventSource + ?Sized> EventSource for Box<S> {
    fn has_next(&self) -> bool {
        (**self).has_next()
    }

    fn next_event(&mut self) -> Result<Option<Event>, SourceError> {
        (**self).next_event()
    }

    fn seek(&mut self, timestamp_ms: i64) -> Result<(), SourceError> {
        (**self).seek(timestamp_ms)
    }
}

/// In-memory source over a fixed set of events.
#[derive(Debug, Default, Clone)]
pub struct VecEventSource {
    events: VecDeque<Event>,
}

impl VecEventSource {
    /// Build a source; events are stably sorted by logical timestamp.
    pub fn new(events: impl IntoIterator<Item = Event>) -> Self {
        let mut events: Vec<_> = events.into_iter().collect();
        events.sort_by_key(Event::logical_timestamp);
        Self {
            events: events.into(),
        }
    }

    /// Events left to read.
    pub fn remaining(&self) -> usize {
        self.events.len()
    }
}

impl EventSource for VecEventSource {
    fn has_next(&self) -> bool {
        !self.events.is_empty()
    }

    fn next_event(&mut self) -> Result<Option<Event>, SourceError> {
        Ok(self.events.pop_front())
    }

    fn seek(&mut self, timestamp_ms: i64) -> Result<(), SourceError> {
        while self
            .events
            .front()
            .is_some_and(|event| event.logical_timestamp() < timestamp_ms)
        {
            self.events.pop_front();
        }
        Ok(())
    }
}
