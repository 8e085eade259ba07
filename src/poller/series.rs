use super::{OperatingState, PollEntry, SharedHandler};

#[derive(Debug, Clone)]
struct SeriesEntry {
    entry: PollEntry,
    last_served: Option<u64>,
    failures: u32,
}

/// A named, ordered list of [PollEntry]s, scanned round-robin by the poller.
///
/// A series can be limited to a number of full passes, after which the poller removes it,
/// and can have its own [super::PollReplyHandler].
pub struct PollSeries {
    name: String,
    entries: Vec<SeriesEntry>,
    cursor: usize,
    served_since_wrap: bool,
    repeat: Option<u32>,
    passes: u32,
    handler: Option<SharedHandler>,
}

impl std::fmt::Debug for PollSeries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollSeries")
            .field("name", &self.name)
            .field("entries", &self.entries.len())
            .field("cursor", &self.cursor)
            .field("repeat", &self.repeat)
            .field("passes", &self.passes)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl PollSeries {
    /// Creates a new series, polled until removed
    pub fn new(name: &str, entries: Vec<PollEntry>) -> Self {
        Self {
            name: name.to_string(),
            entries: entries
                .into_iter()
                .map(|entry| SeriesEntry {
                    entry,
                    last_served: None,
                    failures: 0,
                })
                .collect(),
            cursor: 0,
            served_since_wrap: false,
            repeat: None,
            passes: 0,
            handler: None,
        }
    }

    /// Removes the series after `passes` full passes over its entries
    pub fn with_repeat(mut self, passes: u32) -> Self {
        self.repeat = Some(passes);
        self
    }

    /// Sends the results of this series to `handler` instead of the bus handler
    pub fn with_handler(mut self, handler: SharedHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Name of the series
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entries of the series
    pub fn entries(&self) -> impl Iterator<Item = &PollEntry> {
        self.entries.iter().map(|e| &e.entry)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the series has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of consecutive failures of an entry
    pub fn failures(&self, idx: usize) -> Option<u32> {
        self.entries.get(idx).map(|e| e.failures)
    }

    /// Number of completed passes
    pub fn passes(&self) -> u32 {
        self.passes
    }

    pub(crate) fn entry(&self, idx: usize) -> Option<&PollEntry> {
        self.entries.get(idx).map(|e| &e.entry)
    }

    pub(crate) fn handler(&self) -> Option<&SharedHandler> {
        self.handler.as_ref()
    }

    pub(crate) fn reset_cursor(&mut self) {
        self.cursor = 0;
        self.served_since_wrap = false;
    }

    /// Returns true once the series has done all of its passes
    pub(crate) fn is_exhausted(&self) -> bool {
        self.repeat.is_some_and(|n| self.passes >= n)
    }

    fn wrap(&mut self) {
        if self.served_since_wrap {
            self.passes += 1;
            self.served_since_wrap = false;
        }
    }

    /// Finds the next due entry, starting at the cursor.
    /// Passing the end of the list counts as a pass if something was served since the last one
    pub(crate) fn next_due(&mut self, state: OperatingState, ticker: u64) -> Option<usize> {
        let len = self.entries.len();
        for step in 0..len {
            let idx = (self.cursor + step) % len;
            if step > 0 && idx == 0 {
                self.wrap();
            }
            let e = &self.entries[idx];
            let period = e.entry.period(state) as u64;
            let due = period != 0
                && e
                    .last_served
                    .is_none_or(|last| ticker.saturating_sub(last) >= period);
            if due {
                self.cursor = idx;
                return Some(idx);
            }
        }
        None
    }

    /// Records the result of polling an entry, and moves the cursor past it
    pub(crate) fn complete(&mut self, idx: usize, success: bool, ticker: u64) {
        let Some(e) = self.entries.get_mut(idx) else {
            return;
        };
        e.last_served = Some(ticker);
        if success {
            e.failures = 0;
        } else {
            e.failures += 1;
        }
        self.served_since_wrap = true;
        self.cursor = idx + 1;
        if self.cursor >= self.entries.len() {
            self.cursor = 0;
            self.wrap();
        }
    }
}
