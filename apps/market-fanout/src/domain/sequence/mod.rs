//! Sequence Tracking
//!
//! Per-symbol duplicate and staleness filter.
//!
//! # Design
//!
//! For every symbol the tracker keeps the highest accepted sequence and a
//! bounded window of recently accepted sequences. An update is accepted iff
//! its sequence is above `last_accepted` and not already in the window.
//! The window is a ring (`VecDeque`) paired with a `HashSet` for O(1)
//! membership, evicting oldest-first once it holds `W` entries, so memory
//! stays bounded no matter how long the feed runs.
//!
//! The tracker is owned by the single ingestor task and needs no locking.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use super::streaming::MarketUpdate;

/// Default recent-window capacity per symbol.
pub const DEFAULT_WINDOW_CAPACITY: usize = 1024;

/// Dedup state for a single symbol.
#[derive(Debug)]
struct SymbolWindow {
    last_accepted: u64,
    recent: VecDeque<u64>,
    recent_set: HashSet<u64>,
}

impl SymbolWindow {
    fn new(first: u64, capacity: usize) -> Self {
        let mut window = Self {
            last_accepted: first,
            recent: VecDeque::with_capacity(capacity),
            recent_set: HashSet::with_capacity(capacity),
        };
        window.remember(first, capacity);
        window
    }

    fn accept(&mut self, sequence: u64, capacity: usize) -> bool {
        if sequence <= self.last_accepted || self.recent_set.contains(&sequence) {
            return false;
        }

        self.last_accepted = sequence;
        self.remember(sequence, capacity);
        true
    }

    fn remember(&mut self, sequence: u64, capacity: usize) {
        if self.recent.len() >= capacity
            && let Some(evicted) = self.recent.pop_front()
        {
            self.recent_set.remove(&evicted);
        }

        self.recent.push_back(sequence);
        self.recent_set.insert(sequence);
    }
}

/// Tracks accepted sequences per symbol.
///
/// # Example
///
/// ```rust
/// use market_fanout::domain::sequence::SequenceTracker;
///
/// let mut tracker = SequenceTracker::new(16);
/// let accepted: Vec<u64> = [1, 2, 2, 3, 5, 4]
///     .into_iter()
///     .filter(|seq| tracker.accept("X", *seq))
///     .collect();
/// assert_eq!(accepted, vec![1, 2, 3, 5]);
/// ```
#[derive(Debug)]
pub struct SequenceTracker {
    capacity: usize,
    symbols: HashMap<Arc<str>, SymbolWindow>,
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}

impl SequenceTracker {
    /// Create a tracker with the given per-symbol window capacity.
    ///
    /// A capacity of zero is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            symbols: HashMap::new(),
        }
    }

    /// Decide whether `(symbol, sequence)` is new, recording it if so.
    pub fn accept(&mut self, symbol: &str, sequence: u64) -> bool {
        if let Some(window) = self.symbols.get_mut(symbol) {
            return window.accept(sequence, self.capacity);
        }

        self.symbols
            .insert(Arc::from(symbol), SymbolWindow::new(sequence, self.capacity));
        true
    }

    /// Same as [`accept`](Self::accept), reusing the update's symbol handle.
    pub fn accept_update(&mut self, update: &MarketUpdate) -> bool {
        if let Some(window) = self.symbols.get_mut(update.symbol()) {
            return window.accept(update.sequence(), self.capacity);
        }

        self.symbols.insert(
            Arc::clone(update.symbol_arc()),
            SymbolWindow::new(update.sequence(), self.capacity),
        );
        true
    }

    /// Highest accepted sequence for a symbol.
    #[must_use]
    pub fn last_accepted(&self, symbol: &str) -> Option<u64> {
        self.symbols.get(symbol).map(|w| w.last_accepted)
    }

    /// Number of sequences currently remembered for a symbol.
    #[must_use]
    pub fn window_len(&self, symbol: &str) -> usize {
        self.symbols.get(symbol).map_or(0, |w| w.recent.len())
    }

    /// Number of symbols seen.
    #[must_use]
    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    /// Window capacity per symbol.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Forget all state.
    pub fn reset(&mut self) {
        self.symbols.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================
