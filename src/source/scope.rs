use std::sync::Arc;

use dashmap::DashMap;

use super::event::{bounded_name, RawEvent};
use crate::export::health::PipelineMetrics;

/// Names interned before new ones are handed out uncached.
const MAX_INTERNED: usize = 16_384;

/// Deduplicates event names into shared strings.
pub struct NameInterner {
    names: DashMap<String, Arc<str>>,
}

impl NameInterner {
    pub fn new() -> Self {
        Self {
            names: DashMap::new(),
        }
    }

    /// Returns the shared string for `name`, allocating only on first sight.
    pub fn intern(&self, name: &str) -> Arc<str> {
        if let Some(existing) = self.names.get(name) {
            return Arc::clone(existing.value());
        }

        let shared = bounded_name(Arc::from(name));
        if self.names.len() >= MAX_INTERNED {
            return shared;
        }

        Arc::clone(
            self.names
                .entry(name.to_owned())
                .or_insert(shared)
                .value(),
        )
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for NameInterner {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
struct OpenScope {
    name: Arc<str>,
    category: Arc<str>,
    start_ns: u64,
}

#[derive(Debug, Default)]
struct ScopeStack {
    open: Vec<OpenScope>,
    /// Begins past the depth limit still waiting for their end.
    ignored: usize,
}

/// Pairs nested begin/end calls per host thread into duration events.
///
/// Each thread only touches its own stack, so contention is limited to the
/// concurrent map shard holding that thread id.
pub struct ScopeTracker {
    stacks: DashMap<u32, ScopeStack>,
    interner: Arc<NameInterner>,
    max_depth: usize,
    metrics: Arc<PipelineMetrics>,
}

impl ScopeTracker {
    pub fn new(interner: Arc<NameInterner>, max_depth: usize, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            stacks: DashMap::new(),
            interner,
            max_depth: max_depth.max(1),
            metrics,
        }
    }

    /// Opens a scope on `thread_id`.
    pub fn begin(&self, thread_id: u32, name: &str, category: &str, timestamp_ns: u64) {
        let mut stack = self.stacks.entry(thread_id).or_default();
        if stack.ignored > 0 || stack.open.len() >= self.max_depth {
            stack.ignored += 1;
            self.metrics.scope_overflows.inc();
            return;
        }
        stack.open.push(OpenScope {
            name: self.interner.intern(name),
            category: self.interner.intern(category),
            start_ns: timestamp_ns,
        });
    }

    /// Closes the innermost scope on `thread_id`, returning the finished event.
    ///
    /// The event is stamped with the scope's start time so it lands in the
    /// window where the work began. Ends pairing with begins dropped at the
    /// depth limit are consumed without closing anything.
    pub fn end(&self, thread_id: u32, timestamp_ns: u64) -> Option<RawEvent> {
        let scope = match self.stacks.get_mut(&thread_id) {
            Some(mut stack) if stack.ignored > 0 => {
                stack.ignored -= 1;
                return None;
            }
            Some(mut stack) => stack.open.pop(),
            None => None,
        };

        let Some(scope) = scope else {
            self.metrics.unmatched_scope_ends.inc();
            return None;
        };

        Some(
            RawEvent::new(scope.name, scope.category, scope.start_ns)
                .with_duration(timestamp_ns.saturating_sub(scope.start_ns))
                .with_thread(thread_id),
        )
    }

    /// Current nesting depth for `thread_id`.
    pub fn depth(&self, thread_id: u32) -> usize {
        self.stacks.get(&thread_id).map_or(0, |s| s.open.len())
    }

    /// Discards every open scope on `thread_id`, e.g. when the thread exits.
    pub fn clear_thread(&self, thread_id: u32) -> usize {
        self.stacks
            .remove(&thread_id)
            .map_or(0, |(_, stack)| stack.open.len())
    }
}
