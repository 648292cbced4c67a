use std::collections::BTreeMap;

/// Final accumulator values for one task, keyed by accumulator id.
pub type AccumulatorSnapshot = BTreeMap<String, i64>;

/// Per-worker accumulator state.
///
/// Each worker slot owns exactly one context. It is cleared before every task
/// and snapshotted after it, so values never leak between tasks and never
/// mix across workers.
#[derive(Debug, Default)]
pub struct AccumulatorContext {
    values: BTreeMap<String, i64>,
}

impl AccumulatorContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` to the accumulator `id`, creating it at zero if absent.
    pub fn add(&mut self, id: &str, delta: i64) {
        *self.values.entry(id.to_string()).or_insert(0) += delta;
    }

    pub fn get(&self, id: &str) -> i64 {
        self.values.get(id).copied().unwrap_or(0)
    }

    /// Reset all accumulators. Called at the start of every task.
    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Capture the current values. Called at the end of a successful task.
    pub fn snapshot(&self) -> AccumulatorSnapshot {
        self.values.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_get() {
        let mut ctx = AccumulatorContext::new();
        ctx.add("records", 3);
        ctx.add("records", 2);
        ctx.add("bytes", 1024);
        assert_eq!(ctx.get("records"), 5);
        assert_eq!(ctx.get("bytes"), 1024);
        assert_eq!(ctx.get("missing"), 0);
    }

    #[test]
    fn clear_resets_everything() {
        let mut ctx = AccumulatorContext::new();
        ctx.add("records", 7);
        ctx.clear();
        assert!(ctx.is_empty());
        assert_eq!(ctx.get("records"), 0);
    }

    #[test]
    fn snapshot_is_detached() {
        let mut ctx = AccumulatorContext::new();
        ctx.add("records", 1);
        let snap = ctx.snapshot();
        ctx.add("records", 1);
        assert_eq!(snap.get("records"), Some(&1));
        assert_eq!(ctx.get("records"), 2);
    }
}
