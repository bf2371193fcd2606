/*!
Global bug ledger.

When a child finds a bug under preemption-point set S, every job whose set
is a superset of S is exploring a subsumed subspace and can stop: the same
interleaving exists there too. Publishing is append-only; queries take a
snapshot under the lock.
*/

use parking_lot::Mutex;

use crate::ppset::PpSet;

#[derive(Debug, Default)]
pub struct BugSet {
    found: Mutex<Vec<PpSet>>,
}

impl BugSet {
    pub fn new() -> Self {
        BugSet::default()
    }

    /// Record that a bug was found while exploring `config`.
    pub fn publish(&self, config: &PpSet) {
        self.found.lock().push(config.clone());
    }

    /// True iff some recorded bug's set is a subset of `config`.
    pub fn already_found(&self, config: &PpSet) -> bool {
        self.found.lock().iter().any(|s| s.is_subset(config))
    }

    pub fn count(&self) -> usize {
        self.found.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ppset::PpInterner;

    #[test]
    fn subsets_subsume_supersets() {
        let interner = PpInterner::new();
        let p1 = interner.intern("DR 100 -1 0 0", 0);
        let p2 = interner.intern("DR 200 -1 0 0", 0);
        let p3 = interner.intern("DR 300 -1 0 0", 1);

        let bugs = BugSet::new();
        let found_in = PpSet::empty().with(p1.clone()).with(p2.clone());
        bugs.publish(&found_in);

        // {p1,p2,p3} ⊇ {p1,p2}: subsumed.
        let superset = found_in.with(p3.clone());
        assert!(bugs.already_found(&superset));
        // {p1,p3} does not contain {p1,p2}.
        let disjointish = PpSet::empty().with(p1).with(p3);
        assert!(!bugs.already_found(&disjointish));
        assert_eq!(bugs.count(), 1);
    }
}
