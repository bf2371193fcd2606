/*!
Choice tree: the persistent record of every scheduling decision.

The tree is an arena (vector of node records) with parent-as-index, so
nodes can hold back-references without ownership cycles and ancestor walks
are cheap. Each `Nobe` commits one decision: which thread ran from the
previous preemption point, plus everything needed to revisit that point
(machine snapshot, agent-set snapshot, stack trace, memory-access set for
partial-order reduction). The tree is append-only during a branch and only
reset between experiments.
*/

use crate::sched::{AbortSet, GuestAddr, Scheduler, ThreadId};
use crate::stack::StackTrace;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// One shared-memory access, as observed between two preemption points.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemAccess {
    pub addr: GuestAddr,
    pub write: bool,
    pub eip: u32,
}

/// Access set for one tree segment, deduplicated by (addr, kind).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemAccessSet {
    accesses: Vec<MemAccess>,
}

impl MemAccessSet {
    pub fn record(&mut self, addr: GuestAddr, write: bool, eip: u32) {
        if !self
            .accesses
            .iter()
            .any(|a| a.addr == addr && a.write == write)
        {
            self.accesses.push(MemAccess { addr, write, eip });
        }
    }

    /// First conflicting pair between two segments (same address, at least
    /// one side writing), which is what makes two segments dependent for
    /// partial-order reduction.
    pub fn conflict_with<'a>(&'a self, other: &'a MemAccessSet) -> Option<(&'a MemAccess, &'a MemAccess)> {
        for a in &self.accesses {
            for b in &other.accesses {
                if a.addr == b.addr && (a.write || b.write) {
                    return Some((a, b));
                }
            }
        }
        None
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &MemAccess> {
        self.accesses.iter()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.accesses.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.accesses.is_empty()
    }

    /// Move the recorded accesses out, leaving the set empty for the next
    /// segment.
    pub fn take(&mut self) -> MemAccessSet {
        std::mem::take(self)
    }
}

/// A committed scheduling decision with everything needed to resume it.
#[derive(Clone, Debug)]
pub struct Nobe<S> {
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub depth: u32,

    /// Thread chosen to run from here; `None` on terminal nodes.
    pub chosen_tid: Option<ThreadId>,
    /// False when an external directive (replay, explorer) dictated it.
    pub our_choice: bool,
    pub is_preemption_point: bool,
    pub end_of_test: bool,
    pub data_race_eip: Option<u32>,
    pub voluntary: bool,
    pub joined_tid: Option<ThreadId>,
    pub xbegin: bool,
    pub prune_aborts: bool,
    pub check_retry: bool,

    pub stack: StackTrace,
    pub accesses: MemAccessSet,
    pub abort_set: AbortSet,
    /// Transactions an explorer decided must fail when this point replays.
    pub forced_xaborts: Vec<(ThreadId, u32)>,

    /// Agent-set snapshot taken on arrival.
    pub sched: Scheduler,
    /// Opaque machine snapshot taken on arrival.
    pub snapshot: S,
}

/// Arena of decision nodes. Node 0, once inserted, is the root (the first
/// preemption point ever hit).
#[derive(Clone, Debug, Default)]
pub struct ChoiceTree<S> {
    nodes: Vec<Nobe<S>>,
}

impl<S> ChoiceTree<S> {
    pub fn new() -> Self {
        ChoiceTree { nodes: Vec::new() }
    }

    pub fn insert(&mut self, mut nobe: Nobe<S>) -> NodeId {
        let id = NodeId(self.nodes.len());
        if let Some(parent) = nobe.parent {
            nobe.depth = self.nodes[parent.0].depth + 1;
            self.nodes[parent.0].children.push(id);
        } else {
            assert!(self.nodes.is_empty(), "second root inserted");
            nobe.depth = 0;
        }
        self.nodes.push(nobe);
        id
    }

    #[inline]
    pub fn root(&self) -> Option<NodeId> {
        if self.nodes.is_empty() {
            None
        } else {
            Some(NodeId(0))
        }
    }

    #[inline]
    pub fn get(&self, id: NodeId) -> &Nobe<S> {
        &self.nodes[id.0]
    }

    #[inline]
    pub fn get_mut(&mut self, id: NodeId) -> &mut Nobe<S> {
        &mut self.nodes[id.0]
    }

    /// Walk from `id` to the root, inclusive.
    pub fn ancestors(&self, id: NodeId) -> Ancestors<'_, S> {
        Ancestors {
            tree: self,
            next: Some(id),
        }
    }

    /// True iff `anc` lies on the path from `desc` to the root (inclusive).
    pub fn is_ancestor(&self, anc: NodeId, desc: NodeId) -> bool {
        self.ancestors(desc).any(|id| id == anc)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Discard the whole tree (experiment boundary).
    pub fn reset(&mut self) {
        self.nodes.clear();
    }
}

pub struct Ancestors<'a, S> {
    tree: &'a ChoiceTree<S>,
    next: Option<NodeId>,
}

impl<'a, S> Iterator for Ancestors<'a, S> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.next?;
        self.next = self.tree.get(id).parent;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_nobe(parent: Option<NodeId>, tid: ThreadId) -> Nobe<()> {
        Nobe {
            parent,
            children: Vec::new(),
            depth: 0,
            chosen_tid: Some(tid),
            our_choice: true,
            is_preemption_point: true,
            end_of_test: false,
            data_race_eip: None,
            voluntary: false,
            joined_tid: None,
            xbegin: false,
            prune_aborts: false,
            check_retry: false,
            stack: StackTrace::default(),
            accesses: MemAccessSet::default(),
            abort_set: AbortSet::default(),
            forced_xaborts: Vec::new(),
            sched: Scheduler::new(),
            snapshot: (),
        }
    }

    #[test]
    fn ancestry_and_depth() {
        let mut tree = ChoiceTree::new();
        let root = tree.insert(bare_nobe(None, 1));
        let mid = tree.insert(bare_nobe(Some(root), 2));
        let leaf = tree.insert(bare_nobe(Some(mid), 1));
        let sibling = tree.insert(bare_nobe(Some(root), 3));

        assert_eq!(tree.get(leaf).depth, 2);
        assert!(tree.is_ancestor(root, leaf));
        assert!(tree.is_ancestor(mid, leaf));
        assert!(tree.is_ancestor(leaf, leaf));
        assert!(!tree.is_ancestor(sibling, leaf));
        assert!(!tree.is_ancestor(leaf, mid));
        assert_eq!(
            tree.ancestors(leaf).collect::<Vec<_>>(),
            vec![leaf, mid, root]
        );
        assert_eq!(tree.get(root).children, vec![mid, sibling]);
    }

    #[test]
    fn reset_discards_everything() {
        let mut tree = ChoiceTree::new();
        let root = tree.insert(bare_nobe(None, 1));
        tree.insert(bare_nobe(Some(root), 2));
        tree.reset();
        assert!(tree.is_empty());
        assert_eq!(tree.root(), None);
        // A fresh root is legal again after reset.
        tree.insert(bare_nobe(None, 4));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn access_sets_dedupe_and_conflict() {
        let mut a = MemAccessSet::default();
        a.record(0x100, false, 0x8000);
        a.record(0x100, false, 0x8004); // dup (addr, kind)
        a.record(0x104, true, 0x8008);
        assert_eq!(a.len(), 2);

        let mut b = MemAccessSet::default();
        b.record(0x100, false, 0x9000);
        // Read/read on 0x100 does not conflict.
        assert!(a.conflict_with(&b).is_none());
        b.record(0x104, false, 0x9004);
        // Write/read on 0x104 does.
        let (x, y) = a.conflict_with(&b).unwrap();
        assert_eq!(x.addr, 0x104);
        assert!(x.write && !y.write);
    }
}
