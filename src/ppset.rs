/*!
Parent-side preemption points.

The fleet controller never interprets a preemption point; it only shuttles
directive strings into dynamic config files and reasons about *sets* of
them (which job explores which subspace, and whether one subspace subsumes
another). Points are interned so identical directives discovered by
different children collapse to one identity.
*/

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// One interned preemption point, identified for set math by `id`.
#[derive(Debug, PartialEq, Eq)]
pub struct Pp {
    pub id: u32,
    /// The literal dynamic-config directive (e.g. `DR c0ffee -1 0 0`).
    pub config_str: String,
    /// How many discovery rounds deep this point was found.
    pub generation: u32,
}

/// Interner for parent-side preemption points.
#[derive(Debug, Default)]
pub struct PpInterner {
    pps: Mutex<Vec<Arc<Pp>>>,
}

impl PpInterner {
    pub fn new() -> Self {
        PpInterner::default()
    }

    /// Return the existing point with this directive, or mint a new one.
    pub fn intern(&self, config_str: &str, generation: u32) -> Arc<Pp> {
        let mut pps = self.pps.lock();
        if let Some(existing) = pps.iter().find(|pp| pp.config_str == config_str) {
            return Arc::clone(existing);
        }
        let pp = Arc::new(Pp {
            id: pps.len() as u32,
            config_str: config_str.to_owned(),
            generation,
        });
        pps.push(Arc::clone(&pp));
        pp
    }

    pub fn len(&self) -> usize {
        self.pps.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pps.lock().is_empty()
    }
}

/// A set of interned preemption points: the parameter of one job.
#[derive(Clone, Debug, Default)]
pub struct PpSet {
    pps: BTreeMap<u32, Arc<Pp>>,
}

impl PpSet {
    pub fn empty() -> Self {
        PpSet::default()
    }

    pub fn add(&mut self, pp: Arc<Pp>) {
        self.pps.insert(pp.id, pp);
    }

    /// This set plus one more point (the next-generation job's parameter).
    pub fn with(&self, pp: Arc<Pp>) -> Self {
        let mut bigger = self.clone();
        bigger.add(pp);
        bigger
    }

    pub fn contains(&self, pp: &Pp) -> bool {
        self.pps.contains_key(&pp.id)
    }

    pub fn is_subset(&self, other: &PpSet) -> bool {
        self.pps.keys().all(|id| other.pps.contains_key(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Pp>> {
        self.pps.values()
    }

    pub fn len(&self) -> usize {
        self.pps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pps.is_empty()
    }

    /// Jobs are grouped by the deepest discovery round they include.
    pub fn generation(&self) -> u32 {
        self.pps.values().map(|pp| pp.generation).max().unwrap_or(0)
    }
}

impl PartialEq for PpSet {
    fn eq(&self, other: &Self) -> bool {
        self.pps.keys().eq(other.pps.keys())
    }
}

impl Eq for PpSet {}

impl fmt::Display for PpSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for pp in self.pps.values() {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{}", pp.config_str)?;
            first = false;
        }
        Ok(())
    }
}
