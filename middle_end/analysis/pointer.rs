//! May-alias information for the pointer-aware divide-by-zero variant.
//!
//! The analysis itself only needs the [`PointerInfo`] trait; callers with a
//! better points-to analysis can plug it in.  [`FlowInsensitivePointerInfo`]
//! is the conservative in-crate implementation.

use std::collections::{BTreeMap as Map, BTreeSet as Set};

use crate::middle_end::lir::*;

/// A read-only oracle answering may-alias queries between pointer
/// variables.  It is consulted on every store and must not change during a
/// function's analysis.
pub trait PointerInfo {
    /// The pointer variables whose pointees the analysis tracks.
    fn tracked(&self) -> &Set<VarId>;

    /// May `a` and `b` refer to the same storage on some execution?
    fn may_alias(&self, a: &VarId, b: &VarId) -> bool;
}

/// Flow-insensitive points-to sets for one function.
///
/// Address-taking is the only precise source of targets; pointer copies,
/// casts and phis propagate target sets until a fixpoint.  A pointer whose
/// targets cannot be derived this way (loaded from memory, returned by a
/// call, produced by pointer arithmetic) is treated as aliasing every
/// tracked pointer.
#[derive(Clone, Debug)]
pub struct FlowInsensitivePointerInfo {
    tracked: Set<VarId>,
    points_to: Map<VarId, Set<VarId>>,
    unknown: Set<VarId>,
}

impl FlowInsensitivePointerInfo {
    pub fn new(f: &Function) -> Self {
        let tracked = f
            .params
            .iter()
            .chain(f.locals.iter())
            .filter(|v| matches!(v.typ().deref(), Some(t) if t.is_int()))
            .cloned()
            .collect();

        let mut points_to: Map<VarId, Set<VarId>> = Map::new();
        let mut unknown: Set<VarId> = Set::new();
        // pointer-to-pointer flows, resolved below by iteration
        let mut flows: Vec<(VarId, VarId)> = vec![];

        for bb in f.body.values() {
            for inst in &bb.insts {
                use Instruction::*;
                match inst {
                    AddrOf { lhs, op } => {
                        points_to.entry(lhs.clone()).or_default().insert(op.clone());
                    }
                    Cast { lhs, op } | Copy { lhs, op } if lhs.typ().is_ptr() => {
                        match op.as_var() {
                            Some(v) => flows.push((v.clone(), lhs.clone())),
                            None => {
                                unknown.insert(lhs.clone());
                            }
                        }
                    }
                    Phi { lhs, ops } if lhs.typ().is_ptr() => {
                        for op in ops {
                            match op.as_var() {
                                Some(v) => flows.push((v.clone(), lhs.clone())),
                                None => {
                                    unknown.insert(lhs.clone());
                                }
                            }
                        }
                    }
                    // an allocation is fresh storage: it gets itself as a
                    // summary target, distinct from every other site
                    Alloc { lhs } => {
                        points_to.entry(lhs.clone()).or_default().insert(lhs.clone());
                    }
                    Gep { lhs, .. } => {
                        unknown.insert(lhs.clone());
                    }
                    Load { lhs, .. } if lhs.typ().is_ptr() => {
                        unknown.insert(lhs.clone());
                    }
                    CallExt { lhs: Some(lhs), .. } if lhs.typ().is_ptr() => {
                        unknown.insert(lhs.clone());
                    }
                    _ => {}
                }
            }
            if let Terminal::CallDirect { lhs: Some(lhs), .. } = &bb.term {
                if lhs.typ().is_ptr() {
                    unknown.insert(lhs.clone());
                }
            }
        }

        // propagate until nothing changes; the sets only grow, so this
        // terminates
        let mut changed = true;
        while changed {
            changed = false;
            for (src, dst) in &flows {
                if unknown.contains(src) && unknown.insert(dst.clone()) {
                    changed = true;
                }
                let src_targets = points_to.get(src).cloned().unwrap_or_default();
                let dst_targets = points_to.entry(dst.clone()).or_default();
                for target in src_targets {
                    if dst_targets.insert(target) {
                        changed = true;
                    }
                }
            }
        }

        Self {
            tracked,
            points_to,
            unknown,
        }
    }
}

impl PointerInfo for FlowInsensitivePointerInfo {
    fn tracked(&self) -> &Set<VarId> {
        &self.tracked
    }

    fn may_alias(&self, a: &VarId, b: &VarId) -> bool {
        if self.unknown.contains(a) || self.unknown.contains(b) {
            return true;
        }
        match (self.points_to.get(a), self.points_to.get(b)) {
            (Some(ta), Some(tb)) => !ta.is_disjoint(tb),
            // no derived targets at all: nothing is known to overlap
            _ => false,
        }
    }
}
