//! Static analysis of lir programs.
//!
//! This module holds the pieces every dataflow analysis shares: the
//! block-level control-flow graph, instruction-level adjacency across block
//! boundaries, the pointwise abstract environment, and the worklist-driven
//! chaotic iteration engine.  Concrete analyses (see [`divzero`]) supply an
//! abstract value lattice and a transfer function.

use std::collections::VecDeque;
use std::collections::{BTreeMap as Map, BTreeSet as Set};
use std::fmt;
use std::fmt::Display;

use log::debug;

use super::lir::*;

pub mod divzero;
pub mod pointer;


/// Instruction IDs: a combination of the basic block ID and the index of
/// the instruction in the block.  The index `insts.len()` denotes the
/// block's terminal.
pub type InstId = (BbId, usize);

/// A program point: either a regular instruction or a block terminal.
#[derive(Clone, Copy, Debug)]
pub enum Stmt<'a> {
    Inst(&'a Instruction),
    Term(&'a Terminal),
}

impl Display for Stmt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stmt::Inst(inst) => write!(f, "{inst}"),
            Stmt::Term(term) => write!(f, "{term}"),
        }
    }
}

/// Resolve an [`InstId`] to the statement it names.
pub fn stmt_at<'a>(f: &'a Function, id: &InstId) -> Stmt<'a> {
    let bb = &f.body[&id.0];
    if id.1 < bb.insts.len() {
        Stmt::Inst(&bb.insts[id.1])
    } else {
        Stmt::Term(&bb.term)
    }
}

/// Every program point of a function, in block order.
pub fn inst_ids(f: &Function) -> Vec<InstId> {
    let mut ids = vec![];
    for (bbid, bb) in &f.body {
        for idx in 0..=bb.insts.len() {
            ids.push((bbid.clone(), idx));
        }
    }
    ids
}

/// The control-flow graph *for a function*: block-level successor and
/// predecessor edges derived from the block terminals.
#[derive(Clone, Debug)]
pub struct Cfg {
    pub entry: BbId,
    pub exit: BbId,
    succ_edges: Map<BbId, Set<BbId>>,
    pred_edges: Map<BbId, Set<BbId>>,
}

impl Cfg {
    // construct a Cfg from the given function's basic blocks.
    pub fn new(function: &Function) -> Self {
        fn insert_edge(map: &mut Map<BbId, Set<BbId>>, key_bbid: &BbId, value_bbid: &BbId) {
            map.entry(key_bbid.clone())
                .or_default()
                .insert(value_bbid.clone());
        }

        let entry = bb_id("entry");
        let mut exit = entry.clone();
        let mut succ_edges: Map<BbId, Set<BbId>> = Map::new();
        let mut pred_edges: Map<BbId, Set<BbId>> = Map::new();

        // every block gets an entry in both maps, even if it has no edges
        for bbid in function.body.keys() {
            succ_edges.entry(bbid.clone()).or_default();
            pred_edges.entry(bbid.clone()).or_default();
        }

        for (bbid, bb) in &function.body {
            match &bb.term {
                Terminal::Branch { cond: _, tt, ff } => {
                    insert_edge(&mut succ_edges, bbid, tt);
                    insert_edge(&mut succ_edges, bbid, ff);

                    insert_edge(&mut pred_edges, tt, bbid);
                    insert_edge(&mut pred_edges, ff, bbid);
                }
                Terminal::Jump(next_bb) => {
                    insert_edge(&mut succ_edges, bbid, next_bb);
                    insert_edge(&mut pred_edges, next_bb, bbid);
                }
                Terminal::CallDirect { next_bb, .. } => {
                    insert_edge(&mut succ_edges, bbid, next_bb);
                    insert_edge(&mut pred_edges, next_bb, bbid);
                }
                Terminal::Ret(_) => {
                    exit = bbid.clone();
                }
            }
        }

        Cfg {
            entry,
            exit,
            succ_edges,
            pred_edges,
        }
    }

    // an iterator over the successor edges of bb.
    pub fn succ(&self, bb: &BbId) -> impl Iterator<Item = &BbId> {
        self.succ_edges[bb].iter()
    }

    // an iterator over the predecessor edges of bb.
    pub fn pred(&self, bb: &BbId) -> impl Iterator<Item = &BbId> {
        self.pred_edges[bb].iter()
    }
}

// SECTION: instruction-level adjacency

/// The predecessors of a program point.  Inside a block this is the
/// previous instruction; at a block head it is the terminal of every
/// predecessor block.  The function entry has no predecessors.
pub fn predecessors(f: &Function, cfg: &Cfg, id: &InstId) -> Vec<InstId> {
    let (bbid, idx) = id;
    if *idx > 0 {
        return vec![(bbid.clone(), idx - 1)];
    }
    cfg.pred(bbid)
        .map(|p| (p.clone(), f.body[p].insts.len()))
        .collect()
}

/// The successors of a program point: the mirror of [`predecessors`].
/// The terminal of an exit block has no successors.
pub fn successors(f: &Function, cfg: &Cfg, id: &InstId) -> Vec<InstId> {
    let (bbid, idx) = id;
    if *idx < f.body[bbid].insts.len() {
        return vec![(bbid.clone(), idx + 1)];
    }
    cfg.succ(bbid).map(|s| (s.clone(), 0)).collect()
}

// SECTION: abstract domains and environments

/// An abstract value from an abstract lattice.
///
/// Any abstract domain for a variable implements this.
pub trait AbstractValue: Clone + Display + Eq + PartialEq {
    /// The concrete values we're abstracting.
    type Concrete;

    /// The bottom value of the join semi-lattice.
    const BOTTOM: Self;

    /// The abstraction of a concrete value.
    fn alpha(val: Self::Concrete) -> Self;

    /// The join of two abstract values.
    fn join(&self, rhs: &Self) -> Self;
}

/// The abstract state attached to a program point.  The engine only needs
/// to join states and compare them; equality must treat entries that are
/// absent on one side as bottom.
pub trait AbstractEnv: Clone + Eq {
    /// compute self = self ⊔ rhs, returning whether self changed.
    fn join_with(&mut self, rhs: &Self) -> bool;
}

/// An abstract environment built as a pointwise extension of the abstract
/// domain `A`.  It is a map from variables to abstract values; a variable
/// that is absent is implicitly `A::BOTTOM`.
#[derive(Clone, Debug)]
pub struct PointwiseEnv<A: AbstractValue> {
    pub values: Map<VarId, A>,
}

impl<A: AbstractValue> PointwiseEnv<A> {
    pub fn new(values: Map<VarId, A>) -> Self {
        Self { values }
    }

    // get the value of a variable, or bottom if it isn't present.
    pub fn get(&self, key: &VarId) -> A {
        self.values.get(key).unwrap_or(&A::BOTTOM).clone()
    }

    // insert a value for a variable.
    pub fn insert(&mut self, key: &VarId, val: &A) {
        self.values.insert(key.clone(), val.clone());
    }
}

impl<A: AbstractValue> PartialEq for PointwiseEnv<A> {
    fn eq(&self, other: &Self) -> bool {
        // resolve keys present in either map against the bottom default, so
        // that {x -> bottom} and {} compare equal
        self.values
            .keys()
            .chain(other.values.keys())
            .all(|key| self.get(key) == other.get(key))
    }
}

impl<A: AbstractValue> Eq for PointwiseEnv<A> {}

impl<A: AbstractValue> AbstractEnv for PointwiseEnv<A> {
    fn join_with(&mut self, rhs: &Self) -> bool {
        let mut changed = false;

        for (x, rhs_val) in &rhs.values {
            let lhs_val = self.values.entry(x.clone()).or_insert(A::BOTTOM);
            let joined = lhs_val.join(rhs_val);

            if joined != *lhs_val {
                *lhs_val = joined;
                changed = true;
            }
        }

        changed
    }
}

impl<A: AbstractValue> Display for PointwiseEnv<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let str = self.values.iter().fold("".to_string(), |acc, (var, val)| {
            if *val == A::BOTTOM {
                acc
            } else {
                format!("{acc}{var} -> {val}\n")
            }
        });
        write!(f, "{str}")
    }
}

// SECTION: intraprocedural dataflow analysis framework

/// An insertion-ordered set of program points pending (re-)evaluation.
/// Inserting an element that is already pending is a no-op.
pub struct Worklist {
    queue: VecDeque<InstId>,
    members: Set<InstId>,
}

impl Worklist {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            members: Set::new(),
        }
    }

    pub fn insert(&mut self, id: InstId) {
        if self.members.insert(id.clone()) {
            self.queue.push_back(id);
        }
    }

    pub fn pop(&mut self) -> Option<InstId> {
        let id = self.queue.pop_front()?;
        self.members.remove(&id);
        Some(id)
    }
}

impl Default for Worklist {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a forward analysis of `f` to a fixpoint by chaotic iteration.
///
/// Every program point gets an in-state (`seed` joined with its
/// predecessors' out-states) and an out-state (the transfer function
/// applied to the in-state).  The worklist starts with every point; a
/// point's successors are re-enqueued whenever its out-state changes,
/// and the iteration stops once no out-state does.
///
/// Returns the converged in-states and out-states.
pub fn chaotic_iteration<E, F>(
    f: &Function,
    cfg: &Cfg,
    seed: &E,
    bottom: &E,
    mut transfer: F,
) -> (Map<InstId, E>, Map<InstId, E>)
where
    E: AbstractEnv,
    F: FnMut(&InstId, &Stmt, &E) -> E,
{
    let ids = inst_ids(f);

    let mut in_map: Map<InstId, E> = ids.iter().map(|id| (id.clone(), seed.clone())).collect();
    let mut out_map: Map<InstId, E> = ids.iter().map(|id| (id.clone(), bottom.clone())).collect();

    let mut worklist = Worklist::new();
    for id in ids {
        worklist.insert(id);
    }

    let mut steps = 0usize;
    while let Some(id) = worklist.pop() {
        steps += 1;

        // flow-in: the seed joined with the out-states of all
        // predecessors.  Starting from the seed at every point keeps
        // seeded facts (the pointer variant's parameter domains) from
        // being lost when a seeded point also has predecessors, such as
        // an entry block that is a branch target
        let mut in_state = seed.clone();
        for pred in predecessors(f, cfg, &id) {
            in_state.join_with(&out_map[&pred]);
        }

        // transfer: compute a fresh candidate out-state
        let candidate = transfer(&id, &stmt_at(f, &id), &in_state);
        in_map.insert(id.clone(), in_state);

        // flow-out: compare the previous out-state against the candidate
        // before overwriting; only a change re-enqueues the successors
        if candidate != out_map[&id] {
            out_map.insert(id.clone(), candidate);
            for succ in successors(f, cfg, &id) {
                worklist.insert(succ);
            }
        }
    }

    debug!("fixpoint for {} reached after {} steps", f.id, steps);

    (in_map, out_map)
}
