//! Intraprocedural divide-by-zero analysis over the zero lattice.
//!
//! Two variants share one transfer function: the basic variant ignores
//! memory (stores and loads have no effect), while the pointer-aware
//! variant threads an external may-alias oracle through stores and loads.
//! After the fixpoint converges, [`check`] walks every division and flags
//! those whose divisor may be zero in the converged in-state.

use std::collections::{BTreeMap as Map, BTreeSet as Set};

use derive_more::Display;
use log::warn;

use crate::commons::Valid;

use super::pointer::PointerInfo;
use super::*;

// SECTION: analysis interface

/// The zero lattice.  It approximates what is known about an integer
/// variable with respect to "could this be zero":
///
/// `Uninit < {Zero, NonZero} < MaybeZero`
///
/// `Uninit` (bottom) means no value has flowed into the variable along any
/// path analyzed so far; `MaybeZero` (top) means the variable could be
/// anything.
#[derive(Copy, Clone, Debug, Display, Eq, Ord, PartialEq, PartialOrd)]
pub enum Domain {
    Uninit,
    Zero,
    NonZero,
    MaybeZero,
}

use Domain as D;

// Abstract environment
pub type Env = PointwiseEnv<Domain>;

/// Basic variant: memory is not modeled, so only values that flow through
/// registers are tracked.
pub fn analyze(program: &Valid<Program>, func: FuncId) -> (Map<InstId, Env>, Map<InstId, Env>) {
    let program = &program.0;
    let f = &program.functions[&func];
    let globals = int_globals(program);
    let bottom = Env::new(Map::new());
    let seed = bottom.clone();

    chaotic_iteration(f, &Cfg::new(f), &seed, &bottom, |_, stmt, env| {
        transfer(stmt, env, &globals, None)
    })
}

/// Pointer-aware variant: stores and loads go through `pointers`, and every
/// integer parameter starts as `MaybeZero` (parameters are unconstrained at
/// function entry).
pub fn analyze_with_pointers(
    program: &Valid<Program>,
    func: FuncId,
    pointers: &dyn PointerInfo,
) -> (Map<InstId, Env>, Map<InstId, Env>) {
    let program = &program.0;
    let f = &program.functions[&func];
    let globals = int_globals(program);
    let bottom = Env::new(Map::new());

    let mut seed = bottom.clone();
    for param in &f.params {
        if param.typ().is_int() {
            seed.insert(param, &D::MaybeZero);
        }
    }

    chaotic_iteration(f, &Cfg::new(f), &seed, &bottom, |_, stmt, env| {
        transfer(stmt, env, &globals, Some(pointers))
    })
}

/// Scan the converged in-states and flag every division whose divisor may
/// be zero.
///
/// Policy: `Zero` and `MaybeZero` divisors are flagged; `NonZero` is safe;
/// `Uninit` is *not* flagged, because it means the division was never
/// reached along any analyzed path (see [`Domain::possibly_zero`]).
pub fn check(f: &Function, in_map: &Map<InstId, Env>) -> Set<InstId> {
    let mut flagged = Set::new();

    for id in inst_ids(f) {
        if let Stmt::Inst(Instruction::Arith {
            aop: ArithmeticOp::Div,
            op2,
            ..
        }) = stmt_at(f, &id)
        {
            if in_map[&id].value_from_op(op2).possibly_zero() {
                flagged.insert(id);
            }
        }
    }

    flagged
}

// SECTION: the lattice

impl AbstractValue for Domain {
    type Concrete = i64;

    const BOTTOM: Self = D::Uninit;

    fn alpha(val: i64) -> Self {
        if val == 0 {
            D::Zero
        } else {
            D::NonZero
        }
    }

    fn join(&self, rhs: &Self) -> Domain {
        match (self, rhs) {
            (D::Uninit, x) | (x, D::Uninit) => *x,
            (x, y) if x == y => *x,
            // Zero ⊔ NonZero and anything involving MaybeZero
            _ => D::MaybeZero,
        }
    }
}

impl Domain {
    /// The named flagging policy: could a division by this value trap?
    /// `Uninit` is deliberately excluded — it marks unreached code, not a
    /// value known to be dangerous.
    pub fn possibly_zero(self) -> bool {
        matches!(self, D::Zero | D::MaybeZero)
    }

    /// `a + b`.  `Uninit` operands propagate; two nonzero values can
    /// cancel, so the best nontrivial fact is that adding zero preserves
    /// the other operand.
    pub fn add(a: Domain, b: Domain) -> Domain {
        match (a, b) {
            (D::Uninit, _) | (_, D::Uninit) => D::Uninit,
            (D::Zero, x) | (x, D::Zero) => x,
            _ => D::MaybeZero,
        }
    }

    /// `a - b`: same table as addition (negation preserves zeroness).
    pub fn sub(a: Domain, b: Domain) -> Domain {
        match (a, b) {
            (D::Uninit, _) | (_, D::Uninit) => D::Uninit,
            (D::Zero, x) | (x, D::Zero) => x,
            _ => D::MaybeZero,
        }
    }

    /// `a * b`: zero is absorbing, and a product of nonzero integers is
    /// nonzero.
    pub fn mul(a: Domain, b: Domain) -> Domain {
        match (a, b) {
            (D::Uninit, _) | (_, D::Uninit) => D::Uninit,
            (D::Zero, _) | (_, D::Zero) => D::Zero,
            (D::NonZero, D::NonZero) => D::NonZero,
            _ => D::MaybeZero,
        }
    }

    /// `a / b`: the domain of the *quotient*, not the hazard (that is
    /// [`check`]'s job).  Integer division truncates, so even
    /// nonzero / nonzero may be zero; only zero / nonzero is exact.
    pub fn div(a: Domain, b: Domain) -> Domain {
        match (a, b) {
            (D::Uninit, _) | (_, D::Uninit) => D::Uninit,
            (_, D::Zero) | (_, D::MaybeZero) => D::MaybeZero,
            (D::Zero, _) => D::Zero,
            _ => D::MaybeZero,
        }
    }

    /// The comparison truth table: the domain of the boolean result (zero
    /// for false, nonzero for true).
    ///
    /// The table is deliberately coarse and asymmetric: equality tests are
    /// precise only against a `Zero` operand, unsigned orderings know that
    /// unsigned values are nonnegative, and signed orderings give up on
    /// everything except `0 >= 0` / `0 <= 0`.  Refining it is possible but
    /// the coarse answers are the safe ones.
    pub fn cmp(rop: ComparisonOp, a: Domain, b: Domain) -> Domain {
        use ComparisonOp::*;

        match rop {
            Eq => match (a, b) {
                (D::Zero, D::Zero) => D::NonZero,
                (D::Zero, D::NonZero) | (D::NonZero, D::Zero) => D::Zero,
                _ => D::MaybeZero,
            },
            Neq => match (a, b) {
                (D::Zero, D::Zero) => D::Zero,
                (D::Zero, D::NonZero) | (D::NonZero, D::Zero) => D::NonZero,
                _ => D::MaybeZero,
            },
            Uge => match (a, b) {
                (D::Zero, D::Zero) => D::NonZero,
                (D::Zero, D::NonZero) => D::Zero,
                (D::NonZero, D::Zero) | (D::MaybeZero, D::Zero) => D::NonZero,
                _ => D::MaybeZero,
            },
            Ule => match (a, b) {
                // unsigned zero is <= everything
                (D::Zero, _) => D::NonZero,
                (D::NonZero, D::Zero) => D::Zero,
                _ => D::MaybeZero,
            },
            // signed orderings: the sign of a NonZero operand is unknown
            Sge | Sle => match (a, b) {
                (D::Zero, D::Zero) => D::NonZero,
                _ => D::MaybeZero,
            },
            Ult | Ugt | Slt | Sgt => D::MaybeZero,
        }
    }
}

// SECTION: transfer function

impl Env {
    fn value_from_op(&self, op: &Operand) -> Domain {
        match op {
            Operand::CInt(n) => Domain::alpha(*n),
            Operand::Var(var) => self.get(var),
        }
    }

    // black-box calls may write any integer global
    fn clobber(&mut self, vars: &Set<VarId>) {
        for var in vars {
            self.insert(var, &D::MaybeZero);
        }
    }
}

fn int_globals(program: &Program) -> Set<VarId> {
    program
        .globals
        .iter()
        .filter(|g| g.typ().is_int())
        .cloned()
        .collect()
}

/// The effect of one statement on the abstract state.  Returns a fresh
/// out-state; the incoming state is never mutated in place, so the engine
/// can compare distinct snapshots during flow-out.
fn transfer(stmt: &Stmt, env: &Env, globals: &Set<VarId>, pointers: Option<&dyn PointerInfo>) -> Env {
    use Instruction::*;

    let mut out = env.clone();

    match stmt {
        Stmt::Inst(inst) => match inst {
            // external calls are unconstrained user input
            CallExt { lhs, .. } => {
                out.clobber(globals);
                if let Some(lhs) = lhs {
                    if lhs.typ().is_int() {
                        out.insert(lhs, &D::MaybeZero);
                    }
                }
            }
            Phi { lhs, ops } if lhs.typ().is_int() => {
                out.insert(lhs, &eval_phi(ops, env));
            }
            Arith { lhs, aop, op1, op2 } => {
                let v1 = env.value_from_op(op1);
                let v2 = env.value_from_op(op2);
                let val = match aop {
                    ArithmeticOp::Add => Domain::add(v1, v2),
                    ArithmeticOp::Sub => Domain::sub(v1, v2),
                    ArithmeticOp::Mul => Domain::mul(v1, v2),
                    ArithmeticOp::Div => Domain::div(v1, v2),
                };
                out.insert(lhs, &val);
            }
            Cmp { lhs, rop, op1, op2 } => {
                let v1 = env.value_from_op(op1);
                let v2 = env.value_from_op(op2);
                out.insert(lhs, &Domain::cmp(*rop, v1, v2));
            }
            // casts and copies pass the operand's domain through unchanged
            Cast { lhs, op } | Copy { lhs, op } if lhs.typ().is_int() => {
                out.insert(lhs, &env.value_from_op(op));
            }
            // allocation sites and address-taking define pointers, not
            // integers
            Alloc { .. } | AddrOf { .. } => {}
            Store { dst, op } => {
                if let Some(pointers) = pointers {
                    if op.typ().is_int() {
                        let stored = env.value_from_op(op);
                        out.insert(dst, &stored);
                        // a may-alias is not a must-alias: aliases keep
                        // their old domain joined with the stored one
                        for other in pointers.tracked() {
                            if other != dst && pointers.may_alias(dst, other) {
                                out.insert(other, &env.get(other).join(&stored));
                            }
                        }
                    }
                }
            }
            Load { lhs, src } => {
                if pointers.is_some() && lhs.typ().is_int() {
                    out.insert(lhs, &env.get(src));
                }
            }
            Phi { .. } | Cast { .. } | Copy { .. } => {}
            Gep { .. } => {
                warn!("unhandled instruction: {inst}");
            }
        },
        Stmt::Term(term) => match term {
            // intraprocedural: a called function is a black box
            Terminal::CallDirect { lhs, .. } => {
                out.clobber(globals);
                if let Some(lhs) = lhs {
                    if lhs.typ().is_int() {
                        out.insert(lhs, &D::MaybeZero);
                    }
                }
            }
            // the analysis is flow-insensitive in branch conditions
            Terminal::Branch { .. } | Terminal::Jump(_) | Terminal::Ret(_) => {}
        },
    }

    out
}

/// A phi whose incoming operands are all the same literal resolves to that
/// literal; otherwise the result is the join of every incoming domain.
fn eval_phi(ops: &[Operand], env: &Env) -> Domain {
    let mut literals = ops.iter().filter_map(|op| match op {
        Operand::CInt(n) => Some(*n),
        Operand::Var(_) => None,
    });
    if let Some(first) = literals.next() {
        if literals.all(|n| n == first) && ops.iter().all(|op| op.as_var().is_none()) {
            return Domain::alpha(first);
        }
    }

    ops.iter()
        .fold(D::Uninit, |acc, op| acc.join(&env.value_from_op(op)))
}
