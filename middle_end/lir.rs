//! The lir intermediate representation: typed variables, basic blocks, and
//! block terminals, plus validation and a JSON-friendly serde encoding.
//!
//! This is the surface the analyses consume.  Programs arrive already
//! lowered; there is no parser here, only `serde` deserialization and the
//! structural checks in [`Program::validate`].

use std::collections::{BTreeMap as Map, BTreeSet as Set};
use std::fmt;

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::commons::Valid;

// SECTION: identifiers and types

/// The type of a variable: an integer or a pointer.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Type {
    Int,
    Pointer(Box<Type>),
}

impl Type {
    pub fn is_int(&self) -> bool {
        matches!(self, Type::Int)
    }

    pub fn is_ptr(&self) -> bool {
        matches!(self, Type::Pointer(_))
    }

    /// The pointee type, if this is a pointer.
    pub fn deref(&self) -> Option<&Type> {
        match self {
            Type::Int => None,
            Type::Pointer(inner) => Some(inner),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Int => write!(f, "int"),
            Type::Pointer(inner) => write!(f, "&{inner}"),
        }
    }
}

pub fn int_ty() -> Type {
    Type::Int
}

pub fn ptr_ty(inner: Type) -> Type {
    Type::Pointer(Box::new(inner))
}

/// A basic block label.
#[derive(Clone, Debug, Display, Eq, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct BbId(String);

pub fn bb_id(name: &str) -> BbId {
    BbId(name.to_string())
}

impl BbId {
    pub fn name(&self) -> &str {
        &self.0
    }
}

/// A function name.
#[derive(Clone, Debug, Display, Eq, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct FuncId(String);

pub fn func_id(name: &str) -> FuncId {
    FuncId(name.to_string())
}

impl FuncId {
    pub fn name(&self) -> &str {
        &self.0
    }
}

/// A typed variable.  The name is the variable's stable identity; constants
/// never appear as `VarId`s.
#[derive(Clone, Debug, Display, Eq, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[display(fmt = "{}", name)]
pub struct VarId {
    name: String,
    typ: Type,
}

pub fn var_id(name: &str, typ: Type) -> VarId {
    VarId {
        name: name.to_string(),
        typ,
    }
}

impl VarId {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn typ(&self) -> &Type {
        &self.typ
    }
}

/// An instruction operand: a constant integer or a variable.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Operand {
    CInt(i64),
    Var(VarId),
}

impl Operand {
    pub fn typ(&self) -> Type {
        match self {
            Operand::CInt(_) => int_ty(),
            Operand::Var(v) => v.typ().clone(),
        }
    }

    pub fn as_var(&self) -> Option<&VarId> {
        match self {
            Operand::CInt(_) => None,
            Operand::Var(v) => Some(v),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::CInt(n) => write!(f, "{n}"),
            Operand::Var(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Clone, Copy, Debug, Display, Eq, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum ArithmeticOp {
    #[display(fmt = "add")]
    Add,
    #[display(fmt = "sub")]
    Sub,
    #[display(fmt = "mul")]
    Mul,
    #[display(fmt = "div")]
    Div,
}

/// Comparison predicates.  Signedness is part of the predicate, as in the
/// usual machine-level comparisons, because the analyses treat signed and
/// unsigned orderings differently.
#[derive(Clone, Copy, Debug, Display, Eq, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum ComparisonOp {
    #[display(fmt = "eq")]
    Eq,
    #[display(fmt = "neq")]
    Neq,
    #[display(fmt = "ult")]
    Ult,
    #[display(fmt = "ule")]
    Ule,
    #[display(fmt = "ugt")]
    Ugt,
    #[display(fmt = "uge")]
    Uge,
    #[display(fmt = "slt")]
    Slt,
    #[display(fmt = "sle")]
    Sle,
    #[display(fmt = "sgt")]
    Sgt,
    #[display(fmt = "sge")]
    Sge,
}

// SECTION: instructions

/// Non-terminal instructions.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Instruction {
    /// `lhs = $addrof op`
    AddrOf { lhs: VarId, op: VarId },
    /// `lhs = $alloc`
    Alloc { lhs: VarId },
    /// `lhs = $arith aop op1 op2`
    Arith {
        lhs: VarId,
        aop: ArithmeticOp,
        op1: Operand,
        op2: Operand,
    },
    /// `lhs = $cast op`
    Cast { lhs: VarId, op: Operand },
    /// `lhs = $cmp rop op1 op2`
    Cmp {
        lhs: VarId,
        rop: ComparisonOp,
        op1: Operand,
        op2: Operand,
    },
    /// `lhs = $copy op`
    Copy { lhs: VarId, op: Operand },
    /// `lhs = $gep src idx` (pointer arithmetic)
    Gep {
        lhs: VarId,
        src: VarId,
        idx: Operand,
    },
    /// `lhs = $load src`
    Load { lhs: VarId, src: VarId },
    /// `$store dst op`
    Store { dst: VarId, op: Operand },
    /// `lhs = $phi(ops)`
    Phi { lhs: VarId, ops: Vec<Operand> },
    /// `lhs = $call_ext callee(args)` — call to code outside the program.
    CallExt {
        lhs: Option<VarId>,
        ext_callee: FuncId,
        args: Vec<Operand>,
    },
}

impl Instruction {
    /// The variable this instruction defines, if any.
    pub fn defined(&self) -> Option<&VarId> {
        use Instruction::*;
        match self {
            AddrOf { lhs, .. }
            | Alloc { lhs }
            | Arith { lhs, .. }
            | Cast { lhs, .. }
            | Cmp { lhs, .. }
            | Copy { lhs, .. }
            | Gep { lhs, .. }
            | Load { lhs, .. }
            | Phi { lhs, .. } => Some(lhs),
            Store { .. } => None,
            CallExt { lhs, .. } => lhs.as_ref(),
        }
    }

    /// All variables this instruction reads.
    pub fn used(&self) -> Vec<&VarId> {
        use Instruction::*;

        fn vars<'a>(ops: impl IntoIterator<Item = &'a Operand>) -> Vec<&'a VarId> {
            ops.into_iter().filter_map(Operand::as_var).collect()
        }

        match self {
            AddrOf { op, .. } => vec![op],
            Alloc { .. } => vec![],
            Arith { op1, op2, .. } | Cmp { op1, op2, .. } => vars([op1, op2]),
            Cast { op, .. } | Copy { op, .. } => vars([op]),
            Gep { src, idx, .. } => {
                let mut used = vec![src];
                used.extend(vars([idx]));
                used
            }
            Load { src, .. } => vec![src],
            Store { dst, op } => {
                let mut used = vec![dst];
                used.extend(vars([op]));
                used
            }
            Phi { ops, .. } => vars(ops),
            CallExt { args, .. } => vars(args),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Instruction::*;
        match self {
            AddrOf { lhs, op } => write!(f, "{lhs} = $addrof {op}"),
            Alloc { lhs } => write!(f, "{lhs} = $alloc"),
            Arith { lhs, aop, op1, op2 } => write!(f, "{lhs} = $arith {aop} {op1} {op2}"),
            Cast { lhs, op } => write!(f, "{lhs} = $cast {op}"),
            Cmp { lhs, rop, op1, op2 } => write!(f, "{lhs} = $cmp {rop} {op1} {op2}"),
            Copy { lhs, op } => write!(f, "{lhs} = $copy {op}"),
            Gep { lhs, src, idx } => write!(f, "{lhs} = $gep {src} {idx}"),
            Load { lhs, src } => write!(f, "{lhs} = $load {src}"),
            Store { dst, op } => write!(f, "$store {dst} {op}"),
            Phi { lhs, ops } => {
                write!(f, "{lhs} = $phi(")?;
                for (i, op) in ops.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{op}")?;
                }
                write!(f, ")")
            }
            CallExt {
                lhs,
                ext_callee,
                args,
            } => {
                if let Some(lhs) = lhs {
                    write!(f, "{lhs} = ")?;
                }
                write!(f, "$call_ext {ext_callee}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Block terminals.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Terminal {
    /// `$branch cond tt ff`
    Branch { cond: Operand, tt: BbId, ff: BbId },
    /// `$jump bb`
    Jump(BbId),
    /// `lhs = $call_dir callee(args) then next_bb`
    CallDirect {
        lhs: Option<VarId>,
        callee: FuncId,
        args: Vec<Operand>,
        next_bb: BbId,
    },
    /// `$ret op`
    Ret(Option<Operand>),
}

impl Terminal {
    pub fn defined(&self) -> Option<&VarId> {
        match self {
            Terminal::CallDirect { lhs, .. } => lhs.as_ref(),
            _ => None,
        }
    }

    pub fn used(&self) -> Vec<&VarId> {
        match self {
            Terminal::Branch { cond, .. } => cond.as_var().into_iter().collect(),
            Terminal::Jump(_) => vec![],
            Terminal::CallDirect { args, .. } => {
                args.iter().filter_map(Operand::as_var).collect()
            }
            Terminal::Ret(op) => op.iter().filter_map(Operand::as_var).collect(),
        }
    }
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Terminal::*;
        match self {
            Branch { cond, tt, ff } => write!(f, "$branch {cond} {tt} {ff}"),
            Jump(bb) => write!(f, "$jump {bb}"),
            CallDirect {
                lhs,
                callee,
                args,
                next_bb,
            } => {
                if let Some(lhs) = lhs {
                    write!(f, "{lhs} = ")?;
                }
                write!(f, "$call_dir {callee}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ") then {next_bb}")
            }
            Ret(Some(op)) => write!(f, "$ret {op}"),
            Ret(None) => write!(f, "$ret"),
        }
    }
}

// SECTION: blocks, functions, programs

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BasicBlock {
    pub id: BbId,
    pub insts: Vec<Instruction>,
    pub term: Terminal,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub id: FuncId,
    pub ret_ty: Option<Type>,
    pub params: Vec<VarId>,
    pub locals: Set<VarId>,
    pub body: Map<BbId, BasicBlock>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub globals: Set<VarId>,
    pub functions: Map<FuncId, Function>,
}

// SECTION: validation

/// A structural defect found by [`Program::validate`].
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum ValidationError {
    #[display(fmt = "function {} has no entry block", _0)]
    MissingEntry(FuncId),
    #[display(fmt = "block {} in function {} is keyed as {}", _1, _0, _2)]
    MismatchedBlockId(FuncId, BbId, BbId),
    #[display(fmt = "function {} references undefined block {}", _0, _1)]
    UndefinedBlock(FuncId, BbId),
    #[display(fmt = "function {} calls undefined function {}", _0, _1)]
    UndefinedFunction(FuncId, FuncId),
    #[display(fmt = "function {} uses undeclared variable {}", _0, _1)]
    UndeclaredVariable(FuncId, VarId),
}

impl std::error::Error for ValidationError {}

impl Program {
    /// Check structural well-formedness and wrap the program as [`Valid`].
    pub fn validate(self) -> Result<Valid<Program>, ValidationError> {
        for (fid, f) in &self.functions {
            if !f.body.contains_key(&bb_id("entry")) {
                return Err(ValidationError::MissingEntry(fid.clone()));
            }

            let mut declared: Set<&VarId> = self.globals.iter().collect();
            declared.extend(f.params.iter());
            declared.extend(f.locals.iter());

            let check_var = |v: &VarId| -> Result<(), ValidationError> {
                if declared.contains(v) {
                    Ok(())
                } else {
                    Err(ValidationError::UndeclaredVariable(fid.clone(), v.clone()))
                }
            };
            let check_block = |bb: &BbId| -> Result<(), ValidationError> {
                if f.body.contains_key(bb) {
                    Ok(())
                } else {
                    Err(ValidationError::UndefinedBlock(fid.clone(), bb.clone()))
                }
            };

            for (bbid, bb) in &f.body {
                if *bbid != bb.id {
                    return Err(ValidationError::MismatchedBlockId(
                        fid.clone(),
                        bb.id.clone(),
                        bbid.clone(),
                    ));
                }

                for inst in &bb.insts {
                    for v in inst.used() {
                        check_var(v)?;
                    }
                    if let Some(lhs) = inst.defined() {
                        check_var(lhs)?;
                    }
                }

                for v in bb.term.used() {
                    check_var(v)?;
                }
                if let Some(lhs) = bb.term.defined() {
                    check_var(lhs)?;
                }

                match &bb.term {
                    Terminal::Branch { tt, ff, .. } => {
                        check_block(tt)?;
                        check_block(ff)?;
                    }
                    Terminal::Jump(next) => check_block(next)?,
                    Terminal::CallDirect {
                        callee, next_bb, ..
                    } => {
                        if !self.functions.contains_key(callee) {
                            return Err(ValidationError::UndefinedFunction(
                                fid.clone(),
                                callee.clone(),
                            ));
                        }
                        check_block(next_bb)?;
                    }
                    Terminal::Ret(_) => {}
                }
            }
        }

        Ok(Valid(self))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn ret_block(id: &str) -> BasicBlock {
        BasicBlock {
            id: bb_id(id),
            insts: vec![],
            term: Terminal::Ret(None),
        }
    }

    fn one_block_fn(name: &str) -> Function {
        Function {
            id: func_id(name),
            ret_ty: None,
            params: vec![],
            locals: Set::new(),
            body: [(bb_id("entry"), ret_block("entry"))].into(),
        }
    }

    #[test]
    fn validate_accepts_minimal_program() {
        let p = Program {
            globals: Set::new(),
            functions: [(func_id("main"), one_block_fn("main"))].into(),
        };
        assert!(p.validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_entry() {
        let mut f = one_block_fn("main");
        f.body = [(bb_id("start"), ret_block("start"))].into();
        let p = Program {
            globals: Set::new(),
            functions: [(func_id("main"), f)].into(),
        };
        assert_eq!(
            p.validate().unwrap_err(),
            ValidationError::MissingEntry(func_id("main"))
        );
    }

    #[test]
    fn validate_rejects_dangling_branch_target() {
        let mut f = one_block_fn("main");
        f.body.get_mut(&bb_id("entry")).unwrap().term = Terminal::Jump(bb_id("nowhere"));
        let p = Program {
            globals: Set::new(),
            functions: [(func_id("main"), f)].into(),
        };
        assert_eq!(
            p.validate().unwrap_err(),
            ValidationError::UndefinedBlock(func_id("main"), bb_id("nowhere"))
        );
    }

    #[test]
    fn validate_rejects_undeclared_variable() {
        let mut f = one_block_fn("main");
        f.body.get_mut(&bb_id("entry")).unwrap().insts.push(Instruction::Copy {
            lhs: var_id("x", int_ty()),
            op: Operand::CInt(1),
        });
        let p = Program {
            globals: Set::new(),
            functions: [(func_id("main"), f)].into(),
        };
        assert_eq!(
            p.validate().unwrap_err(),
            ValidationError::UndeclaredVariable(func_id("main"), var_id("x", int_ty()))
        );
    }

    #[test]
    fn json_round_trip() {
        let x = var_id("x", int_ty());
        let mut f = one_block_fn("main");
        f.locals.insert(x.clone());
        f.body.get_mut(&bb_id("entry")).unwrap().insts.push(Instruction::Arith {
            lhs: x.clone(),
            aop: ArithmeticOp::Div,
            op1: Operand::CInt(10),
            op2: Operand::Var(x.clone()),
        });
        let p = Program {
            globals: Set::new(),
            functions: [(func_id("main"), f)].into(),
        };

        let encoded = serde_json::to_string(&p).unwrap();
        let decoded: Program = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn display_forms() {
        let x = var_id("x", int_ty());
        let p = var_id("p", ptr_ty(int_ty()));
        let inst = Instruction::Arith {
            lhs: x.clone(),
            aop: ArithmeticOp::Div,
            op1: Operand::CInt(10),
            op2: Operand::Var(x.clone()),
        };
        assert_eq!(inst.to_string(), "x = $arith div 10 x");
        let store = Instruction::Store {
            dst: p,
            op: Operand::CInt(0),
        };
        assert_eq!(store.to_string(), "$store p 0");
        let term = Terminal::Branch {
            cond: Operand::Var(x),
            tt: bb_id("tt"),
            ff: bb_id("ff"),
        };
        assert_eq!(term.to_string(), "$branch x tt ff");
    }
}
