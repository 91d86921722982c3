use std::fmt;

use crate::entities::{Block, FuncRef, GlobalRef, StackSlot, Value};
use crate::immediates::Ieee64;
use crate::types::Type;

/// Some instructions use an external list of argument values because there
/// is not enough space inline. These value lists are stored in a memory
/// pool in `dfg.value_lists`.
pub type ValueList = cranelift_entity::EntityList<Value>;

/// Memory pool holding value lists. See `ValueList`.
pub type ValueListPool = cranelift_entity::ListPool<Value>;

/// Phi instructions carry a block list parallel to their value list.
pub type BlockList = cranelift_entity::EntityList<Block>;

/// Memory pool holding phi block lists. See `BlockList`.
pub type BlockListPool = cranelift_entity::ListPool<Block>;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Opcode {
    // Constants.
    Fconst,
    Iconst,
    Bconst,
    Nullptr,
    // Float arithmetic.
    Fadd,
    Fsub,
    Fmul,
    Fdiv,
    Fneg,
    // Float math. These are opcodes rather than calls so the adjoint
    // table can be a closed match.
    Sqrt,
    Sin,
    Cos,
    Exp,
    Exp2,
    Log,
    Log2,
    Log10,
    Fabs,
    Floor,
    Ceil,
    Ftrunc,
    Round,
    Pow,
    Fmin,
    Fmax,
    // Integer arithmetic.
    Iadd,
    Isub,
    Imul,
    Ishl,
    Lshr,
    Band,
    Bor,
    Bxor,
    // Compares.
    Ieq,
    Ilt,
    Feq,
    Flt,
    Fle,
    // Casts.
    Bitcast,
    Fpext,
    Fptrunc,
    Zext,
    Itrunc,
    Sitofp,
    Fptosi,
    Ptrtoint,
    Inttoptr,
    // Select and lane operations.
    Select,
    Splat,
    Extract,
    Insert,
    Shuffle,
    // Memory.
    Load,
    Store,
    Gep,
    GlobalAddr,
    StackLoad,
    StackStore,
    Memcpy,
    Memmove,
    Memset,
    LifetimeStart,
    LifetimeEnd,
    // Calls and control flow.
    Call,
    Jmp,
    Br,
    Ret,
    Unreachable,
    // SSA.
    Phi,
}

impl Opcode {
    pub const fn name(self) -> &'static str {
        match self {
            Opcode::Fconst => "fconst",
            Opcode::Iconst => "iconst",
            Opcode::Bconst => "bconst",
            Opcode::Nullptr => "nullptr",
            Opcode::Fadd => "fadd",
            Opcode::Fsub => "fsub",
            Opcode::Fmul => "fmul",
            Opcode::Fdiv => "fdiv",
            Opcode::Fneg => "fneg",
            Opcode::Sqrt => "sqrt",
            Opcode::Sin => "sin",
            Opcode::Cos => "cos",
            Opcode::Exp => "exp",
            Opcode::Exp2 => "exp2",
            Opcode::Log => "log",
            Opcode::Log2 => "log2",
            Opcode::Log10 => "log10",
            Opcode::Fabs => "fabs",
            Opcode::Floor => "floor",
            Opcode::Ceil => "ceil",
            Opcode::Ftrunc => "ftrunc",
            Opcode::Round => "round",
            Opcode::Pow => "pow",
            Opcode::Fmin => "fmin",
            Opcode::Fmax => "fmax",
            Opcode::Iadd => "iadd",
            Opcode::Isub => "isub",
            Opcode::Imul => "imul",
            Opcode::Ishl => "ishl",
            Opcode::Lshr => "lshr",
            Opcode::Band => "band",
            Opcode::Bor => "bor",
            Opcode::Bxor => "bxor",
            Opcode::Ieq => "ieq",
            Opcode::Ilt => "ilt",
            Opcode::Feq => "feq",
            Opcode::Flt => "flt",
            Opcode::Fle => "fle",
            Opcode::Bitcast => "bitcast",
            Opcode::Fpext => "fpext",
            Opcode::Fptrunc => "fptrunc",
            Opcode::Zext => "zext",
            Opcode::Itrunc => "itrunc",
            Opcode::Sitofp => "sitofp",
            Opcode::Fptosi => "fptosi",
            Opcode::Ptrtoint => "ptrtoint",
            Opcode::Inttoptr => "inttoptr",
            Opcode::Select => "select",
            Opcode::Splat => "splat",
            Opcode::Extract => "extract",
            Opcode::Insert => "insert",
            Opcode::Shuffle => "shuffle",
            Opcode::Load => "load",
            Opcode::Store => "store",
            Opcode::Gep => "gep",
            Opcode::GlobalAddr => "global_addr",
            Opcode::StackLoad => "stack_load",
            Opcode::StackStore => "stack_store",
            Opcode::Memcpy => "memcpy",
            Opcode::Memmove => "memmove",
            Opcode::Memset => "memset",
            Opcode::LifetimeStart => "lifetime_start",
            Opcode::LifetimeEnd => "lifetime_end",
            Opcode::Call => "call",
            Opcode::Jmp => "jmp",
            Opcode::Br => "br",
            Opcode::Ret => "ret",
            Opcode::Unreachable => "unreachable",
            Opcode::Phi => "phi",
        }
    }

    pub fn from_name(name: &str) -> Option<Opcode> {
        let op = match name {
            "fconst" => Opcode::Fconst,
            "iconst" => Opcode::Iconst,
            "bconst" => Opcode::Bconst,
            "nullptr" => Opcode::Nullptr,
            "fadd" => Opcode::Fadd,
            "fsub" => Opcode::Fsub,
            "fmul" => Opcode::Fmul,
            "fdiv" => Opcode::Fdiv,
            "fneg" => Opcode::Fneg,
            "sqrt" => Opcode::Sqrt,
            "sin" => Opcode::Sin,
            "cos" => Opcode::Cos,
            "exp" => Opcode::Exp,
            "exp2" => Opcode::Exp2,
            "log" => Opcode::Log,
            "log2" => Opcode::Log2,
            "log10" => Opcode::Log10,
            "fabs" => Opcode::Fabs,
            "floor" => Opcode::Floor,
            "ceil" => Opcode::Ceil,
            "ftrunc" => Opcode::Ftrunc,
            "round" => Opcode::Round,
            "pow" => Opcode::Pow,
            "fmin" => Opcode::Fmin,
            "fmax" => Opcode::Fmax,
            "iadd" => Opcode::Iadd,
            "isub" => Opcode::Isub,
            "imul" => Opcode::Imul,
            "ishl" => Opcode::Ishl,
            "lshr" => Opcode::Lshr,
            "band" => Opcode::Band,
            "bor" => Opcode::Bor,
            "bxor" => Opcode::Bxor,
            "ieq" => Opcode::Ieq,
            "ilt" => Opcode::Ilt,
            "feq" => Opcode::Feq,
            "flt" => Opcode::Flt,
            "fle" => Opcode::Fle,
            "bitcast" => Opcode::Bitcast,
            "fpext" => Opcode::Fpext,
            "fptrunc" => Opcode::Fptrunc,
            "zext" => Opcode::Zext,
            "itrunc" => Opcode::Itrunc,
            "sitofp" => Opcode::Sitofp,
            "fptosi" => Opcode::Fptosi,
            "ptrtoint" => Opcode::Ptrtoint,
            "inttoptr" => Opcode::Inttoptr,
            "select" => Opcode::Select,
            "splat" => Opcode::Splat,
            "extract" => Opcode::Extract,
            "insert" => Opcode::Insert,
            "shuffle" => Opcode::Shuffle,
            "load" => Opcode::Load,
            "store" => Opcode::Store,
            "gep" => Opcode::Gep,
            "global_addr" => Opcode::GlobalAddr,
            "stack_load" => Opcode::StackLoad,
            "stack_store" => Opcode::StackStore,
            "memcpy" => Opcode::Memcpy,
            "memmove" => Opcode::Memmove,
            "memset" => Opcode::Memset,
            "lifetime_start" => Opcode::LifetimeStart,
            "lifetime_end" => Opcode::LifetimeEnd,
            "call" => Opcode::Call,
            "jmp" => Opcode::Jmp,
            "br" => Opcode::Br,
            "ret" => Opcode::Ret,
            "unreachable" => Opcode::Unreachable,
            "phi" => Opcode::Phi,
            _ => return None,
        };
        Some(op)
    }

    #[inline]
    pub fn is_terminator(self) -> bool {
        matches!(self, Opcode::Jmp | Opcode::Br | Opcode::Ret | Opcode::Unreachable)
    }

    #[inline]
    pub fn is_branch(self) -> bool {
        matches!(self, Opcode::Jmp | Opcode::Br)
    }

    #[inline]
    pub fn is_call(self) -> bool {
        matches!(self, Opcode::Call)
    }

    #[inline]
    pub fn is_cast(self) -> bool {
        matches!(
            self,
            Opcode::Bitcast
                | Opcode::Fpext
                | Opcode::Fptrunc
                | Opcode::Zext
                | Opcode::Itrunc
                | Opcode::Sitofp
                | Opcode::Fptosi
                | Opcode::Ptrtoint
                | Opcode::Inttoptr
        )
    }

    /// Opcodes without side effects; instructions whose results are dead
    /// can be removed, and whose computation can be repeated freely.
    /// Loads are pure in this sense only when the cacheability analysis
    /// says so, which is the caller's job to check.
    #[inline]
    pub fn is_pure(self) -> bool {
        !matches!(
            self,
            Opcode::Store
                | Opcode::StackLoad
                | Opcode::StackStore
                | Opcode::Memcpy
                | Opcode::Memmove
                | Opcode::Memset
                | Opcode::LifetimeStart
                | Opcode::LifetimeEnd
                | Opcode::Call
                | Opcode::Jmp
                | Opcode::Br
                | Opcode::Ret
                | Opcode::Unreachable
                | Opcode::Load
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The per-instruction payload.
///
/// The opcode is carried inline for polymorphic formats (`Unary`,
/// `Binary`, ...) and implied by the variant for the rest.
#[derive(Clone, Copy, Debug)]
pub enum InstructionData {
    /// `fneg`, the unary float math ops, `lifetime_start/end`.
    Unary { op: Opcode, arg: Value },
    /// Casts, `load` and `splat`: a value plus a controlling type.
    UnaryTy { op: Opcode, arg: Value, ty: Type },
    /// Binary arithmetic, compares, and `store [value, ptr]`.
    Binary { op: Opcode, args: [Value; 2] },
    /// `select [cond, then, else]`, `memcpy/memmove [dst, src, len]`,
    /// `memset [dst, byte, len]`.
    Ternary { op: Opcode, args: [Value; 3] },
    /// `gep [base, index]`, scaled by the size of `elem_ty`.
    Gep { args: [Value; 2], elem_ty: Type },
    /// `extract arg, lane`.
    Extract { arg: Value, lane: u8 },
    /// `insert [agg, elem], lane`.
    Insert { args: [Value; 2], lane: u8 },
    /// `shuffle [a, b]` with up to four lane selectors packed a byte each,
    /// `0xff` meaning undefined.
    Shuffle { args: [Value; 2], mask: u32 },
    /// `fconst`.
    UnaryIeee64 { imm: Ieee64, ty: Type },
    /// `iconst`.
    UnaryInt { imm: i64, ty: Type },
    /// `bconst`.
    UnaryBool { imm: bool },
    /// `nullptr` and `unreachable`.
    Nullary { op: Opcode },
    /// `global_addr`.
    UnaryGlobal { global: GlobalRef },
    /// `stack_load`.
    StackLoad { slot: StackSlot },
    /// `stack_store arg -> slot`.
    StackStore { slot: StackSlot, arg: Value },
    /// `call fnN(args...)`.
    Call { func_ref: FuncRef, args: ValueList },
    /// `jmp block`.
    Jump { destination: Block },
    /// `br cond, then_block, else_block`.
    Branch { arg: Value, then_dest: Block, else_dest: Block },
    /// `ret args...`.
    Ret { args: ValueList },
    /// `phi ty [v, block]...`; `blocks` is parallel to `args`.
    PhiNode { args: ValueList, blocks: BlockList, ty: Type },
}

impl InstructionData {
    pub fn opcode(&self) -> Opcode {
        match *self {
            InstructionData::Unary { op, .. }
            | InstructionData::UnaryTy { op, .. }
            | InstructionData::Binary { op, .. }
            | InstructionData::Ternary { op, .. }
            | InstructionData::Nullary { op } => op,
            InstructionData::Gep { .. } => Opcode::Gep,
            InstructionData::Extract { .. } => Opcode::Extract,
            InstructionData::Insert { .. } => Opcode::Insert,
            InstructionData::Shuffle { .. } => Opcode::Shuffle,
            InstructionData::UnaryIeee64 { .. } => Opcode::Fconst,
            InstructionData::UnaryInt { .. } => Opcode::Iconst,
            InstructionData::UnaryBool { .. } => Opcode::Bconst,
            InstructionData::UnaryGlobal { .. } => Opcode::GlobalAddr,
            InstructionData::StackLoad { .. } => Opcode::StackLoad,
            InstructionData::StackStore { .. } => Opcode::StackStore,
            InstructionData::Call { .. } => Opcode::Call,
            InstructionData::Jump { .. } => Opcode::Jmp,
            InstructionData::Branch { .. } => Opcode::Br,
            InstructionData::Ret { .. } => Opcode::Ret,
            InstructionData::PhiNode { .. } => Opcode::Phi,
        }
    }

    /// All value arguments of this instruction, as a slice.
    pub fn arguments<'a>(&'a self, pool: &'a ValueListPool) -> &'a [Value] {
        match self {
            InstructionData::Unary { arg, .. }
            | InstructionData::UnaryTy { arg, .. }
            | InstructionData::Extract { arg, .. }
            | InstructionData::StackStore { arg, .. }
            | InstructionData::Branch { arg, .. } => core::slice::from_ref(arg),
            InstructionData::Binary { args, .. }
            | InstructionData::Gep { args, .. }
            | InstructionData::Insert { args, .. }
            | InstructionData::Shuffle { args, .. } => args,
            InstructionData::Ternary { args, .. } => args,
            InstructionData::Call { args, .. }
            | InstructionData::Ret { args }
            | InstructionData::PhiNode { args, .. } => args.as_slice(pool),
            InstructionData::UnaryIeee64 { .. }
            | InstructionData::UnaryInt { .. }
            | InstructionData::UnaryBool { .. }
            | InstructionData::Nullary { .. }
            | InstructionData::UnaryGlobal { .. }
            | InstructionData::StackLoad { .. }
            | InstructionData::Jump { .. } => &[],
        }
    }

    /// All value arguments of this instruction, as a mutable slice.
    pub fn arguments_mut<'a>(&'a mut self, pool: &'a mut ValueListPool) -> &'a mut [Value] {
        match self {
            InstructionData::Unary { arg, .. }
            | InstructionData::UnaryTy { arg, .. }
            | InstructionData::Extract { arg, .. }
            | InstructionData::StackStore { arg, .. }
            | InstructionData::Branch { arg, .. } => core::slice::from_mut(arg),
            InstructionData::Binary { args, .. }
            | InstructionData::Gep { args, .. }
            | InstructionData::Insert { args, .. }
            | InstructionData::Shuffle { args, .. } => args,
            InstructionData::Ternary { args, .. } => args,
            InstructionData::Call { args, .. }
            | InstructionData::Ret { args }
            | InstructionData::PhiNode { args, .. } => args.as_mut_slice(pool),
            InstructionData::UnaryIeee64 { .. }
            | InstructionData::UnaryInt { .. }
            | InstructionData::UnaryBool { .. }
            | InstructionData::Nullary { .. }
            | InstructionData::UnaryGlobal { .. }
            | InstructionData::StackLoad { .. }
            | InstructionData::Jump { .. } => &mut [],
        }
    }

    /// Return information about a call instruction.
    pub fn analyze_call<'a>(&'a self, pool: &'a ValueListPool) -> Option<(FuncRef, &'a [Value])> {
        match *self {
            InstructionData::Call { func_ref, ref args } => Some((func_ref, args.as_slice(pool))),
            _ => None,
        }
    }

}

/// Destination pair of a two-way branch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BranchInfo {
    NotABranch,
    Jump(Block),
    Cond { cond: Value, then_dest: Block, else_dest: Block },
}

impl InstructionData {
    pub fn analyze_branch(&self) -> BranchInfo {
        match *self {
            InstructionData::Jump { destination } => BranchInfo::Jump(destination),
            InstructionData::Branch { arg, then_dest, else_dest } => {
                BranchInfo::Cond { cond: arg, then_dest, else_dest }
            }
            _ => BranchInfo::NotABranch,
        }
    }
}
