//! The may-alias / mod-ref oracle.
//!
//! Field-insensitive disambiguation over *underlying objects*: a pointer
//! is peeled through geps, pointer casts and selects down to the value
//! that produced it. Two accesses interfere unless their underlying
//! objects are provably distinct (different allocations, allocation vs.
//! argument, distinct globals). The peel depth is capped at 100; deeper
//! chains are conservatively opaque.

use ahash::AHashMap;
use lir::{Function, Inst, InstructionData, Opcode, Value, ValueDef};

use crate::{classify_callee, KnownCallee};

const MAX_PEEL_DEPTH: usize = 100;

/// Where an underlying object comes from. The cacheability analyzer's
/// classification table is keyed on this.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjOrigin {
    /// The `idx`th function argument.
    Arg(usize),
    /// Result of a known allocation call.
    Alloc(Inst),
    /// Result of some other call.
    OtherCall(Inst),
    /// Loaded out of memory.
    LoadedFrom(Inst),
    /// Address of a global.
    Global(lir::GlobalRef),
    /// Null, or something the analysis cannot see through.
    Opaque,
}

/// A memory location named by the pointer value addressing it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemLoc {
    pub ptr: Value,
}

impl MemLoc {
    pub fn new(ptr: Value) -> MemLoc {
        MemLoc { ptr }
    }

    /// The location a call may access through its `idx`th argument.
    pub fn for_call_arg(func: &Function, call: Inst, idx: usize) -> MemLoc {
        MemLoc { ptr: func.dfg.inst_args(call)[idx] }
    }
}

pub struct AliasInfo {
    underlying: AHashMap<Value, Value>,
}

impl AliasInfo {
    pub fn analyze(func: &Function) -> AliasInfo {
        let mut info = AliasInfo { underlying: AHashMap::new() };
        // Memoize eagerly so queries during the transform are cheap.
        for block in func.layout.blocks() {
            for inst in func.layout.block_insts(block) {
                for arg in func.dfg.inst_args(inst) {
                    if func.dfg.value_ty(*arg).is_ptr() {
                        info.underlying_object(func, *arg);
                    }
                }
            }
        }
        info
    }

    /// Peel casts, geps and selects off `ptr` to a fixed depth.
    pub fn underlying_object(&mut self, func: &Function, ptr: Value) -> Value {
        if let Some(obj) = self.underlying.get(&ptr) {
            return *obj;
        }
        let mut cur = ptr;
        for _ in 0..MAX_PEEL_DEPTH {
            let inst = match func.dfg.value_def(cur) {
                ValueDef::Result(inst, _) => inst,
                ValueDef::Param(..) => break,
            };
            let next = match func.dfg[inst] {
                InstructionData::Gep { args, .. } => args[0],
                InstructionData::UnaryTy { op: Opcode::Bitcast | Opcode::Inttoptr, arg, .. } => {
                    arg
                }
                InstructionData::Ternary { op: Opcode::Select, args } => {
                    // Only see through a select whose arms agree.
                    let lhs = self.underlying_object(func, args[1]);
                    let rhs = self.underlying_object(func, args[2]);
                    if lhs == rhs {
                        lhs
                    } else {
                        break;
                    }
                }
                _ => break,
            };
            cur = next;
        }
        self.underlying.insert(ptr, cur);
        cur
    }

    /// Classify the underlying object of `ptr`.
    pub fn classify(&mut self, func: &Function, ptr: Value) -> ObjOrigin {
        let obj = self.underlying_object(func, ptr);
        match func.dfg.value_def(obj) {
            ValueDef::Param(block, idx) => {
                if Some(block) == func.layout.entry_block() {
                    ObjOrigin::Arg(idx)
                } else {
                    ObjOrigin::Opaque
                }
            }
            ValueDef::Result(inst, _) => match func.dfg[inst] {
                InstructionData::Call { .. } => {
                    let sig = func.dfg.call_signature(inst).expect("call without signature");
                    if classify_callee(&sig.name) == KnownCallee::Alloc {
                        ObjOrigin::Alloc(inst)
                    } else {
                        ObjOrigin::OtherCall(inst)
                    }
                }
                InstructionData::UnaryTy { op: Opcode::Load, .. } => ObjOrigin::LoadedFrom(inst),
                InstructionData::UnaryGlobal { global } => ObjOrigin::Global(global),
                _ => ObjOrigin::Opaque,
            },
        }
    }

    /// May the two pointers address overlapping memory?
    pub fn may_alias(&mut self, func: &Function, a: Value, b: Value) -> bool {
        let obj_a = self.underlying_object(func, a);
        let obj_b = self.underlying_object(func, b);
        if obj_a == obj_b {
            return true;
        }
        let origin_a = self.classify(func, obj_a);
        let origin_b = self.classify(func, obj_b);
        use ObjOrigin::*;
        match (origin_a, origin_b) {
            // Two distinct allocations never overlap, and an allocation
            // local to this function cannot be reached through an
            // argument or a global.
            (Alloc(a), Alloc(b)) => a == b,
            (Alloc(_), Arg(_) | Global(_)) | (Arg(_) | Global(_), Alloc(_)) => false,
            (Global(a), Global(b)) => a == b,
            // Distinct arguments may still be aliases of each other.
            _ => true,
        }
    }

    /// May executing `inst` write the memory at `loc`?
    ///
    /// Stack slots are invisible here: they are fresh per function and
    /// never alias IR-level pointers.
    pub fn may_modify(&mut self, func: &Function, inst: Inst, loc: MemLoc) -> bool {
        match func.dfg[inst] {
            InstructionData::Binary { op: Opcode::Store, args } => {
                self.may_alias(func, args[1], loc.ptr)
            }
            InstructionData::Ternary { op: Opcode::Memcpy | Opcode::Memmove | Opcode::Memset, args } => {
                self.may_alias(func, args[0], loc.ptr)
            }
            InstructionData::Call { .. } => {
                let sig = func.dfg.call_signature(inst).expect("call without signature");
                match classify_callee(&sig.name) {
                    // Allocation and free calls do not write caller-visible
                    // memory the analyses care about.
                    KnownCallee::Alloc | KnownCallee::Dealloc => false,
                    KnownCallee::PassThrough => false,
                    KnownCallee::Generic => sig.effects.may_write(),
                }
            }
            _ => false,
        }
    }
}
