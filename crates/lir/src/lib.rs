//! A typed SSA intermediate representation in the style of cranelift's IR:
//! entity references into primary maps instead of pointers, a data flow
//! graph holding definitions, and a separate layout for program order.
//!
//! Unlike cranelift the instruction set is deliberately small and fixed
//! (closed opcode set), values carry their type, merges are explicit `phi`
//! instructions, and functions support multi-value returns. Stack slots
//! are zero-initialized on entry.

use std::fmt;

mod dfg;
mod dominators;
mod entities;
mod flowgraph;
mod immediates;
mod instructions;
mod layout;
mod module;
mod types;
mod verify;

pub mod cursor;
pub mod write;

use cranelift_entity::SecondaryMap;

pub use crate::dfg::{compute_uses, DataFlowGraph, StackSlotData, Use, ValueDef};
pub use crate::dominators::DominatorTree;
pub use crate::entities::{Block, FuncId, FuncRef, GlobalRef, Inst, StackSlot, Value};
pub use crate::flowgraph::{BlockPredecessor, ControlFlowGraph};
pub use crate::immediates::Ieee64;
pub use crate::instructions::{
    BlockList, BlockListPool, BranchInfo, InstructionData, Opcode, ValueList, ValueListPool,
};
pub use crate::layout::Layout;
pub use crate::module::{GlobalData, Module};
pub use crate::types::Type;
pub use crate::verify::{verify_function, VerifierError};

/// Function-level memory effects, mirroring the usual `readnone` /
/// `readonly` callee attributes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum MemEffects {
    #[default]
    ReadWrite,
    ReadOnly,
    ReadNone,
}

impl MemEffects {
    pub fn may_read(self) -> bool {
        self != MemEffects::ReadNone
    }

    pub fn may_write(self) -> bool {
        self == MemEffects::ReadWrite
    }
}

/// A function parameter: its type plus the attribute surface the
/// call-site transformer consults.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AbiParam {
    pub ty: Type,
    pub readonly: bool,
    pub readnone: bool,
    pub nocapture: bool,
}

impl AbiParam {
    pub fn new(ty: Type) -> AbiParam {
        AbiParam { ty, readonly: false, readnone: false, nocapture: false }
    }
}

impl From<Type> for AbiParam {
    fn from(ty: Type) -> AbiParam {
        AbiParam::new(ty)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct FunctionSignature {
    pub name: String,
    pub params: Vec<AbiParam>,
    pub returns: Vec<Type>,
    pub effects: MemEffects,
}

impl FunctionSignature {
    pub fn new(name: impl Into<String>, params: Vec<AbiParam>, returns: Vec<Type>) -> Self {
        FunctionSignature { name: name.into(), params, returns, effects: MemEffects::ReadWrite }
    }

    pub fn param_tys(&self) -> impl Iterator<Item = Type> + '_ {
        self.params.iter().map(|param| param.ty)
    }
}

impl fmt::Display for FunctionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}(", self.name)?;
        for (i, param) in self.params.iter().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", param.ty)?;
            if param.readnone {
                write!(f, " readnone")?;
            }
            if param.readonly {
                write!(f, " readonly")?;
            }
            if param.nocapture {
                write!(f, " nocapture")?;
            }
        }
        write!(f, ")")?;
        if let Some((first, rest)) = self.returns.split_first() {
            write!(f, " -> {}", first)?;
            for ty in rest {
                write!(f, ", {}", ty)?;
            }
        }
        match self.effects {
            MemEffects::ReadWrite => {}
            MemEffects::ReadOnly => write!(f, " readonly")?,
            MemEffects::ReadNone => write!(f, " readnone")?,
        }
        Ok(())
    }
}

/// Per-value and per-instruction tags new instructions are annotated
/// with: the activity of the value they compute and whether a tape read
/// must survive later optimization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ActivityTag {
    #[default]
    Unset,
    Const,
    Active,
}

#[derive(Clone, Default)]
pub struct FuncTags {
    pub activity_value: SecondaryMap<Value, ActivityTag>,
    pub activity_inst: SecondaryMap<Inst, ActivityTag>,
    pub mustcache: SecondaryMap<Inst, bool>,
}

/// Functions can be cloned cheaply enough for the transform's working
/// copies; the clone keeps all entity numbers of the original.
#[derive(Clone, Default)]
pub struct Function {
    pub sig: FunctionSignature,

    /// Primary definitions of all instructions, blocks and values.
    pub dfg: DataFlowGraph,

    /// Layout of blocks and instructions in the function body.
    pub layout: Layout,

    /// Metadata side tables.
    pub tags: FuncTags,
}

impl Function {
    pub fn new() -> Function {
        Function::default()
    }

    pub fn with_signature(sig: FunctionSignature) -> Function {
        Function { sig, ..Function::default() }
    }

    pub fn name(&self) -> &str {
        &self.sig.name
    }

    /// Declare an external function callable from this function.
    pub fn import_signature(&mut self, sig: FunctionSignature) -> FuncRef {
        self.dfg.signatures.push(sig)
    }

    /// Find an already imported signature by callee name.
    pub fn find_import(&self, name: &str) -> Option<FuncRef> {
        self.dfg
            .signatures
            .iter()
            .find(|(_, sig)| sig.name == name)
            .map(|(func_ref, _)| func_ref)
    }

    pub fn create_stack_slot(&mut self, ty: Type) -> StackSlot {
        self.dfg.stack_slots.push(StackSlotData { ty })
    }

    /// Create the entry block with one parameter per signature parameter.
    pub fn create_entry_block(&mut self) -> Block {
        debug_assert!(self.layout.entry_block().is_none());
        let block = self.dfg.make_block();
        self.layout.append_block(block);
        for ty in self.sig.param_tys().collect::<Vec<_>>() {
            self.dfg.append_block_param(block, ty);
        }
        block
    }

    /// The values of the function parameters (entry block parameters).
    pub fn params(&self) -> &[Value] {
        match self.layout.entry_block() {
            Some(entry) => self.dfg.block_params(entry),
            None => &[],
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write::write_function(f, self)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write::write_function(f, self)
    }
}
