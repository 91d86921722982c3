use std::fmt;
use std::ops::{Index, IndexMut};

use cranelift_entity::{PrimaryMap, SecondaryMap};

use crate::entities::{Block, FuncRef, Inst, StackSlot, Value};
use crate::instructions::{BlockListPool, InstructionData, Opcode, ValueList, ValueListPool};
use crate::types::Type;
use crate::{Function, FunctionSignature};

/// A typed stack slot. Slots are zero-initialized on function entry; the
/// differential accumulators of the gradient pass rely on this.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackSlotData {
    pub ty: Type,
}

/// A data flow graph defines all instructions, basic blocks and values of
/// a function and the dependencies between them. The order of blocks and
/// instructions is tracked separately by the `Layout`.
#[derive(Clone)]
pub struct DataFlowGraph {
    /// Data about all of the instructions in the function, including
    /// opcodes and operands. Not in program order; that is the `Layout`'s
    /// job.
    insts: PrimaryMap<Inst, InstructionData>,

    /// Basic blocks and their parameters. Only the entry block carries
    /// parameters (the function parameters); all other merges are phis.
    blocks: PrimaryMap<Block, BlockData>,

    /// Memory pool of value lists used by calls, returns and phis.
    pub value_lists: ValueListPool,

    /// Memory pool of the block lists carried by phis.
    pub block_lists: BlockListPool,

    /// Signatures of external functions referenced by `call` instructions.
    pub signatures: PrimaryMap<FuncRef, FunctionSignature>,

    /// Typed, zero-initialized stack slots.
    pub stack_slots: PrimaryMap<StackSlot, StackSlotData>,

    /// Primary value table.
    values: PrimaryMap<Value, ValueData>,

    /// Result values of each instruction.
    results: SecondaryMap<Inst, ValueList>,
}

impl Default for DataFlowGraph {
    fn default() -> Self {
        DataFlowGraph {
            insts: PrimaryMap::new(),
            blocks: PrimaryMap::new(),
            value_lists: ValueListPool::new(),
            block_lists: BlockListPool::new(),
            signatures: PrimaryMap::new(),
            stack_slots: PrimaryMap::new(),
            values: PrimaryMap::new(),
            results: SecondaryMap::new(),
        }
    }
}

#[derive(Clone)]
struct BlockData {
    params: ValueList,
}

#[derive(Clone, Debug)]
enum ValueData {
    /// Value is the `num`th result of `inst`.
    Inst { ty: Type, num: u16, inst: Inst },
    /// Value is the `num`th parameter of `block`.
    Param { ty: Type, num: u16, block: Block },
    /// Placeholder for a value that has been referenced but not yet
    /// defined. Only the reader creates these; the verifier rejects any
    /// that survive.
    Detached { ty: Type },
}

/// Where a value comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueDef {
    /// Value is the n'th result of an instruction.
    Result(Inst, usize),
    /// Value is the n'th parameter of a block.
    Param(Block, usize),
}

impl ValueDef {
    pub fn inst(&self) -> Option<Inst> {
        match *self {
            ValueDef::Result(inst, _) => Some(inst),
            ValueDef::Param(..) => None,
        }
    }

    pub fn unwrap_inst(&self) -> Inst {
        self.inst().expect("value is not an instruction result")
    }
}

impl DataFlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_insts(&self) -> usize {
        self.insts.len()
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    pub fn inst_is_valid(&self, inst: Inst) -> bool {
        self.insts.is_valid(inst)
    }
}

/// Values.
impl DataFlowGraph {
    fn make_value(&mut self, data: ValueData) -> Value {
        self.values.push(data)
    }

    /// Create a placeholder for a forward reference. The reader resolves
    /// these by attaching them as instruction results later.
    pub fn make_detached_value(&mut self, ty: Type) -> Value {
        self.make_value(ValueData::Detached { ty })
    }

    pub fn value_is_valid(&self, v: Value) -> bool {
        self.values.is_valid(v)
    }

    /// Is this value attached to an instruction result or block parameter?
    pub fn value_is_defined(&self, v: Value) -> bool {
        !matches!(self.values[v], ValueData::Detached { .. })
    }

    pub fn value_ty(&self, v: Value) -> Type {
        match self.values[v] {
            ValueData::Inst { ty, .. }
            | ValueData::Param { ty, .. }
            | ValueData::Detached { ty } => ty,
        }
    }

    pub fn value_def(&self, v: Value) -> ValueDef {
        match self.values[v] {
            ValueData::Inst { inst, num, .. } => ValueDef::Result(inst, num as usize),
            ValueData::Param { block, num, .. } => ValueDef::Param(block, num as usize),
            ValueData::Detached { .. } => panic!("use of undefined value {}", v),
        }
    }

    /// Rewrite every use of `old` to `new` by scanning all instructions.
    pub fn replace_uses(&mut self, old: Value, new: Value) {
        debug_assert_ne!(old, new);
        let insts: Vec<Inst> = self.insts.keys().collect();
        for inst in insts {
            let mut data = self.insts[inst];
            for arg in data.arguments_mut(&mut self.value_lists) {
                if *arg == old {
                    *arg = new;
                }
            }
            self.insts[inst] = data;
        }
    }
}

/// Instructions.
impl DataFlowGraph {
    pub fn make_inst(&mut self, data: InstructionData) -> Inst {
        let n = self.num_insts() + 1;
        self.results.resize(n);
        self.insts.push(data)
    }

    /// Overwrite the data of an existing instruction, keeping its results.
    pub fn update_inst(&mut self, inst: Inst, data: InstructionData) {
        self.insts[inst] = data;
    }

    pub fn inst_args<'a>(&'a self, inst: Inst) -> &'a [Value] {
        self.insts[inst].arguments(&self.value_lists)
    }

    pub fn inst_args_mut<'a>(&'a mut self, inst: Inst) -> &'a mut [Value] {
        let data = &mut self.insts[inst];
        data.arguments_mut(&mut self.value_lists)
    }

    pub fn call_signature(&self, inst: Inst) -> Option<&FunctionSignature> {
        let (func_ref, _) = self.insts[inst].analyze_call(&self.value_lists)?;
        Some(&self.signatures[func_ref])
    }

    /// The result types implied by an instruction's payload. Operand types
    /// must already be known, so operands of non-phi instructions may not
    /// be forward references.
    pub fn result_tys(&self, inst: Inst) -> Vec<Type> {
        use InstructionData::*;
        let data = &self.insts[inst];
        let op = data.opcode();
        match *data {
            Unary { op, arg } => match op {
                Opcode::LifetimeStart | Opcode::LifetimeEnd => vec![],
                _ => vec![self.value_ty(arg)],
            },
            UnaryTy { ty, .. } => vec![ty],
            Binary { op, args } => match op {
                Opcode::Store => vec![],
                Opcode::Ieq | Opcode::Ilt | Opcode::Feq | Opcode::Flt | Opcode::Fle => {
                    vec![Type::I1]
                }
                _ => vec![self.value_ty(args[0])],
            },
            Ternary { op, args } => match op {
                Opcode::Select => vec![self.value_ty(args[1])],
                _ => vec![],
            },
            Gep { .. } => vec![Type::Ptr],
            Extract { arg, .. } => vec![self.value_ty(arg).lane_ty()],
            Insert { args, .. } | Shuffle { args, .. } => vec![self.value_ty(args[0])],
            UnaryIeee64 { ty, .. } | UnaryInt { ty, .. } => vec![ty],
            UnaryBool { .. } => vec![Type::I1],
            Nullary { .. } => match op {
                Opcode::Nullptr => vec![Type::Ptr],
                _ => vec![],
            },
            UnaryGlobal { .. } => vec![Type::Ptr],
            StackLoad { slot } => vec![self.stack_slots[slot].ty],
            StackStore { .. } => vec![],
            Call { func_ref, .. } => self.signatures[func_ref].returns.clone(),
            Jump { .. } | Branch { .. } | Ret { .. } => vec![],
            PhiNode { ty, .. } => vec![ty],
        }
    }

    /// Create result values for `inst`.
    pub fn make_inst_results(&mut self, inst: Inst) -> usize {
        self.make_inst_results_reusing(inst, std::iter::empty())
    }

    /// Create result values for `inst`, reusing the provided detached
    /// values where `reuse` produces one.
    pub fn make_inst_results_reusing<I>(&mut self, inst: Inst, reuse: I) -> usize
    where
        I: Iterator<Item = Option<Value>>,
    {
        let mut reuse = reuse.fuse();
        self.results[inst].clear(&mut self.value_lists);
        let tys = self.result_tys(inst);
        for ty in &tys {
            if let Some(Some(v)) = reuse.next() {
                self.attach_result(inst, v, *ty);
            } else {
                self.append_result(inst, *ty);
            }
        }
        tys.len()
    }

    /// Append a new result value to `inst`.
    pub fn append_result(&mut self, inst: Inst, ty: Type) -> Value {
        let res = self.values.next_key();
        let num = self.results[inst].push(res, &mut self.value_lists);
        debug_assert!(num <= u16::MAX as usize, "too many result values");
        self.make_value(ValueData::Inst { ty, inst, num: num as u16 })
    }

    /// Attach an existing (detached) value as a result of `inst`.
    pub fn attach_result(&mut self, inst: Inst, res: Value, ty: Type) {
        debug_assert!(!self.value_is_defined(res), "{} already defined", res);
        let num = self.results[inst].push(res, &mut self.value_lists);
        debug_assert!(num <= u16::MAX as usize, "too many result values");
        self.values[res] = ValueData::Inst { ty, inst, num: num as u16 };
    }

    pub fn clear_results(&mut self, inst: Inst) {
        self.results[inst].clear(&mut self.value_lists)
    }

    pub fn first_result(&self, inst: Inst) -> Value {
        self.results[inst].first(&self.value_lists).expect("instruction has no results")
    }

    pub fn has_results(&self, inst: Inst) -> bool {
        !self.results[inst].is_empty()
    }

    pub fn inst_results(&self, inst: Inst) -> &[Value] {
        self.results[inst].as_slice(&self.value_lists)
    }

    pub fn display_inst(&self, inst: Inst) -> DisplayInst<'_> {
        DisplayInst(self, inst)
    }
}

/// Basic blocks.
impl DataFlowGraph {
    pub fn make_block(&mut self) -> Block {
        self.blocks.push(BlockData { params: ValueList::new() })
    }

    pub fn block_is_valid(&self, block: Block) -> bool {
        self.blocks.is_valid(block)
    }

    pub fn num_block_params(&self, block: Block) -> usize {
        self.blocks[block].params.len(&self.value_lists)
    }

    pub fn block_params(&self, block: Block) -> &[Value] {
        self.blocks[block].params.as_slice(&self.value_lists)
    }

    pub fn append_block_param(&mut self, block: Block, ty: Type) -> Value {
        let param = self.values.next_key();
        let num = self.blocks[block].params.push(param, &mut self.value_lists);
        debug_assert!(num <= u16::MAX as usize, "too many parameters on block");
        self.make_value(ValueData::Param { ty, block, num: num as u16 })
    }

    /// Attach an existing (detached) value as a block parameter; reader
    /// use only.
    pub fn attach_block_param(&mut self, block: Block, param: Value, ty: Type) {
        debug_assert!(!self.value_is_defined(param));
        let num = self.blocks[block].params.push(param, &mut self.value_lists);
        debug_assert!(num <= u16::MAX as usize, "too many parameters on block");
        self.values[param] = ValueData::Param { ty, block, num: num as u16 };
    }
}

/// Phis.
impl DataFlowGraph {
    /// Build the payload of a phi instruction from its edges.
    pub fn make_phi_data(&mut self, ty: Type, edges: &[(Block, Value)]) -> InstructionData {
        let mut args = ValueList::new();
        let mut blocks = crate::instructions::BlockList::new();
        for (block, value) in edges {
            args.push(*value, &mut self.value_lists);
            blocks.push(*block, &mut self.block_lists);
        }
        InstructionData::PhiNode { args, blocks, ty }
    }

    /// The `(predecessor, value)` edges of a phi.
    pub fn phi_edges<'a>(&'a self, inst: Inst) -> impl Iterator<Item = (Block, Value)> + 'a {
        match self.insts[inst] {
            InstructionData::PhiNode { ref args, ref blocks, .. } => {
                let args = args.as_slice(&self.value_lists);
                let blocks = blocks.as_slice(&self.block_lists);
                blocks.iter().copied().zip(args.iter().copied())
            }
            _ => panic!("{} is not a phi", inst),
        }
    }

    /// The incoming value of a phi along the edge from `pred`.
    pub fn phi_edge_val(&self, inst: Inst, pred: Block) -> Option<Value> {
        self.phi_edges(inst).find(|(block, _)| *block == pred).map(|(_, val)| val)
    }

    /// Append an edge to an existing phi.
    pub fn append_phi_edge(&mut self, inst: Inst, pred: Block, val: Value) {
        match &mut self.insts[inst] {
            InstructionData::PhiNode { args, blocks, .. } => {
                args.push(val, &mut self.value_lists);
                blocks.push(pred, &mut self.block_lists);
            }
            _ => panic!("{} is not a phi", inst),
        }
    }
}

impl Index<Inst> for DataFlowGraph {
    type Output = InstructionData;

    fn index(&self, inst: Inst) -> &InstructionData {
        &self.insts[inst]
    }
}

impl IndexMut<Inst> for DataFlowGraph {
    fn index_mut(&mut self, inst: Inst) -> &mut InstructionData {
        &mut self.insts[inst]
    }
}

/// Object that can display an instruction for debugging.
pub struct DisplayInst<'a>(&'a DataFlowGraph, Inst);

impl fmt::Display for DisplayInst<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let DisplayInst(dfg, inst) = *self;
        if let Some((first, rest)) = dfg.inst_results(inst).split_first() {
            write!(f, "{}", first)?;
            for v in rest {
                write!(f, ", {}", v)?;
            }
            write!(f, " = ")?;
        }
        write!(f, "{}", dfg[inst].opcode())?;
        crate::write::write_operands(f, dfg, inst)
    }
}

/// A single use of a value: the instruction and its operand index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Use {
    pub inst: Inst,
    pub index: u16,
}

/// Collect, in program order, every use of every value in `func`.
pub fn compute_uses(func: &Function) -> SecondaryMap<Value, Vec<Use>> {
    let mut uses: SecondaryMap<Value, Vec<Use>> = SecondaryMap::new();
    for block in func.layout.blocks() {
        for inst in func.layout.block_insts(block) {
            for (index, arg) in func.dfg.inst_args(inst).iter().enumerate() {
                uses[*arg].push(Use { inst, index: index as u16 });
            }
        }
    }
    uses
}
