//! Instruction emission cursor.
//!
//! A `FuncCursor` holds an insertion point in a function's layout and
//! provides one short-hand constructor per opcode the transforms emit.
//! Every constructor creates the instruction, its result values, and
//! inserts it at the cursor position.

use crate::entities::{Block, FuncRef, GlobalRef, Inst, StackSlot, Value};
use crate::immediates::Ieee64;
use crate::instructions::{InstructionData, Opcode};
use crate::types::Type;
use crate::Function;

#[derive(Clone, Copy, Debug)]
enum Pos {
    /// Append at the end of a block.
    End(Block),
    /// Insert before an existing instruction.
    Before(Inst),
}

pub struct FuncCursor<'f> {
    pub func: &'f mut Function,
    pos: Pos,
}

impl<'f> FuncCursor<'f> {
    pub fn at_end(func: &'f mut Function, block: Block) -> Self {
        FuncCursor { func, pos: Pos::End(block) }
    }

    pub fn before_inst(func: &'f mut Function, inst: Inst) -> Self {
        FuncCursor { func, pos: Pos::Before(inst) }
    }

    /// Position at the head of `block`: new instructions end up before
    /// everything currently in the block, in emission order.
    pub fn at_head(func: &'f mut Function, block: Block) -> Self {
        let pos = match func.layout.first_inst(block) {
            Some(first) => Pos::Before(first),
            None => Pos::End(block),
        };
        FuncCursor { func, pos }
    }

    pub fn goto_end(&mut self, block: Block) {
        self.pos = Pos::End(block);
    }

    pub fn goto_before(&mut self, inst: Inst) {
        self.pos = Pos::Before(inst);
    }

    /// The block new instructions are inserted into.
    pub fn current_block(&self) -> Block {
        match self.pos {
            Pos::End(block) => block,
            Pos::Before(inst) => self.func.layout.inst_block(inst).unwrap(),
        }
    }

    pub fn build(&mut self, data: InstructionData) -> Inst {
        let inst = self.func.dfg.make_inst(data);
        self.func.dfg.make_inst_results(inst);
        match self.pos {
            Pos::End(block) => self.func.layout.append_inst(inst, block),
            Pos::Before(before) => self.func.layout.insert_inst(inst, before),
        }
        inst
    }

    fn build_val(&mut self, data: InstructionData) -> Value {
        let inst = self.build(data);
        self.func.dfg.first_result(inst)
    }
}

/// Constants.
impl FuncCursor<'_> {
    pub fn fconst(&mut self, ty: Type, imm: f64) -> Value {
        debug_assert!(matches!(ty, Type::F32 | Type::F64));
        self.build_val(InstructionData::UnaryIeee64 { imm: Ieee64::from(imm), ty })
    }

    pub fn iconst(&mut self, ty: Type, imm: i64) -> Value {
        debug_assert!(matches!(ty, Type::I32 | Type::I64));
        self.build_val(InstructionData::UnaryInt { imm, ty })
    }

    pub fn bconst(&mut self, imm: bool) -> Value {
        self.build_val(InstructionData::UnaryBool { imm })
    }

    pub fn nullptr(&mut self) -> Value {
        self.build_val(InstructionData::Nullary { op: Opcode::Nullptr })
    }

    /// The zero of any type: differentials start from this.
    pub fn zero(&mut self, ty: Type) -> Value {
        match ty {
            Type::F32 | Type::F64 => self.fconst(ty, 0.0),
            Type::I32 | Type::I64 => self.iconst(ty, 0),
            Type::I1 => self.bconst(false),
            Type::Ptr => self.nullptr(),
            Type::F64x2 | Type::F64x4 => {
                let scalar = self.fconst(Type::F64, 0.0);
                self.splat(ty, scalar)
            }
        }
    }
}

/// Arithmetic, lanes and casts.
impl FuncCursor<'_> {
    pub fn unary(&mut self, op: Opcode, arg: Value) -> Value {
        self.build_val(InstructionData::Unary { op, arg })
    }

    pub fn binary(&mut self, op: Opcode, lhs: Value, rhs: Value) -> Value {
        self.build_val(InstructionData::Binary { op, args: [lhs, rhs] })
    }

    pub fn fadd(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Fadd, lhs, rhs)
    }

    pub fn fsub(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Fsub, lhs, rhs)
    }

    pub fn fmul(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Fmul, lhs, rhs)
    }

    pub fn fdiv(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Fdiv, lhs, rhs)
    }

    pub fn fneg(&mut self, arg: Value) -> Value {
        self.unary(Opcode::Fneg, arg)
    }

    pub fn iadd(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Iadd, lhs, rhs)
    }

    pub fn isub(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Isub, lhs, rhs)
    }

    pub fn ieq(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(Opcode::Ieq, lhs, rhs)
    }

    pub fn select(&mut self, cond: Value, then_val: Value, else_val: Value) -> Value {
        self.build_val(InstructionData::Ternary {
            op: Opcode::Select,
            args: [cond, then_val, else_val],
        })
    }

    pub fn splat(&mut self, ty: Type, arg: Value) -> Value {
        self.build_val(InstructionData::UnaryTy { op: Opcode::Splat, arg, ty })
    }

    pub fn extract(&mut self, arg: Value, lane: u8) -> Value {
        self.build_val(InstructionData::Extract { arg, lane })
    }

    pub fn insert_lane(&mut self, agg: Value, elem: Value, lane: u8) -> Value {
        self.build_val(InstructionData::Insert { args: [agg, elem], lane })
    }

    pub fn shuffle(&mut self, lhs: Value, rhs: Value, mask: u32) -> Value {
        self.build_val(InstructionData::Shuffle { args: [lhs, rhs], mask })
    }

    pub fn cast(&mut self, op: Opcode, arg: Value, ty: Type) -> Value {
        debug_assert!(op.is_cast());
        self.build_val(InstructionData::UnaryTy { op, arg, ty })
    }
}

/// Memory.
impl FuncCursor<'_> {
    pub fn load(&mut self, ty: Type, ptr: Value) -> Value {
        self.build_val(InstructionData::UnaryTy { op: Opcode::Load, arg: ptr, ty })
    }

    pub fn store(&mut self, value: Value, ptr: Value) -> Inst {
        self.build(InstructionData::Binary { op: Opcode::Store, args: [value, ptr] })
    }

    pub fn gep(&mut self, elem_ty: Type, base: Value, index: Value) -> Value {
        self.build_val(InstructionData::Gep { args: [base, index], elem_ty })
    }

    pub fn global_addr(&mut self, global: GlobalRef) -> Value {
        self.build_val(InstructionData::UnaryGlobal { global })
    }

    pub fn stack_load(&mut self, slot: StackSlot) -> Value {
        self.build_val(InstructionData::StackLoad { slot })
    }

    pub fn stack_store(&mut self, slot: StackSlot, arg: Value) -> Inst {
        self.build(InstructionData::StackStore { slot, arg })
    }

    pub fn memcpy(&mut self, dst: Value, src: Value, len: Value) -> Inst {
        self.build(InstructionData::Ternary { op: Opcode::Memcpy, args: [dst, src, len] })
    }

    pub fn memmove(&mut self, dst: Value, src: Value, len: Value) -> Inst {
        self.build(InstructionData::Ternary { op: Opcode::Memmove, args: [dst, src, len] })
    }

    pub fn memset(&mut self, dst: Value, byte: Value, len: Value) -> Inst {
        self.build(InstructionData::Ternary { op: Opcode::Memset, args: [dst, byte, len] })
    }

    pub fn lifetime_start(&mut self, ptr: Value) -> Inst {
        self.build(InstructionData::Unary { op: Opcode::LifetimeStart, arg: ptr })
    }

    pub fn lifetime_end(&mut self, ptr: Value) -> Inst {
        self.build(InstructionData::Unary { op: Opcode::LifetimeEnd, arg: ptr })
    }
}

/// Calls, control flow and phis.
impl FuncCursor<'_> {
    pub fn call(&mut self, func_ref: FuncRef, args: &[Value]) -> Inst {
        let mut list = crate::instructions::ValueList::new();
        list.extend(args.iter().copied(), &mut self.func.dfg.value_lists);
        self.build(InstructionData::Call { func_ref, args: list })
    }

    pub fn jump(&mut self, destination: Block) -> Inst {
        self.build(InstructionData::Jump { destination })
    }

    pub fn br(&mut self, cond: Value, then_dest: Block, else_dest: Block) -> Inst {
        self.build(InstructionData::Branch { arg: cond, then_dest, else_dest })
    }

    pub fn ret(&mut self, args: &[Value]) -> Inst {
        let mut list = crate::instructions::ValueList::new();
        list.extend(args.iter().copied(), &mut self.func.dfg.value_lists);
        self.build(InstructionData::Ret { args: list })
    }

    pub fn unreachable(&mut self) -> Inst {
        self.build(InstructionData::Nullary { op: Opcode::Unreachable })
    }

    pub fn phi(&mut self, ty: Type, edges: &[(Block, Value)]) -> Value {
        let data = self.func.dfg.make_phi_data(ty, edges);
        self.build_val(data)
    }
}
