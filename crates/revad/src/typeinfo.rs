//! The type/shape oracle of the transform.
//!
//! Most questions (is-float, is-pointer) fall out of the value types of
//! the IR. What a pointer points to is not part of the pointer type and
//! is inferred from use: loads, stores and geps through the pointer.
//! Integer values that secretly carry float bits cannot be inferred at
//! all and are declared by the caller.

use ahash::AHashMap;
use bitset::BitSet;
use lir::{Function, InstructionData, Opcode, Type, Value};

pub struct TypeInfo {
    /// Integer-typed values whose bit pattern is actually a float.
    secret_float: BitSet<Value>,
    /// First pointed-to type of every pointer value, where one could be
    /// inferred.
    pointee: AHashMap<Value, Type>,
    /// Values that are compile-time constant integers.
    const_int: AHashMap<Value, i64>,
}

impl TypeInfo {
    pub fn analyze(func: &Function, secret_floats: &[Value]) -> TypeInfo {
        let mut secret_float = BitSet::new_empty(func.dfg.num_values());
        for v in secret_floats {
            secret_float.insert(*v);
        }

        let mut pointee = AHashMap::new();
        let mut const_int = AHashMap::new();
        for block in func.layout.blocks() {
            for inst in func.layout.block_insts(block) {
                match func.dfg[inst] {
                    InstructionData::UnaryTy { op: Opcode::Load, arg, ty } => {
                        pointee.entry(arg).or_insert(ty);
                    }
                    InstructionData::Binary { op: Opcode::Store, args } => {
                        pointee.entry(args[1]).or_insert_with(|| func.dfg.value_ty(args[0]));
                    }
                    InstructionData::Gep { args, elem_ty } => {
                        pointee.entry(args[0]).or_insert(elem_ty);
                        // The derived pointer addresses the same elements.
                        for result in func.dfg.inst_results(inst) {
                            pointee.entry(*result).or_insert(elem_ty);
                        }
                    }
                    InstructionData::UnaryInt { imm, .. } => {
                        const_int.insert(func.dfg.first_result(inst), imm);
                    }
                    _ => {}
                }
            }
        }

        TypeInfo { secret_float, pointee, const_int }
    }

    pub fn is_float(&self, func: &Function, v: Value) -> bool {
        func.dfg.value_ty(v).is_float() || self.is_secret_float(v)
    }

    pub fn is_pointer(&self, func: &Function, v: Value) -> bool {
        func.dfg.value_ty(v).is_ptr()
    }

    /// Integer-typed, but the type analysis knows the bits are a float.
    pub fn is_secret_float(&self, v: Value) -> bool {
        usize::from(v) < self.secret_float.domain_size() && self.secret_float.contains(v)
    }

    /// The first pointed-to type of a pointer value, if one was inferred.
    pub fn pointee(&self, v: Value) -> Option<Type> {
        self.pointee.get(&v).copied()
    }

    /// Does the memory behind this pointer hold floats?
    pub fn points_to_float(&self, v: Value) -> bool {
        self.pointee(v).map_or(false, |ty| ty.is_float())
    }

    pub fn const_int(&self, v: Value) -> Option<i64> {
        self.const_int.get(&v).copied()
    }
}
