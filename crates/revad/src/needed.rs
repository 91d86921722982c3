//! `needed_in_reverse`: is a value consumed by the reverse pass, either
//! as data for an adjoint or for control-flow reconstruction?
//!
//! The query walks the uses of a value and applies a first-match rule
//! list per use; the recursion carries a visited map and answers `false`
//! provisionally on a value it is already in the middle of evaluating,
//! which terminates cycles through pointer chains and phis.

use ahash::AHashMap;
use cranelift_entity::SecondaryMap;
use lir::{Function, Inst, InstructionData, Opcode, Use, Value};

use crate::activity::Activity;
use crate::uncacheable::CanModRef;
use crate::DerivativeMode;

pub struct NeededInReverse<'a> {
    func: &'a Function,
    uses: &'a SecondaryMap<Value, Vec<Use>>,
    activity: &'a Activity,
    can_modref: &'a CanModRef,
    mode: DerivativeMode,
    memo: AHashMap<Value, bool>,
}

impl<'a> NeededInReverse<'a> {
    pub fn new(
        func: &'a Function,
        uses: &'a SecondaryMap<Value, Vec<Use>>,
        activity: &'a Activity,
        can_modref: &'a CanModRef,
        mode: DerivativeMode,
    ) -> Self {
        NeededInReverse { func, uses, activity, can_modref, mode, memo: AHashMap::new() }
    }

    pub fn query(&mut self, v: Value) -> bool {
        if let Some(&answer) = self.memo.get(&v) {
            return answer;
        }
        // Provisional answer for cyclic chains.
        self.memo.insert(v, false);
        let answer = self.compute(v);
        self.memo.insert(v, answer);
        answer
    }

    fn compute(&mut self, v: Value) -> bool {
        let uses: Vec<Use> = self.uses[v].clone();
        for use_ in uses {
            if self.use_induces_need(v, use_) {
                return true;
            }
        }
        false
    }

    fn use_induces_need(&mut self, v: Value, use_: Use) -> bool {
        let dfg = &self.func.dfg;
        let user = use_.inst;
        let opcode = dfg[user].opcode();

        // Control-flow dependence: outside the combined mode, branch and
        // call users force the value to survive into the reverse pass.
        if self.mode != DerivativeMode::Both && (opcode.is_branch() || opcode.is_call()) {
            return true;
        }

        // A user without differential effect consumes nothing in reverse.
        if self.activity.is_const_inst(user) {
            return false;
        }

        // Pointers: needed when a non-store user is itself needed and its
        // value does not come out of the tape.
        if dfg.value_ty(v).is_ptr() {
            return match dfg[user] {
                InstructionData::Binary { op: Opcode::Store, .. } => false,
                InstructionData::UnaryTy { op: Opcode::Load, .. } => {
                    // A tape-cached load does not need its pointer again;
                    // an uncached one is re-executed in reverse.
                    let result = dfg.first_result(user);
                    !self.can_modref[user] && self.query(result)
                }
                InstructionData::Ternary {
                    op: Opcode::Memcpy | Opcode::Memmove | Opcode::Memset,
                    ..
                } => {
                    // The shadow copy in reverse addresses the shadows,
                    // which are derived from the pointer.
                    true
                }
                InstructionData::Call { .. } => true,
                _ => {
                    dfg.inst_results(user).iter().any(|res| self.query(*res))
                }
            };
        }

        match dfg[user] {
            // Identity adjoints.
            InstructionData::Binary { op: Opcode::Fadd | Opcode::Fsub, .. } => false,
            InstructionData::Unary { op: Opcode::Fneg, .. } => false,
            // Gep only consumes its index in reverse, never the base
            // (the base is a pointer, handled above).
            InstructionData::Gep { .. } => use_.index == 1,
            // The stored value's adjoint comes from the shadow, not from
            // the value itself.
            InstructionData::Binary { op: Opcode::Store, .. } => false,
            // Compares, branches, casts, phis, returns and lane moves
            // propagate differentials without touching the primal.
            InstructionData::Binary {
                op: Opcode::Ieq | Opcode::Ilt | Opcode::Feq | Opcode::Flt | Opcode::Fle,
                ..
            } => false,
            InstructionData::Branch { .. } | InstructionData::Jump { .. } => false,
            InstructionData::UnaryTy {
                op:
                    Opcode::Bitcast
                    | Opcode::Fpext
                    | Opcode::Fptrunc
                    | Opcode::Zext
                    | Opcode::Itrunc
                    | Opcode::Ptrtoint
                    | Opcode::Inttoptr,
                ..
            } => false,
            InstructionData::PhiNode { .. } => false,
            InstructionData::Ret { .. } => false,
            InstructionData::Extract { .. } | InstructionData::Insert { .. } => false,
            InstructionData::Shuffle { .. } => false,
            // The select condition steers the reverse select; its data
            // operands pass differentials through untouched.
            InstructionData::Ternary { op: Opcode::Select, .. } => use_.index == 0,
            // The byte count of a memory intrinsic sizes the shadow copy.
            InstructionData::Ternary {
                op: Opcode::Memcpy | Opcode::Memmove | Opcode::Memset,
                ..
            } => use_.index == 2,
            // Calls with a differential effect consume their arguments.
            InstructionData::Call { .. } => true,
            // Everything else (multiplicative arithmetic, the float math
            // table) consumes its operands in the adjoint.
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typeinfo::TypeInfo;
    use lir::compute_uses;
    use lir_reader::parse_function;

    fn needed_values(src: &str, mode: DerivativeMode) -> Vec<Value> {
        let func = parse_function(src).unwrap();
        let uses = compute_uses(&func);
        let typeinfo = TypeInfo::analyze(&func, &[]);
        let activity = Activity::compute(&func, &typeinfo, &[]);
        let can_modref = CanModRef::new();
        let mut query = NeededInReverse::new(&func, &uses, &activity, &can_modref, mode);
        let mut out = Vec::new();
        for block in func.layout.blocks() {
            for inst in func.layout.block_insts(block) {
                for result in func.dfg.inst_results(inst) {
                    if query.query(*result) {
                        out.push(*result);
                    }
                }
            }
            for param in func.dfg.block_params(block) {
                if query.query(*param) {
                    out.push(*param);
                }
            }
        }
        out.sort();
        out
    }

    use crate::activity::Activity;
    use crate::uncacheable::CanModRef;

    #[test]
    fn additive_users_induce_no_need() {
        let needed = needed_values(
            "function %f(f64, f64) -> f64 {\n\
             block0(v0: f64, v1: f64):\n\
                 v2 = fadd v0, v1\n\
                 ret v2\n\
             }\n",
            DerivativeMode::Both,
        );
        assert!(needed.is_empty());
    }

    #[test]
    fn multiplicative_users_need_their_operands() {
        let needed = needed_values(
            "function %f(f64, f64) -> f64 {\n\
             block0(v0: f64, v1: f64):\n\
                 v2 = fmul v0, v1\n\
                 ret v2\n\
             }\n",
            DerivativeMode::Both,
        );
        assert_eq!(needed, vec![Value::from(0usize), Value::from(1usize)]);
    }

    #[test]
    fn branch_users_force_need_outside_combined_mode() {
        let src = "function %f(f64, i1) -> f64 {\n\
             block0(v0: f64, v1: i1):\n\
                 br v1, block1, block2\n\
             block1:\n\
                 ret v0\n\
             block2:\n\
                 unreachable\n\
             }\n";
        let combined = needed_values(src, DerivativeMode::Both);
        assert!(!combined.contains(&Value::from(1usize)));
        let split = needed_values(src, DerivativeMode::Forward);
        assert!(split.contains(&Value::from(1usize)));
    }

    #[test]
    fn gep_needs_the_index_not_the_base() {
        let needed = needed_values(
            "function %f(ptr, i64) -> f64 {\n\
             block0(v0: ptr, v1: i64):\n\
                 v2 = gep.f64 v0, v1\n\
                 v3 = load.f64 v2\n\
                 v4 = fmul v3, v3\n\
                 ret v4\n\
             }\n",
            DerivativeMode::Both,
        );
        assert!(needed.contains(&Value::from(1usize)));
        assert!(needed.contains(&Value::from(3usize)));
    }
}
