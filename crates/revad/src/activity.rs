//! Activity bits: which values carry a structurally nonzero gradient and
//! which instructions have a differential side effect.
//!
//! The transform itself only consumes the two bit sets; they normally
//! come from an external activity analysis. `Activity::compute` is the
//! conservative stand-in used by the tests: a forward float taint from
//! the active arguments, with pointers turning active when active data
//! is stored through them and loads through active pointers producing
//! active values.

use bitset::BitSet;
use cranelift_entity::SecondaryMap;
use lir::{compute_uses, Function, Inst, InstructionData, Opcode, Use, Value, ValueDef};
use workqueue::WorkQueue;

use crate::typeinfo::TypeInfo;
use crate::{classify_callee, KnownCallee};

type Uses = SecondaryMap<Value, Vec<Use>>;

#[derive(Clone)]
pub struct Activity {
    /// Values whose gradient is structurally zero.
    pub const_values: BitSet<Value>,
    /// Instructions without a differential side effect.
    pub const_insts: BitSet<Inst>,
}

impl Activity {
    pub fn is_const_val(&self, v: Value) -> bool {
        self.const_values.contains(v)
    }

    pub fn is_const_inst(&self, inst: Inst) -> bool {
        self.const_insts.contains(inst)
    }

    /// Conservative forward taint. `const_args[i]` marks the `i`th
    /// parameter as inactive; missing entries default to active for
    /// float and pointer parameters.
    pub fn compute(func: &Function, typeinfo: &TypeInfo, const_args: &[bool]) -> Activity {
        let num_values = func.dfg.num_values();
        let uses = compute_uses(func);
        let mut active: BitSet<Value> = BitSet::new_empty(num_values);
        let mut queue: WorkQueue<Value> = WorkQueue::with_none(num_values);

        for (idx, param) in func.params().iter().enumerate() {
            let inactive = const_args.get(idx).copied().unwrap_or(false);
            let ty = func.dfg.value_ty(*param);
            if !inactive && (ty.is_float() || ty.is_ptr() || typeinfo.is_secret_float(*param)) {
                active.insert(*param);
                queue.insert(*param);
            }
        }

        while let Some(val) = queue.pop() {
            propagate(func, typeinfo, &uses, val, &mut active, &mut queue);
        }

        let mut const_values = BitSet::new_filled(num_values);
        for v in active.iter() {
            const_values.remove(v);
        }

        let mut const_insts = BitSet::new_filled(func.dfg.num_insts());
        for block in func.layout.blocks() {
            for inst in func.layout.block_insts(block) {
                if !inst_is_const(func, &active, inst) {
                    const_insts.remove(inst);
                }
            }
        }

        Activity { const_values, const_insts }
    }
}

fn mark(active: &mut BitSet<Value>, queue: &mut WorkQueue<Value>, val: Value) {
    if active.insert(val) {
        queue.insert(val);
    }
}

/// One step of the taint: `val` just became active; push activity into
/// its users, and for pointers also into the aliases that name the same
/// memory.
fn propagate(
    func: &Function,
    typeinfo: &TypeInfo,
    uses: &Uses,
    val: Value,
    active: &mut BitSet<Value>,
    queue: &mut WorkQueue<Value>,
) {
    let carries = |func: &Function, v: Value| {
        let ty = func.dfg.value_ty(v);
        ty.is_float() || ty.is_ptr() || typeinfo.is_secret_float(v)
    };

    for use_ in &uses[val] {
        let inst = use_.inst;
        match func.dfg[inst] {
            InstructionData::Binary { op: Opcode::Store, args } => {
                // Storing an active value makes the destination memory
                // active. A store of an inactive value taints nothing.
                if args[0] == val {
                    mark(active, queue, args[1]);
                }
            }
            InstructionData::Ternary { op: Opcode::Memcpy | Opcode::Memmove, args } => {
                if args[1] == val {
                    mark(active, queue, args[0]);
                }
            }
            InstructionData::Call { .. } => {
                let sig = func.dfg.call_signature(inst).unwrap();
                if classify_callee(&sig.name) == KnownCallee::PassThrough {
                    continue;
                }
                for result in func.dfg.inst_results(inst) {
                    if carries(func, *result) {
                        mark(active, queue, *result);
                    }
                }
                // An active pointer handed to a writing callee can come
                // back filled with active data.
                if func.dfg.value_ty(val).is_ptr() && sig.effects.may_write() {
                    mark(active, queue, val);
                }
            }
            _ => {
                for result in func.dfg.inst_results(inst) {
                    if carries(func, *result) {
                        mark(active, queue, *result);
                    }
                }
            }
        }
    }

    // Pointer aliasing: a derived pointer and its base name the same
    // memory, so activity flows both ways along gep / pointer casts.
    if func.dfg.value_ty(val).is_ptr() {
        if let ValueDef::Result(inst, _) = func.dfg.value_def(val) {
            match func.dfg[inst] {
                InstructionData::Gep { args, .. } => mark(active, queue, args[0]),
                InstructionData::UnaryTy { op: Opcode::Bitcast | Opcode::Inttoptr, arg, .. } => {
                    if func.dfg.value_ty(arg).is_ptr() {
                        mark(active, queue, arg);
                    }
                }
                _ => {}
            }
        }
    }
}

fn inst_is_const(func: &Function, active: &BitSet<Value>, inst: Inst) -> bool {
    match func.dfg[inst] {
        InstructionData::Binary { op: Opcode::Store, args } => {
            // A store into active memory has a differential side effect
            // even when the stored value is inactive: it zeroes the
            // shadow region.
            !active.contains(args[1])
        }
        InstructionData::Ternary { op: Opcode::Memcpy | Opcode::Memmove | Opcode::Memset, args } => {
            !active.contains(args[0])
        }
        InstructionData::Call { .. } => {
            let sig = func.dfg.call_signature(inst).unwrap();
            if classify_callee(&sig.name) == KnownCallee::PassThrough {
                return true;
            }
            let args_const = func.dfg.inst_args(inst).iter().all(|arg| !active.contains(*arg));
            let results_const =
                func.dfg.inst_results(inst).iter().all(|res| !active.contains(*res));
            args_const && results_const
        }
        _ => func.dfg.inst_results(inst).iter().all(|res| !active.contains(*res)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lir_reader::parse_function;

    fn compute(src: &str, const_args: &[bool]) -> (lir::Function, Activity) {
        let func = parse_function(src).unwrap();
        let typeinfo = TypeInfo::analyze(&func, &[]);
        let activity = Activity::compute(&func, &typeinfo, const_args);
        (func, activity)
    }

    #[test]
    fn taint_flows_through_floats() {
        let (_, activity) = compute(
            "function %f(f64, f64) -> f64 {\n\
             block0(v0: f64, v1: f64):\n\
                 v2 = fmul v0, v1\n\
                 ret v2\n\
             }\n",
            &[false, true],
        );
        assert!(!activity.is_const_val(Value::from(0usize)));
        assert!(activity.is_const_val(Value::from(1usize)));
        assert!(!activity.is_const_val(Value::from(2usize)));
    }

    #[test]
    fn stores_activate_memory_and_loads_read_it_back() {
        let (func, activity) = compute(
            "function %f(ptr, f64) -> f64 {\n\
             block0(v0: ptr, v1: f64):\n\
                 store v1, v0\n\
                 v2 = load.f64 v0\n\
                 ret v2\n\
             }\n",
            &[true, false],
        );
        // The pointer itself was marked constant, but an active store
        // through it activates the memory and the loaded value.
        assert!(!activity.is_const_val(Value::from(0usize)));
        assert!(!activity.is_const_val(Value::from(2usize)));
        let store = func
            .layout
            .blocks()
            .flat_map(|b| func.layout.block_insts(b).collect::<Vec<_>>())
            .find(|inst| func.dfg[*inst].opcode() == Opcode::Store)
            .unwrap();
        assert!(!activity.is_const_inst(store));
    }

    #[test]
    fn integer_plumbing_stays_constant() {
        let (_, activity) = compute(
            "function %f(ptr, i64) -> f64 {\n\
             block0(v0: ptr, v1: i64):\n\
                 v2 = gep.f64 v0, v1\n\
                 v3 = load.f64 v2\n\
                 ret v3\n\
             }\n",
            &[false, false],
        );
        assert!(activity.is_const_val(Value::from(1usize)));
        assert!(!activity.is_const_val(Value::from(2usize)));
        assert!(!activity.is_const_val(Value::from(3usize)));
    }
}
