//! The per-instruction adjoint rules: a closed match over the opcode
//! set, emitting the reverse-pass contribution of one instruction into
//! its reverse block. Unknown constructs on an active value are fatal;
//! the transform must not guess a derivative.

use lir::cursor::FuncCursor;
use lir::{Block, Inst, InstructionData, Opcode, Type, Value};

use crate::calls;
use crate::transform::FnBuilder;
use crate::{fatal, runtime, AdContext};
use lir::Module;

/// Emit the reverse-pass code of `inst` (which lives in `block` of the
/// original function). Called back-to-front per block; terminators and
/// phis are the terminator inverter's job.
pub(crate) fn reverse_inst(
    fb: &mut FnBuilder,
    ctx: &mut AdContext,
    module: &mut Module,
    inst: Inst,
    block: Block,
) {
    let data = fb.src.dfg[inst];
    let opcode = data.opcode();
    if opcode.is_terminator() || opcode == Opcode::Phi {
        return;
    }
    if opcode == Opcode::Call {
        calls::reverse_call(fb, ctx, module, inst, block);
        return;
    }
    if fb.is_const_inst(inst) {
        return;
    }

    match data {
        InstructionData::Binary { op, args } => reverse_binary(fb, inst, op, args, block),
        InstructionData::Unary { op, arg } => reverse_unary(fb, inst, op, arg, block),
        InstructionData::UnaryTy { op, arg, ty } => reverse_cast(fb, inst, op, arg, ty, block),
        InstructionData::Ternary { op, args } => reverse_ternary(fb, inst, op, args, block),
        InstructionData::UnaryIeee64 { .. }
        | InstructionData::UnaryInt { .. }
        | InstructionData::UnaryBool { .. }
        | InstructionData::Nullary { .. }
        | InstructionData::UnaryGlobal { .. } => {}
        InstructionData::Gep { .. } => {
            // Address arithmetic: the shadow machinery mirrors it; the
            // index is integral.
        }
        InstructionData::Extract { arg, lane } => reverse_extract(fb, inst, arg, lane, block),
        InstructionData::Insert { args, lane } => reverse_insert(fb, inst, args, lane, block),
        InstructionData::Shuffle { args, mask } => reverse_shuffle(fb, inst, args, mask, block),
        InstructionData::StackLoad { .. } | InstructionData::StackStore { .. } => {
            fatal!(
                "active stack slot access cannot be differentiated: {}",
                fb.src.dfg.display_inst(inst)
            )
        }
        InstructionData::Call { .. }
        | InstructionData::Jump { .. }
        | InstructionData::Branch { .. }
        | InstructionData::Ret { .. }
        | InstructionData::PhiNode { .. } => unreachable!(),
    }
}

fn result(fb: &FnBuilder, inst: Inst) -> Value {
    fb.src.dfg.first_result(inst)
}

fn float_ty(fb: &FnBuilder, v: Value) -> Type {
    fb.src.dfg.value_ty(v)
}

fn rev_cursor<'f>(fb: &'f mut FnBuilder, block: Block) -> FuncCursor<'f> {
    let rev_block = fb.rev_map[block].expand().expect("no reverse block");
    FuncCursor::at_end(&mut fb.fx, rev_block)
}

fn reverse_binary(fb: &mut FnBuilder, inst: Inst, op: Opcode, args: [Value; 2], block: Block) {
    let [a, b] = args;
    match op {
        Opcode::Store => return reverse_store(fb, a, b, block),
        Opcode::Ieq | Opcode::Ilt | Opcode::Feq | Opcode::Flt | Opcode::Fle => return,
        _ => {}
    }

    let r = result(fb, inst);
    if fb.is_const_val(r) {
        return;
    }

    match op {
        Opcode::Fadd => {
            let dr = fb.get_diffe(r, block);
            fb.add_to_diffe(a, dr, block);
            fb.add_to_diffe(b, dr, block);
        }
        Opcode::Fsub => {
            let dr = fb.get_diffe(r, block);
            fb.add_to_diffe(a, dr, block);
            if !fb.is_const_val(b) {
                let neg = rev_cursor(fb, block).fneg(dr);
                fb.add_to_diffe(b, neg, block);
            }
        }
        Opcode::Fmul => {
            let dr = fb.get_diffe(r, block);
            if !fb.is_const_val(a) {
                let bv = fb.lookup(b, block);
                let delta = rev_cursor(fb, block).fmul(dr, bv);
                fb.add_to_diffe(a, delta, block);
            }
            if !fb.is_const_val(b) {
                let av = fb.lookup(a, block);
                let delta = rev_cursor(fb, block).fmul(dr, av);
                fb.add_to_diffe(b, delta, block);
            }
        }
        Opcode::Fdiv => {
            let dr = fb.get_diffe(r, block);
            if !fb.is_const_val(a) {
                let bv = fb.lookup(b, block);
                let delta = rev_cursor(fb, block).fdiv(dr, bv);
                fb.add_to_diffe(a, delta, block);
            }
            if !fb.is_const_val(b) {
                let rv = fb.lookup(r, block);
                let bv = fb.lookup(b, block);
                let mut cur = rev_cursor(fb, block);
                let scaled = cur.fmul(dr, rv);
                let quot = cur.fdiv(scaled, bv);
                let delta = cur.fneg(quot);
                fb.add_to_diffe(b, delta, block);
            }
        }
        Opcode::Pow => {
            let dr = fb.get_diffe(r, block);
            let ty = float_ty(fb, a);
            if !fb.is_const_val(a) {
                let av = fb.lookup(a, block);
                let bv = fb.lookup(b, block);
                let mut cur = rev_cursor(fb, block);
                let one = cur.fconst(ty, 1.0);
                let bm1 = cur.fsub(bv, one);
                let powm1 = cur.binary(Opcode::Pow, av, bm1);
                let scaled = cur.fmul(dr, bv);
                let delta = cur.fmul(scaled, powm1);
                fb.add_to_diffe(a, delta, block);
            }
            if !fb.is_const_val(b) {
                let av = fb.lookup(a, block);
                let rv = fb.lookup(r, block);
                let mut cur = rev_cursor(fb, block);
                let ln = cur.unary(Opcode::Log, av);
                let scaled = cur.fmul(dr, rv);
                let delta = cur.fmul(scaled, ln);
                fb.add_to_diffe(b, delta, block);
            }
        }
        Opcode::Fmin | Opcode::Fmax => {
            let dr = fb.get_diffe(r, block);
            let av = fb.lookup(a, block);
            let bv = fb.lookup(b, block);
            let ty = float_ty(fb, a);
            let mut cur = rev_cursor(fb, block);
            // The adjoint follows whichever operand was selected.
            let a_wins = if op == Opcode::Fmin {
                cur.binary(Opcode::Fle, av, bv)
            } else {
                cur.binary(Opcode::Fle, bv, av)
            };
            let zero = cur.zero(ty);
            let da = cur.select(a_wins, dr, zero);
            let db = cur.select(a_wins, zero, dr);
            fb.add_to_diffe(a, da, block);
            fb.add_to_diffe(b, db, block);
        }
        Opcode::Lshr => {
            // A right shift of a secret float by a whole number of float
            // lanes moves the float's bits; the adjoint shifts them back.
            let shift = fb.typeinfo.const_int(b);
            let secret = fb.typeinfo.is_secret_float(a) || fb.typeinfo.is_secret_float(r);
            match shift {
                Some(k) if secret && k % 32 == 0 => {
                    let dr = fb.get_diffe(r, block);
                    let kv = fb.lookup(b, block);
                    let delta = rev_cursor(fb, block).binary(Opcode::Ishl, dr, kv);
                    fb.add_to_diffe(a, delta, block);
                }
                _ => fatal!(
                    "cannot differentiate shift {}",
                    fb.src.dfg.display_inst(inst)
                ),
            }
        }
        Opcode::Iadd | Opcode::Isub | Opcode::Imul | Opcode::Ishl | Opcode::Band
        | Opcode::Bor | Opcode::Bxor => {
            if fb.typeinfo.is_secret_float(r) {
                fatal!(
                    "cannot differentiate integer arithmetic on float bits: {}",
                    fb.src.dfg.display_inst(inst)
                );
            }
            return;
        }
        _ => fatal!("unknown binary operator {}", fb.src.dfg.display_inst(inst)),
    }
    fb.zero_diffe(r, block);
}

fn reverse_unary(fb: &mut FnBuilder, inst: Inst, op: Opcode, x: Value, block: Block) {
    match op {
        Opcode::LifetimeStart => {
            // The mirrored region dies where the primal's was born.
            if !fb.is_const_val(x) {
                let ptr = fb.lookup_shadow(x, block);
                rev_cursor(fb, block).lifetime_end(ptr);
            }
            return;
        }
        Opcode::LifetimeEnd => return,
        _ => {}
    }

    let r = result(fb, inst);
    if fb.is_const_val(r) {
        return;
    }
    let ty = float_ty(fb, x);

    match op {
        Opcode::Fneg => {
            let dr = fb.get_diffe(r, block);
            let delta = rev_cursor(fb, block).fneg(dr);
            fb.add_to_diffe(x, delta, block);
        }
        Opcode::Floor | Opcode::Ceil | Opcode::Ftrunc | Opcode::Round => {
            // Piecewise constant: no contribution.
        }
        Opcode::Sqrt => {
            let dr = fb.get_diffe(r, block);
            let rv = fb.lookup(r, block);
            let mut cur = rev_cursor(fb, block);
            let half = cur.fconst(ty, 0.5);
            let scaled = cur.fmul(half, dr);
            let delta = cur.fdiv(scaled, rv);
            fb.add_to_diffe(x, delta, block);
        }
        Opcode::Fabs => {
            let dr = fb.get_diffe(r, block);
            let xv = fb.lookup(x, block);
            let mut cur = rev_cursor(fb, block);
            let zero = cur.zero(ty);
            let negative = cur.binary(Opcode::Flt, xv, zero);
            let neg = cur.fneg(dr);
            let delta = cur.select(negative, neg, dr);
            fb.add_to_diffe(x, delta, block);
        }
        Opcode::Sin => {
            let dr = fb.get_diffe(r, block);
            let xv = fb.lookup(x, block);
            let mut cur = rev_cursor(fb, block);
            let cos = cur.unary(Opcode::Cos, xv);
            let delta = cur.fmul(dr, cos);
            fb.add_to_diffe(x, delta, block);
        }
        Opcode::Cos => {
            let dr = fb.get_diffe(r, block);
            let xv = fb.lookup(x, block);
            let mut cur = rev_cursor(fb, block);
            let sin = cur.unary(Opcode::Sin, xv);
            let scaled = cur.fmul(dr, sin);
            let delta = cur.fneg(scaled);
            fb.add_to_diffe(x, delta, block);
        }
        Opcode::Exp => {
            let dr = fb.get_diffe(r, block);
            let rv = fb.lookup(r, block);
            let delta = rev_cursor(fb, block).fmul(dr, rv);
            fb.add_to_diffe(x, delta, block);
        }
        Opcode::Exp2 => {
            let dr = fb.get_diffe(r, block);
            let rv = fb.lookup(r, block);
            let mut cur = rev_cursor(fb, block);
            let ln2 = cur.fconst(ty, std::f64::consts::LN_2);
            let scaled = cur.fmul(dr, rv);
            let delta = cur.fmul(scaled, ln2);
            fb.add_to_diffe(x, delta, block);
        }
        Opcode::Log | Opcode::Log2 | Opcode::Log10 => {
            let dr = fb.get_diffe(r, block);
            let xv = fb.lookup(x, block);
            let mut cur = rev_cursor(fb, block);
            let denom = match op {
                Opcode::Log => xv,
                Opcode::Log2 => {
                    let c = cur.fconst(ty, std::f64::consts::LN_2);
                    cur.fmul(xv, c)
                }
                _ => {
                    let c = cur.fconst(ty, std::f64::consts::LN_10);
                    cur.fmul(xv, c)
                }
            };
            let delta = cur.fdiv(dr, denom);
            fb.add_to_diffe(x, delta, block);
        }
        _ => fatal!("unknown intrinsic {}", fb.src.dfg.display_inst(inst)),
    }
    fb.zero_diffe(r, block);
}

fn reverse_cast(fb: &mut FnBuilder, inst: Inst, op: Opcode, x: Value, _to: Type, block: Block) {
    if op == Opcode::Load {
        return reverse_load(fb, inst, x, block);
    }
    if op == Opcode::Splat {
        return reverse_splat(fb, inst, x, block);
    }

    let r = result(fb, inst);
    if fb.is_const_val(r) {
        return;
    }
    let from_ty = fb.src.dfg.value_ty(x);

    match op {
        Opcode::Fpext => {
            let dr = fb.get_diffe(r, block);
            let delta = rev_cursor(fb, block).cast(Opcode::Fptrunc, dr, from_ty);
            fb.add_to_diffe(x, delta, block);
        }
        Opcode::Fptrunc => {
            let dr = fb.get_diffe(r, block);
            let delta = rev_cursor(fb, block).cast(Opcode::Fpext, dr, from_ty);
            fb.add_to_diffe(x, delta, block);
        }
        Opcode::Bitcast => {
            if from_ty.is_ptr() {
                // Pointer-typed casts are opaque to the differential.
                return;
            }
            let dr = fb.get_diffe(r, block);
            let delta = rev_cursor(fb, block).cast(Opcode::Bitcast, dr, from_ty);
            fb.add_to_diffe(x, delta, block);
        }
        Opcode::Itrunc => {
            // Truncation of float bits: widen the differential back.
            let dr = fb.get_diffe(r, block);
            let delta = rev_cursor(fb, block).cast(Opcode::Zext, dr, from_ty);
            fb.add_to_diffe(x, delta, block);
        }
        Opcode::Zext => {
            let dr = fb.get_diffe(r, block);
            let delta = rev_cursor(fb, block).cast(Opcode::Itrunc, dr, from_ty);
            fb.add_to_diffe(x, delta, block);
        }
        Opcode::Ptrtoint | Opcode::Inttoptr => return,
        Opcode::Sitofp | Opcode::Fptosi => {
            fatal!(
                "active discrete/continuous conversion {}",
                fb.src.dfg.display_inst(inst)
            )
        }
        _ => fatal!("unknown cast {}", fb.src.dfg.display_inst(inst)),
    }
    fb.zero_diffe(r, block);
}

fn reverse_load(fb: &mut FnBuilder, inst: Inst, ptr: Value, block: Block) {
    let r = result(fb, inst);
    if fb.is_const_val(r) {
        return;
    }
    let ty = fb.src.dfg.value_ty(r);
    if ty.is_ptr() {
        // Pointer loads participate through the shadow map only.
        return;
    }
    if !ty.is_float() && !fb.typeinfo.is_secret_float(r) {
        return;
    }

    // d(*p) += d(L); d(L) := 0
    let shadow_ptr = fb.lookup_shadow(ptr, block);
    let dr = fb.get_diffe(r, block);
    let mut cur = rev_cursor(fb, block);
    let old = cur.load(ty, shadow_ptr);
    let sum = if ty.is_float() {
        cur.fadd(old, dr)
    } else {
        let old_f = cur.cast(Opcode::Bitcast, old, Type::F64);
        let dr_f = cur.cast(Opcode::Bitcast, dr, Type::F64);
        let sum = cur.fadd(old_f, dr_f);
        cur.cast(Opcode::Bitcast, sum, ty)
    };
    cur.store(sum, shadow_ptr);
    fb.zero_diffe(r, block);
}

fn reverse_store(fb: &mut FnBuilder, value: Value, ptr: Value, block: Block) {
    let ty = fb.src.dfg.value_ty(value);
    let is_float = ty.is_float() || fb.typeinfo.is_secret_float(value);
    if !is_float {
        // Pointer/integer stores were mirrored into the shadow in the
        // forward pass; nothing flows backwards.
        return;
    }

    let shadow_ptr = fb.lookup_shadow(ptr, block);
    if fb.is_const_val(value) {
        // The store overwrote the location: its cotangent dies here.
        let mut cur = rev_cursor(fb, block);
        let zero = cur.zero(ty);
        cur.store(zero, shadow_ptr);
    } else {
        let mut cur = rev_cursor(fb, block);
        let dif = cur.load(ty, shadow_ptr);
        let zero = cur.zero(ty);
        cur.store(zero, shadow_ptr);
        fb.add_to_diffe(value, dif, block);
    }
}

fn reverse_ternary(fb: &mut FnBuilder, inst: Inst, op: Opcode, args: [Value; 3], block: Block) {
    match op {
        Opcode::Select => reverse_select(fb, inst, args, block),
        Opcode::Memcpy | Opcode::Memmove => reverse_memtransfer(fb, op, args, block),
        Opcode::Memset => {
            // Forward already cleared the shadow destination.
        }
        _ => fatal!("unknown ternary {}", fb.src.dfg.display_inst(inst)),
    }
}

fn reverse_select(fb: &mut FnBuilder, inst: Inst, args: [Value; 3], block: Block) {
    let r = result(fb, inst);
    if fb.is_const_val(r) || fb.src.dfg.value_ty(r).is_ptr() {
        return;
    }
    let [c, a, b] = args;
    let ty = fb.src.dfg.value_ty(r);
    let dr = fb.get_diffe(r, block);
    let cv = fb.lookup(c, block);
    let mut cur = rev_cursor(fb, block);
    let zero = cur.zero(ty);
    let da = cur.select(cv, dr, zero);
    let db = cur.select(cv, zero, dr);
    fb.add_to_diffe(a, da, block);
    fb.add_to_diffe(b, db, block);
    fb.zero_diffe(r, block);
}

fn reverse_memtransfer(
    fb: &mut FnBuilder,
    op: Opcode,
    args: [Value; 3],
    block: Block,
) {
    let [dst, src, len] = args;
    let pointee = fb.typeinfo.pointee(dst).or_else(|| fb.typeinfo.pointee(src));
    let elem = match pointee {
        Some(ty) if ty.is_float() => ty.lane_ty(),
        // Non-float transfers were mirrored into the shadows forward.
        _ => return,
    };

    let routine = match (op, elem) {
        (Opcode::Memcpy, Type::F64) => runtime::MEMCPY_ADD_F64,
        (Opcode::Memcpy, _) => runtime::MEMCPY_ADD_F32,
        (Opcode::Memmove, Type::F64) => runtime::MEMMOVE_ADD_F64,
        (Opcode::Memmove, _) => runtime::MEMMOVE_ADD_F32,
        _ => unreachable!(),
    };
    let routine = fb.import_runtime(routine);

    let shadow_dst = fb.lookup_shadow(dst, block);
    if fb.is_const_val(src) {
        // The copy overwrote the region with inactive data: its
        // cotangent dies here.
        let len_v = fb.lookup(len, block);
        let mut cur = rev_cursor(fb, block);
        let zero = cur.iconst(Type::I64, 0);
        cur.memset(shadow_dst, zero, len_v);
        return;
    }
    let shadow_src = fb.lookup_shadow(src, block);
    let len_v = fb.lookup(len, block);
    let mut cur = rev_cursor(fb, block);
    let shift = cur.iconst(Type::I64, if elem == Type::F64 { 3 } else { 2 });
    let count = cur.binary(Opcode::Lshr, len_v, shift);
    cur.call(routine, &[shadow_dst, shadow_src, count]);
}

fn reverse_extract(fb: &mut FnBuilder, inst: Inst, agg: Value, lane: u8, block: Block) {
    let r = result(fb, inst);
    if fb.is_const_val(r) {
        return;
    }
    let agg_ty = fb.src.dfg.value_ty(agg);
    let dr = fb.get_diffe(r, block);
    let mut cur = rev_cursor(fb, block);
    let zero_vec = cur.zero(agg_ty);
    let delta = cur.insert_lane(zero_vec, dr, lane);
    fb.add_to_diffe(agg, delta, block);
    fb.zero_diffe(r, block);
}

fn reverse_insert(fb: &mut FnBuilder, inst: Inst, args: [Value; 2], lane: u8, block: Block) {
    let r = result(fb, inst);
    if fb.is_const_val(r) {
        return;
    }
    let [agg, elem] = args;
    let dr = fb.get_diffe(r, block);
    let mut cur = rev_cursor(fb, block);
    let d_elem = cur.extract(dr, lane);
    let elem_ty = cur.func.dfg.value_ty(d_elem);
    let zero = cur.zero(elem_ty);
    let d_agg = cur.insert_lane(dr, zero, lane);
    fb.add_to_diffe(elem, d_elem, block);
    fb.add_to_diffe(agg, d_agg, block);
    fb.zero_diffe(r, block);
}

fn reverse_shuffle(fb: &mut FnBuilder, inst: Inst, args: [Value; 2], mask: u32, block: Block) {
    let r = result(fb, inst);
    if fb.is_const_val(r) {
        return;
    }
    let [a, b] = args;
    let out_lanes = fb.src.dfg.value_ty(r).lanes();
    let in_lanes = fb.src.dfg.value_ty(a).lanes();
    let a_ty = fb.src.dfg.value_ty(a);
    let b_ty = fb.src.dfg.value_ty(b);

    let dr = fb.get_diffe(r, block);
    let mut cur = rev_cursor(fb, block);
    let mut d_a = cur.zero(a_ty);
    let mut d_b = cur.zero(b_ty);
    for out_idx in 0..out_lanes {
        let sel = ((mask >> (8 * out_idx)) & 0xff) as u8;
        if sel == 0xff {
            continue;
        }
        let routed = cur.extract(dr, out_idx);
        if sel < in_lanes {
            let old = cur.extract(d_a, sel);
            let sum = cur.fadd(old, routed);
            d_a = cur.insert_lane(d_a, sum, sel);
        } else {
            let lane = sel - in_lanes;
            let old = cur.extract(d_b, lane);
            let sum = cur.fadd(old, routed);
            d_b = cur.insert_lane(d_b, sum, lane);
        }
    }
    fb.add_to_diffe(a, d_a, block);
    fb.add_to_diffe(b, d_b, block);
    fb.zero_diffe(r, block);
}

fn reverse_splat(fb: &mut FnBuilder, inst: Inst, x: Value, block: Block) {
    let r = result(fb, inst);
    if fb.is_const_val(r) {
        return;
    }
    let lanes = fb.src.dfg.value_ty(r).lanes();
    let dr = fb.get_diffe(r, block);
    let mut cur = rev_cursor(fb, block);
    let mut sum = cur.extract(dr, 0);
    for lane in 1..lanes {
        let part = cur.extract(dr, lane);
        sum = cur.fadd(sum, part);
    }
    fb.add_to_diffe(x, sum, block);
    fb.zero_diffe(r, block);
}
