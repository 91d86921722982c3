//! The terminator inverter: phi adjoints keyed on the taken-predecessor
//! indicator, reverse branch dispatch, loop countdowns driven by the
//! cached induction counter, and the select/xor peephole.

use lir::cursor::FuncCursor;
use lir::{Block, Function, Inst, InstructionData, Opcode, Type, Value, ValueDef};

use crate::transform::FnBuilder;
use crate::{fatal, runtime};

/// The boolean "came from `pred`" flag valid in the reverse block of
/// `block`.
fn pred_flag(fb: &mut FnBuilder, block: Block, pred: Block) -> Value {
    if let Some(lp) = fb.fwd_loops.get(&block).map(|_| fb.loops.by_header(block)) {
        let (preheader, latch) = (lp.preheader, lp.latch);
        let av = fb.rev_loops[&block].av;
        let rev_block = fb.rev_map[block].expand().expect("no reverse block");
        let mut cur = FuncCursor::at_end(&mut fb.fx, rev_block);
        let zero = cur.iconst(Type::I64, 0);
        let first = cur.ieq(av, zero);
        return if pred == preheader {
            first
        } else {
            debug_assert_eq!(pred, latch);
            let t = cur.bconst(true);
            cur.binary(Opcode::Bxor, first, t)
        };
    }

    let source = match fb.indicators.get(&block) {
        Some(source) => source.clone(),
        None => fatal!("block {} has no predecessor indicator", block),
    };
    let indicator = fb.fetch(&source, block);
    let idx = pred_index(fb, block, pred);
    let rev_block = fb.rev_map[block].expand().expect("no reverse block");
    let mut cur = FuncCursor::at_end(&mut fb.fx, rev_block);
    let idx_val = cur.iconst(Type::I64, idx as i64);
    cur.ieq(indicator, idx_val)
}

fn pred_index(fb: &FnBuilder, block: Block, pred: Block) -> usize {
    fb.cfg
        .pred_iter(block)
        .position(|p| p == pred)
        .expect("not a predecessor")
}

/// Route the accumulated cotangent of every phi of `block` into the
/// incoming values, selected by the taken predecessor.
pub(crate) fn reverse_phis(fb: &mut FnBuilder, block: Block) {
    let phis: Vec<Inst> = fb
        .src
        .layout
        .block_insts(block)
        .take_while(|inst| fb.src.dfg[*inst].opcode() == Opcode::Phi)
        .collect();

    // Back-to-front, like the rest of the reverse pass.
    for phi in phis.into_iter().rev() {
        if fb.is_const_inst(phi) {
            continue;
        }
        let result = fb.src.dfg.first_result(phi);
        if fb.is_const_val(result) {
            continue;
        }
        let ty = fb.src.dfg.value_ty(result);
        if ty.is_ptr() {
            // Pointer phis participate through the shadow map.
            continue;
        }

        let edges: Vec<(Block, Value)> = fb.src.dfg.phi_edges(phi).collect();
        let dif = fb.get_diffe(result, block);
        fb.zero_diffe(result, block);

        if let [(_, only)] = edges[..] {
            fb.add_to_diffe(only, dif, block);
            continue;
        }

        for (pred, incoming) in edges {
            if fb.is_const_val(incoming) {
                continue;
            }
            let flag = pred_flag(fb, block, pred);
            let rev_block = fb.rev_map[block].expand().expect("no reverse block");
            let mut cur = FuncCursor::at_end(&mut fb.fx, rev_block);
            let zero = cur.zero(ty);
            let routed = cur.select(flag, dif, zero);
            fb.add_to_diffe(incoming, routed, block);
        }
    }
}

/// Emit the reverse terminator of `block`: a branch to the reverse block
/// of whichever predecessor the forward pass came from. The caller has
/// already emitted all adjoints of the block.
pub(crate) fn invert_terminator(fb: &mut FnBuilder, block: Block) {
    let preds: Vec<Block> = fb
        .cfg
        .pred_iter(block)
        .filter(|pred| fb.domtree.is_reachable(*pred))
        .collect();

    if preds.is_empty() {
        // The entry block: the builder emits the packing return.
        return;
    }

    if fb.fwd_loops.contains_key(&block) {
        return invert_loop_header(fb, block, &preds);
    }

    match preds[..] {
        [only] => {
            let target = dispatch_target(fb, block, only);
            let rev_block = fb.rev_map[block].expand().expect("no reverse block");
            FuncCursor::at_end(&mut fb.fx, rev_block).jump(target);
        }
        _ => dispatch_chain(fb, block, &preds),
    }
}

/// Loop headers countdown: back to the preheader's reverse block once
/// the counter hits zero, into the latch's reverse block otherwise.
fn invert_loop_header(fb: &mut FnBuilder, block: Block, preds: &[Block]) {
    let lp = fb.loops.by_header(block);
    let (preheader, latch) = (lp.preheader, lp.latch);
    debug_assert!(preds.iter().all(|p| *p == preheader || *p == latch));

    let av = fb.rev_loops[&block].av;
    let pre_target = dispatch_target(fb, block, preheader);
    let latch_target = dispatch_target(fb, block, latch);
    let rev_block = fb.rev_map[block].expand().expect("no reverse block");
    let mut cur = FuncCursor::at_end(&mut fb.fx, rev_block);
    let zero = cur.iconst(Type::I64, 0);
    let done = cur.ieq(av, zero);
    cur.br(done, pre_target, latch_target);
}

/// The reverse block of `pred`, with the countdown-phi bookkeeping when
/// `pred` is itself a loop header: jumping into a reverse header feeds
/// its remaining-iterations phi.
fn dispatch_target(fb: &mut FnBuilder, from: Block, pred: Block) -> Block {
    let target = match fb.rev_map[pred].expand() {
        Some(target) => target,
        None => fatal!("predecessor {} has no reverse block", pred),
    };
    if let Some(rev_lp) = fb.rev_loops.get(&pred) {
        let av_phi = rev_lp.av;
        // Entering the countdown: from inside the loop the next count is
        // av - 1; from the loop exit it starts at the trip count.
        let in_loop =
            fb.loops.containing(from).map(|lp| lp.header == pred).unwrap_or(false);
        let edge_val = if in_loop {
            fb.rev_loops[&pred].av_dec
        } else {
            let n_slot = fb.fwd_loops[&pred].n_slot;
            let rev_from = fb.rev_map[from].expand().expect("no reverse block");
            let mut cur = FuncCursor::at_end(&mut fb.fx, rev_from);
            cur.stack_load(n_slot)
        };
        let phi_inst = match fb.fx.dfg.value_def(av_phi) {
            ValueDef::Result(inst, _) => inst,
            ValueDef::Param(..) => unreachable!(),
        };
        let rev_from = fb.rev_map[from].expand().expect("no reverse block");
        fb.fx.dfg.append_phi_edge(phi_inst, rev_from, edge_val);
    }
    target
}

/// Two or more predecessors dispatch on the cached indicator through a
/// compare chain of fresh blocks.
fn dispatch_chain(fb: &mut FnBuilder, block: Block, preds: &[Block]) {
    if preds.len() > 2 && preds.iter().any(|pred| fb.rev_loops.contains_key(pred)) {
        // The countdown phi would need its edge on a chain block.
        fatal!("block {} mixes a wide predecessor set with a loop header", block);
    }
    let mut targets = Vec::with_capacity(preds.len());
    for pred in preds {
        targets.push(dispatch_target(fb, block, *pred));
    }

    // Fetch the indicator once, in the primary reverse block: it
    // dominates every block of the chain.
    let source = match fb.indicators.get(&block) {
        Some(source) => source.clone(),
        None => fatal!("block {} has no predecessor indicator", block),
    };
    let indicator = fb.fetch(&source, block);
    let indices: Vec<usize> = preds.iter().map(|p| pred_index(fb, block, *p)).collect();

    let mut current = fb.rev_map[block].expand().expect("no reverse block");
    for idx in 0..preds.len() - 1 {
        let last = idx == preds.len() - 2;
        let mut cur = FuncCursor::at_end(&mut fb.fx, current);
        let idx_val = cur.iconst(Type::I64, indices[idx] as i64);
        let flag = cur.ieq(indicator, idx_val);
        if last {
            cur.br(flag, targets[idx], targets[idx + 1]);
        } else {
            let next = cur.func.dfg.make_block();
            cur.func.layout.append_block(next);
            cur.br(flag, targets[idx], next);
            current = next;
        }
    }
}

/// Release the iteration buffers of every loop whose preheader is
/// `block`: by the time the preheader's reverse runs, the loop's reverse
/// pass is complete.
pub(crate) fn release_arr_buffers(fb: &mut FnBuilder, block: Block) {
    let frees = match fb.pending_arr_frees.get(&block) {
        Some(frees) => frees.clone(),
        None => return,
    };
    for handle_src in frees {
        let handle = fb.fetch(&handle_src, block);
        let free_fn = fb.import_runtime(runtime::ARR_FREE);
        let rev_block = fb.rev_map[block].expand().expect("no reverse block");
        FuncCursor::at_end(&mut fb.fx, rev_block).call(free_fn, &[handle]);
    }
}

/// Rewrite `select(bxor(x, true), a, b)` into `select(x, b, a)`.
pub(crate) fn select_xor_cleanup(func: &mut Function) {
    let blocks: Vec<Block> = func.layout.blocks().collect();
    for block in blocks {
        let insts: Vec<Inst> = func.layout.block_insts(block).collect();
        for inst in insts {
            let (cond, then_val, else_val) = match func.dfg[inst] {
                InstructionData::Ternary { op: Opcode::Select, args } => {
                    (args[0], args[1], args[2])
                }
                _ => continue,
            };
            let cond_inst = match func.dfg.value_def(cond) {
                ValueDef::Result(inst, _) => inst,
                ValueDef::Param(..) => continue,
            };
            let negated = match func.dfg[cond_inst] {
                InstructionData::Binary { op: Opcode::Bxor, args } => {
                    match func.dfg.value_def(args[1]) {
                        ValueDef::Result(imm_inst, _) => match func.dfg[imm_inst] {
                            InstructionData::UnaryBool { imm: true } => Some(args[0]),
                            _ => None,
                        },
                        ValueDef::Param(..) => None,
                    }
                }
                _ => None,
            };
            if let Some(plain) = negated {
                func.dfg.update_inst(
                    inst,
                    InstructionData::Ternary {
                        op: Opcode::Select,
                        args: [plain, else_val, then_val],
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lir::cursor::FuncCursor;
    use lir::{AbiParam, FunctionSignature, Type};

    #[test]
    fn select_through_negation_swaps_arms() {
        let sig = FunctionSignature::new(
            "peep",
            vec![AbiParam::new(Type::I1), AbiParam::new(Type::F64), AbiParam::new(Type::F64)],
            vec![Type::F64],
        );
        let mut func = lir::Function::with_signature(sig);
        let entry = func.create_entry_block();
        let (cond, a, b) = {
            let params = func.params();
            (params[0], params[1], params[2])
        };
        let selected = {
            let mut cur = FuncCursor::at_end(&mut func, entry);
            let t = cur.bconst(true);
            let negated = cur.binary(Opcode::Bxor, cond, t);
            let selected = cur.select(negated, a, b);
            cur.ret(&[selected]);
            selected
        };

        select_xor_cleanup(&mut func);

        let select_inst = func.dfg.value_def(selected).unwrap_inst();
        match func.dfg[select_inst] {
            InstructionData::Ternary { op: Opcode::Select, args } => {
                assert_eq!(args[0], cond);
                assert_eq!(args[1], b);
                assert_eq!(args[2], a);
            }
            _ => panic!("not a select"),
        }
    }
}
