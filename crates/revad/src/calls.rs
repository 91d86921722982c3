//! The call-site transformer: the recursive core that decides whether a
//! call needs an augmented primal, threads shadow pointers and tapes,
//! handles allocations and frees, and in the combined mode may fuse a
//! tail call's forward and reverse passes into one gradient call.

use lir::cursor::FuncCursor;
use lir::{AbiParam, Block, FuncId, FunctionSignature, Inst, Module, Opcode, Type, Value};
use tracing::warn;

use crate::builders::{create_augmented_primal, create_primal_and_gradient};
use crate::transform::FnBuilder;
use crate::{classify_callee, fatal, AdContext, ArgClass, DerivativeMode, KnownCallee, SigKey};

/// How each callee formal participates, derived from the signature key.
pub(crate) fn arg_classes(sig: &FunctionSignature, const_args: &[bool]) -> Vec<ArgClass> {
    sig.params
        .iter()
        .enumerate()
        .map(|(idx, param)| {
            if const_args.get(idx).copied().unwrap_or(false) {
                ArgClass::Constant
            } else if param.ty.is_ptr() {
                ArgClass::DupArg
            } else if param.ty.is_float() {
                ArgClass::OutDiff
            } else {
                ArgClass::Constant
            }
        })
        .collect()
}

/// Whether a call must be paired with an augmented primal: anything
/// that may read memory, returns a cacheable pointer, or writes through
/// an active pointer argument.
pub(crate) fn should_augment(fb: &FnBuilder, module: &Module, inst: Inst, block: Block) -> bool {
    if fb.unreachable.contains(block) {
        return false;
    }
    let sig = fb.src.dfg.call_signature(inst).expect("not a call");
    if sig.effects.may_read() {
        return true;
    }
    // Unknown or bodyless callees are handled pessimistically.
    if module.lookup_func(&sig.name).is_none() {
        return true;
    }
    for result in fb.src.dfg.inst_results(inst) {
        let ty = fb.src.dfg.value_ty(*result);
        if !ty.is_float() && !fb.is_const_val(*result) {
            return true;
        }
    }
    for (idx, arg) in fb.src.dfg.inst_args(inst).iter().enumerate() {
        let ty = fb.src.dfg.value_ty(*arg);
        if !ty.is_float() && !fb.is_const_val(*arg) {
            let attrs = &sig.params[idx];
            if !attrs.readonly && !attrs.readnone {
                return true;
            }
        }
    }
    false
}

/// The signature key a call site requests of its callee.
pub(crate) fn call_key(
    fb: &FnBuilder,
    ctx: &AdContext,
    module: &Module,
    inst: Inst,
) -> (FuncId, SigKey) {
    let sig = fb.src.dfg.call_signature(inst).expect("not a call");
    let callee = match module.lookup_func(&sig.name) {
        Some(callee) => callee,
        None => fatal!("cannot differentiate call to unknown function %{}", sig.name),
    };
    let args = fb.src.dfg.inst_args(inst);
    let const_args: Vec<bool> = args.iter().map(|arg| fb.is_const_val(*arg)).collect();
    let uncacheable_args =
        fb.uncacheable_args.get(&inst).cloned().unwrap_or_else(|| vec![false; args.len()]);
    let results = fb.src.dfg.inst_results(inst);
    let return_used = results.iter().any(|res| !fb.uses[*res].is_empty());
    let differential_return = results
        .first()
        .map(|res| fb.src.dfg.value_ty(*res).is_float() && !fb.is_const_val(*res))
        .unwrap_or(false);
    let key = SigKey {
        func: callee,
        const_args,
        uncacheable_args,
        return_used,
        differential_return,
        type_fingerprint: ctx.type_fingerprint(callee),
    };
    (callee, key)
}

/// Forward-pass handling of one call site (augmented and combined
/// modes). The split gradient handles calls through tape bindings and
/// never calls this.
pub(crate) fn forward_call(
    fb: &mut FnBuilder,
    ctx: &mut AdContext,
    module: &mut Module,
    inst: Inst,
    block: Block,
) {
    let sig = fb.src.dfg.call_signature(inst).expect("not a call").clone();
    match classify_callee(&sig.name) {
        KnownCallee::PassThrough => {
            clone_call(fb, inst, block);
        }
        KnownCallee::Alloc => forward_alloc(fb, inst, block, &sig),
        KnownCallee::Dealloc => forward_free(fb, inst, block),
        KnownCallee::Generic => {
            if fb.is_const_inst(inst) || fb.unreachable.contains(block) {
                clone_call(fb, inst, block);
                return;
            }
            if fb.mode == DerivativeMode::Both && try_fuse_combined(fb, ctx, module, inst, block)
            {
                return;
            }
            forward_generic(fb, ctx, module, inst, block);
        }
    }
}

/// Clone a call as-is into the forward region.
pub(crate) fn clone_call(fb: &mut FnBuilder, inst: Inst, block: Block) {
    let sig = fb.src.dfg.call_signature(inst).unwrap().clone();
    let args: Vec<Value> =
        fb.src.dfg.inst_args(inst).iter().map(|arg| fb.get_val(*arg)).collect();
    let func_ref = fb.import(sig);
    let mut cur = fb.cursor_in_fwd_block(block);
    let new_inst = cur.call(func_ref, &args);
    let new_results: Vec<Value> = fb.fx.dfg.inst_results(new_inst).to_vec();
    let orig_results: Vec<Value> = fb.src.dfg.inst_results(inst).to_vec();
    for (orig, new) in orig_results.iter().zip(&new_results) {
        fb.set_val(*orig, *new);
    }
    let constant = fb.is_const_inst(inst);
    fb.tag_activity(new_inst, constant);
}

/// `malloc`/`calloc`: clone, and pair an active result with a zeroed
/// anti-allocation in the shadow.
fn forward_alloc(fb: &mut FnBuilder, inst: Inst, block: Block, sig: &FunctionSignature) {
    clone_call(fb, inst, block);
    let result = fb.src.dfg.first_result(inst);
    if fb.is_const_val(result) {
        return;
    }

    let args: Vec<Value> =
        fb.src.dfg.inst_args(inst).iter().map(|arg| fb.get_val(*arg)).collect();
    let func_ref = fb.import(sig.clone());
    let shadow = {
        let mut cur = fb.cursor_in_fwd_block(block);
        let call = cur.call(func_ref, &args);
        let shadow = cur.func.dfg.first_result(call);
        // The anti-allocation starts as zero cotangent.
        let len = match args.len() {
            1 => args[0],
            _ => cur.binary(Opcode::Imul, args[0], args[1]),
        };
        let zero = cur.iconst(Type::I64, 0);
        cur.memset(shadow, zero, len);
        shadow
    };
    fb.register_shadow(result, shadow, block);

    // The primal pointer cannot be rebuilt later; save it (and the
    // shadow) for the reverse pass.
    let fx_result = fb.get_val(result);
    if fb.mode == DerivativeMode::Forward {
        fb.cache_primal(inst, crate::CacheKind::Primal, Some(result), fx_result, block);
        fb.cache_primal(inst, crate::CacheKind::Shadow, Some(result), shadow, block);
    } else {
        let source = fb.transfer_emitted(fx_result, block);
        fb.rev_sources.insert(result, source);
    }
}

/// `free`: erased in the forward pass (the reverse pass still needs the
/// allocation), re-emitted in reverse after last use. Inactive frees
/// pass through; a free of a literal null is dropped with a warning.
fn forward_free(fb: &mut FnBuilder, inst: Inst, block: Block) {
    let arg = fb.src.dfg.inst_args(inst)[0];
    if is_null(fb, arg) {
        warn!("dropping free of null pointer: {}", fb.src.dfg.display_inst(inst));
        return;
    }
    if fb.is_const_val(arg) {
        clone_call(fb, inst, block);
        return;
    }
    // Erased: the buffer must survive into the reverse pass.
}

fn is_null(fb: &FnBuilder, v: Value) -> bool {
    match fb.src.dfg.value_def(v) {
        lir::ValueDef::Result(inst, _) => {
            fb.src.dfg[inst].opcode() == Opcode::Nullptr
        }
        _ => false,
    }
}

/// The generic augmented path: recurse into `CreateAugmentedPrimal`,
/// emit the augmented call with shadow arguments, extract tape, primal
/// and shadow returns.
fn forward_generic(
    fb: &mut FnBuilder,
    ctx: &mut AdContext,
    module: &mut Module,
    inst: Inst,
    block: Block,
) {
    let (_callee, key) = call_key(fb, ctx, module, inst);
    let classes = {
        let sig = fb.src.dfg.call_signature(inst).unwrap();
        arg_classes(sig, &key.const_args)
    };

    if !should_augment(fb, module, inst, block) {
        // No memory to cache: the forward pass runs the original callee.
        clone_call(fb, inst, block);
        let orig_results: Vec<Value> = fb.src.dfg.inst_results(inst).to_vec();
        if let Some(orig) = orig_results.first() {
            if fb.is_needed(*orig) {
                if orig_results.len() > 1 {
                    fatal!("multi-value call results cannot be cached: {}",
                        fb.src.dfg.display_inst(inst));
                }
                let fx_val = fb.get_val(*orig);
                if fb.mode == DerivativeMode::Forward {
                    fb.cache_primal(inst, crate::CacheKind::Primal, Some(*orig), fx_val, block);
                } else {
                    fb.register_transfer(*orig, fx_val, block);
                }
            }
        }
        return;
    }

    let aug = create_augmented_primal(ctx, module, key.clone());

    // Assemble `{original_args, shadow_args...}`.
    let orig_args: Vec<Value> = fb.src.dfg.inst_args(inst).to_vec();
    let mut args: Vec<Value> = orig_args.iter().map(|arg| fb.get_val(*arg)).collect();
    for (idx, class) in classes.iter().enumerate() {
        if *class == ArgClass::DupArg {
            let shadow = fb.shadow_fwd(orig_args[idx], block);
            args.push(shadow);
        }
    }

    let callee_sig = module.funcs[aug.func].sig.clone();
    let func_ref = fb.import(callee_sig);
    let call = {
        let mut cur = fb.cursor_in_fwd_block(block);
        cur.call(func_ref, &args)
    };
    fb.tag_activity(call, false);
    let results: Vec<Value> = fb.fx.dfg.inst_results(call).to_vec();

    // Tape values into this function's tape.
    let tape_values: Vec<Value> = results[aug.tape_value_range()].to_vec();
    fb.cache_sub_tape(inst, &tape_values, block);

    // Substitute the primal return.
    let orig_results: Vec<Value> = fb.src.dfg.inst_results(inst).to_vec();
    if let Some(idx) = aug.primal_return_index() {
        if let Some(orig) = orig_results.first() {
            fb.set_val(*orig, results[idx]);
        }
    }

    // A returned active pointer carries a shadow.
    if let Some(idx) = aug.shadow_return_index() {
        if let Some(orig) = orig_results.first() {
            fb.register_shadow(*orig, results[idx], block);
            if fb.mode == DerivativeMode::Forward {
                fb.cache_primal(inst, crate::CacheKind::Shadow, Some(*orig), results[idx], block);
            }
        }
    }

    // The primal result itself must reach the reverse pass when anything
    // there consumes it.
    if let Some(orig) = orig_results.first() {
        if key.return_used && fb.mode == DerivativeMode::Forward {
            let fx_val = fb.get_val(*orig);
            fb.cache_primal(inst, crate::CacheKind::Primal, Some(*orig), fx_val, block);
        } else if key.return_used && fb.mode == DerivativeMode::Both {
            let fx_val = fb.get_val(*orig);
            fb.register_transfer(*orig, fx_val, block);
        }
    }

    fb.sub_augmented.insert(inst, aug);
}

/// Combined-mode fusion: a call in the return block whose trailing
/// window is benign collapses into one primal-and-gradient call seeded
/// directly by the caller's incoming cotangent.
fn try_fuse_combined(
    fb: &mut FnBuilder,
    ctx: &mut AdContext,
    module: &mut Module,
    inst: Inst,
    block: Block,
) -> bool {
    if block != fb.ret_block || !fb.differential_return {
        return false;
    }
    let seed = match fb.seed {
        Some(seed) => seed,
        None => return false,
    };

    // The post-create window: everything between the call and the
    // terminator must move past the call, so it may not observe the
    // call's memory effects or feed the reverse pass of anything later.
    let mut at = fb.src.layout.next_inst(inst);
    while let Some(next) = at {
        let opcode = fb.src.dfg[next].opcode();
        if opcode.is_terminator() {
            break;
        }
        if !opcode.is_pure() {
            return false;
        }
        at = fb.src.layout.next_inst(next);
    }

    // Every use of the result must be the return itself ("outside uses"
    // abort the replacement).
    let results: Vec<Value> = fb.src.dfg.inst_results(inst).to_vec();
    let ret_inst = fb.src.layout.last_inst(fb.ret_block).unwrap();
    for result in &results {
        if fb.uses[*result].iter().any(|use_| use_.inst != ret_inst) {
            return false;
        }
    }
    // The fused call is seeded by the caller's cotangent, so the result
    // must flow into the return unscaled.
    let ret_args: Vec<Value> = fb.src.dfg.inst_args(ret_inst).to_vec();
    let returned_directly = match (results.first(), ret_args.first()) {
        (Some(res), Some(ret)) => res == ret && ret_args.len() == 1,
        (None, _) => false,
        _ => false,
    };
    if !returned_directly {
        return false;
    }

    let (_callee, key) = call_key(fb, ctx, module, inst);
    if !key.differential_return {
        return false;
    }
    let classes = {
        let sig = fb.src.dfg.call_signature(inst).unwrap();
        arg_classes(sig, &key.const_args)
    };
    let grad = create_primal_and_gradient(ctx, module, key.clone(), DerivativeMode::Both);

    let orig_args: Vec<Value> = fb.src.dfg.inst_args(inst).to_vec();
    let mut args: Vec<Value> = orig_args.iter().map(|arg| fb.get_val(*arg)).collect();
    for (idx, class) in classes.iter().enumerate() {
        if *class == ArgClass::DupArg {
            let shadow = fb.shadow_fwd(orig_args[idx], block);
            args.push(shadow);
        }
    }
    args.push(seed);

    let callee_sig = module.funcs[grad.func].sig.clone();
    let func_ref = fb.import(callee_sig);
    let mut cur = fb.cursor_in_fwd_block(block);
    let call = cur.call(func_ref, &args);
    let call_results: Vec<Value> = cur.func.dfg.inst_results(call).to_vec();
    fb.tag_activity(call, false);

    // The combined callee leads with the primal return (return_used is
    // true here: the result flows into our return).
    let mut idx = 0;
    if key.return_used {
        let primal = call_results[idx];
        idx += 1;
        if let Some(orig) = results.first() {
            fb.set_val(*orig, primal);
        }
    }
    if grad.shadow_return {
        idx += 1;
    }
    // Remaining values are the out-differentials in argument order.
    for (arg_idx, class) in classes.iter().enumerate() {
        if *class != ArgClass::OutDiff {
            continue;
        }
        let outdiff = call_results[idx];
        idx += 1;
        let orig_arg = orig_args[arg_idx];
        if fb.is_const_val(orig_arg) {
            continue;
        }
        let slot = fb.diffe_slot(orig_arg);
        let mut cur = fb.cursor_in_fwd_block(block);
        let old = cur.stack_load(slot);
        let sum = cur.fadd(old, outdiff);
        cur.stack_store(slot, sum);
    }

    fb.handled_calls.insert(inst);
    true
}

/// Reverse-pass handling of one call site.
pub(crate) fn reverse_call(
    fb: &mut FnBuilder,
    ctx: &mut AdContext,
    module: &mut Module,
    inst: Inst,
    block: Block,
) {
    if fb.handled_calls.contains(&inst) {
        return;
    }
    let sig = fb.src.dfg.call_signature(inst).expect("not a call").clone();
    match classify_callee(&sig.name) {
        KnownCallee::PassThrough => {}
        KnownCallee::Alloc => {
            let result = fb.src.dfg.first_result(inst);
            if fb.is_const_val(result) {
                return;
            }
            // The anti-allocation dies after its last reverse use, which
            // is exactly here (the reverse runs back-to-front).
            let shadow = fb.lookup_shadow(result, block);
            let func_ref = fb.import(free_signature());
            rev_cursor(fb, block).call(func_ref, &[shadow]);
        }
        KnownCallee::Dealloc => {
            let arg = fb.src.dfg.inst_args(inst)[0];
            if is_null(fb, arg) || fb.is_const_val(arg) {
                return;
            }
            // The erased forward free happens now, after the reverse
            // pass is done with the buffer.
            let ptr = fb.lookup(arg, block);
            let func_ref = fb.import(free_signature());
            rev_cursor(fb, block).call(func_ref, &[ptr]);
        }
        KnownCallee::Generic => {
            if fb.is_const_inst(inst) || fb.unreachable.contains(block) {
                return;
            }
            reverse_generic(fb, ctx, module, inst, block);
        }
    }
}

fn free_signature() -> FunctionSignature {
    FunctionSignature::new("free", vec![AbiParam::new(Type::Ptr)], vec![])
}

fn rev_cursor<'f>(fb: &'f mut FnBuilder, block: Block) -> FuncCursor<'f> {
    let rev_block = fb.rev_map[block].expand().expect("no reverse block");
    FuncCursor::at_end(&mut fb.fx, rev_block)
}

fn reverse_generic(
    fb: &mut FnBuilder,
    ctx: &mut AdContext,
    module: &mut Module,
    inst: Inst,
    block: Block,
) {
    let (_callee, key) = call_key(fb, ctx, module, inst);
    let classes = {
        let sig = fb.src.dfg.call_signature(inst).unwrap();
        arg_classes(sig, &key.const_args)
    };
    let grad = create_primal_and_gradient(ctx, module, key.clone(), DerivativeMode::Reverse);

    let orig_args: Vec<Value> = fb.src.dfg.inst_args(inst).to_vec();
    let mut args: Vec<Value> = Vec::with_capacity(orig_args.len() * 2);
    for arg in &orig_args {
        args.push(fb.lookup(*arg, block));
    }
    for (idx, class) in classes.iter().enumerate() {
        if *class == ArgClass::DupArg {
            args.push(fb.lookup_shadow(orig_args[idx], block));
        }
    }

    // Incoming cotangent of the call's float result.
    let results: Vec<Value> = fb.src.dfg.inst_results(inst).to_vec();
    if key.differential_return {
        let result = results[0];
        let seed = fb.get_diffe(result, block);
        fb.zero_diffe(result, block);
        args.push(seed);
    }

    // The tape the augmented call saved.
    if let Some(sources) = fb.sub_tape_sources.get(&inst).cloned() {
        for source in &sources {
            let val = fb.fetch(source, block);
            args.push(val);
        }
    }

    let callee_sig = module.funcs[grad.func].sig.clone();
    let func_ref = fb.import(callee_sig);
    let call = rev_cursor(fb, block).call(func_ref, &args);
    fb.tag_activity(call, false);
    let call_results: Vec<Value> = fb.fx.dfg.inst_results(call).to_vec();

    // Accumulate the out-differentials into the argument cotangents.
    // The return layout comes from the gradient handle, not from a
    // second guess at the callee's rules.
    let mut idx = 0;
    if key.return_used {
        idx += 1;
    }
    if grad.shadow_return {
        idx += 1;
    }
    for (arg_idx, class) in classes.iter().enumerate() {
        if *class != ArgClass::OutDiff {
            continue;
        }
        let outdiff = call_results[idx];
        idx += 1;
        fb.add_to_diffe(orig_args[arg_idx], outdiff, block);
    }
}
