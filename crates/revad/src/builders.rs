//! The augmented-primal and gradient builders: normalize a signature
//! key, memoize, reserve an in-progress entry to absorb recursive
//! self-references, clone and transform the body, collect the tape, and
//! verify the result.

#[cfg(test)]
mod tests;

use std::rc::Rc;

use ahash::{AHashMap, AHashSet};
use bitset::BitSet;
use cranelift_entity::SecondaryMap;
use lir::cursor::FuncCursor;
use lir::{
    compute_uses, AbiParam, Block, ControlFlowGraph, DominatorTree, FuncId, Function,
    FunctionSignature, Module, Opcode, Type, Value, ValueDef,
};
use tracing::debug;

use crate::activity::Activity;
use crate::alias::AliasInfo;
use crate::calls;
use crate::loops::LoopInfo;
use crate::needed::NeededInReverse;
use crate::rules;
use crate::tape::{AugmentedReturn, AugmentedStruct, CacheKind, TapeSlotDesc};
use crate::terminators;
use crate::transform::{FnBuilder, RevSource};
use crate::typeinfo::TypeInfo;
use crate::uncacheable::{uncacheable_call_args, uncacheable_loads};
use crate::unreachable::unreachable_blocks;
use crate::{
    dump_for_diagnostics, fatal, runtime, AdContext, ArgClass, AugmentedState, DerivativeMode,
    SigKey,
};

/// Handle to a synthesized gradient: the function plus the part of its
/// return layout call sites must agree on. Handing this back (instead
/// of a bare `FuncId`) keeps callers from re-deriving the layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Gradient {
    pub func: FuncId,
    /// The return struct carries a shadow pointer after the primal
    /// return: the primal returns a used, non-constant pointer.
    pub shadow_return: bool,
}

/// Differentiate `func` top-level: one fused forward-and-reverse
/// function `(args..., shadow_args..., cotangent?) -> (primal?,
/// shadow?, out_diffs...)`.
pub fn differentiate(
    ctx: &mut AdContext,
    module: &mut Module,
    func: FuncId,
    const_args: &[bool],
    return_used: bool,
) -> FuncId {
    let sig = module.funcs[func].sig.clone();
    let differential_return =
        sig.returns.first().map(|ty| ty.is_float()).unwrap_or(false);
    let key = SigKey {
        func,
        const_args: const_args.to_vec(),
        uncacheable_args: vec![false; sig.params.len()],
        return_used,
        differential_return,
        type_fingerprint: ctx.type_fingerprint(func),
    };
    create_primal_and_gradient(ctx, module, key, DerivativeMode::Both).func
}

/// Memoized construction of the augmented primal for `key`.
pub fn create_augmented_primal(
    ctx: &mut AdContext,
    module: &mut Module,
    key: SigKey,
) -> Rc<AugmentedReturn> {
    if let Some(state) = ctx.augmented.get(&key) {
        return match state {
            AugmentedState::Done(aug) => aug.clone(),
            AugmentedState::InProgress(aug) => {
                // A recursive self-reference: the tape must be boxed.
                let aug = aug.clone();
                ctx.augmented_recursed.insert(key);
                aug
            }
        };
    }

    let src_name = module.funcs[key.func].name().to_owned();
    let name = unique_name(module, &format!("{}.aug", src_name));
    debug!("creating augmented primal {}", name);

    let mut fb = new_builder(ctx, module, key.clone(), DerivativeMode::Forward, &name);
    let shadow_ret = shadow_return_of(&fb);

    // Reserve: recursive requests see a boxed-tape signature.
    let fid = module.reserve_function(&name);
    module.funcs[fid].sig = reserved_signature(&fb, &name, shadow_ret);
    let reserved = Rc::new(AugmentedReturn::reserved(fid, key.clone(), key.return_used, shadow_ret));
    ctx.augmented.insert(key.clone(), AugmentedState::InProgress(reserved));

    forward_pass(&mut fb, ctx, module);
    let aug = augmented_epilogue(&mut fb, ctx, fid, shadow_ret);
    finish(module, fid, fb);

    let aug = Rc::new(aug);
    ctx.augmented.insert(aug.key.clone(), AugmentedState::Done(aug.clone()));
    aug
}

/// Memoized construction of the (primal and) gradient for `key`, either
/// the tape-consuming split form or the fused combined form.
pub fn create_primal_and_gradient(
    ctx: &mut AdContext,
    module: &mut Module,
    key: SigKey,
    mode: DerivativeMode,
) -> Gradient {
    assert!(mode != DerivativeMode::Forward, "gradients are Reverse or Both");
    if let Some(gradient) = ctx.gradients.get(&(key.clone(), mode)) {
        return *gradient;
    }

    let src_name = module.funcs[key.func].name().to_owned();
    let suffix = if mode == DerivativeMode::Both { "diffe" } else { "grad" };
    let name = unique_name(module, &format!("{}.{}", src_name, suffix));
    debug!("creating gradient {}", name);

    let mut fb = new_builder(ctx, module, key.clone(), mode, &name);
    let shadow_ret = shadow_return_of(&fb);

    // The split form reuses the analyses of the augmented pass and binds
    // its tape; the combined form carries everything locally.
    let aug = match mode {
        DerivativeMode::Reverse => match ctx.augmented.get(&key) {
            Some(AugmentedState::Done(aug)) => Some(aug.clone()),
            Some(AugmentedState::InProgress(_)) => {
                fatal!("gradient of %{} requested while its augmentation is in progress", src_name)
            }
            None => None,
        },
        _ => None,
    };
    if let Some(aug) = &aug {
        fb.can_modref = aug.cacheable_load_flags.clone();
        fb.uncacheable_args = aug.uncacheable_args_per_call.clone();
    }

    let sig = gradient_signature(&fb, &name, shadow_ret, aug.as_deref());
    fb.fx.sig = sig.clone();
    let fid = module.reserve_function(&name);
    module.funcs[fid].sig = sig;
    let gradient = Gradient { func: fid, shadow_return: shadow_ret };
    ctx.gradients.insert((key, mode), gradient);

    bind_signature_values(&mut fb, aug.as_deref());
    forward_pass(&mut fb, ctx, module);
    reverse_pass(&mut fb, ctx, module, shadow_ret);
    finish(module, fid, fb);
    gradient
}

fn unique_name(module: &Module, base: &str) -> String {
    if module.lookup_func(base).is_none() {
        return base.to_owned();
    }
    let mut counter = 2;
    loop {
        let name = format!("{}.{}", base, counter);
        if module.lookup_func(&name).is_none() {
            return name;
        }
        counter += 1;
    }
}

/// Does this key's function return an active pointer, i.e. does the
/// synthesized function carry a shadow return? Only a *non-constant*
/// returned pointer has one: a constant pointer was never duplicated,
/// so there is no shadow to extract.
fn shadow_return_of(fb: &FnBuilder) -> bool {
    if !fb.key.return_used {
        return false;
    }
    if !fb.src.sig.returns.first().map(|ty| ty.is_ptr()).unwrap_or(false) {
        return false;
    }
    let ret_inst = fb.src.layout.last_inst(fb.ret_block).unwrap();
    fb.src
        .dfg
        .inst_args(ret_inst)
        .first()
        .map(|arg| !fb.is_const_val(*arg))
        .unwrap_or(false)
}

/// Clone the source, run every analysis, lay out the entry block with
/// the widened parameter list, and pre-create loop counters.
fn new_builder(
    ctx: &AdContext,
    module: &Module,
    key: SigKey,
    mode: DerivativeMode,
    name: &str,
) -> FnBuilder {
    let src = module.funcs[key.func].clone();
    if src.layout.entry_block().is_none() {
        fatal!("cannot differentiate bodyless function %{}", src.name());
    }

    let cfg = ControlFlowGraph::with_function(&src);
    let domtree = DominatorTree::with_function(&src, &cfg);
    let loops = LoopInfo::compute(&src, &cfg, &domtree);
    let uses = compute_uses(&src);
    let secret = ctx.secret_floats.get(&key.func).cloned().unwrap_or_default();
    let typeinfo = TypeInfo::analyze(&src, &secret);
    let activity = Activity::compute(&src, &typeinfo, &key.const_args);
    let mut alias = AliasInfo::analyze(&src);
    let can_modref = uncacheable_loads(&src, &domtree, &mut alias, &key.uncacheable_args);
    let uncacheable_args =
        uncacheable_call_args(&src, &domtree, &mut alias, &key.uncacheable_args);
    let unreachable = unreachable_blocks(&src, &cfg);

    let mut needed = BitSet::new_empty(src.dfg.num_values());
    {
        let mut query = NeededInReverse::new(&src, &uses, &activity, &can_modref, mode);
        for block in src.layout.blocks() {
            for inst in src.layout.block_insts(block) {
                for result in src.dfg.inst_results(inst) {
                    if query.query(*result) {
                        needed.insert(*result);
                    }
                }
            }
            for param in src.dfg.block_params(block) {
                if query.query(*param) {
                    needed.insert(*param);
                }
            }
        }
    }

    let ret_block = src
        .layout
        .blocks()
        .find(|block| {
            src.layout
                .last_inst(*block)
                .map(|inst| src.dfg[inst].opcode() == Opcode::Ret)
                .unwrap_or(false)
        })
        .unwrap_or_else(|| fatal!("%{} has no return block", src.name()));
    if let Some(ret_inst) = src.layout.last_inst(ret_block) {
        if src.dfg.inst_args(ret_inst).len() > 1 {
            fatal!("%{} returns more than one value", src.name());
        }
    }

    let arg_classes: Vec<ArgClass> = src
        .sig
        .params
        .iter()
        .enumerate()
        .map(|(idx, param)| {
            if key.const_args.get(idx).copied().unwrap_or(false) {
                ArgClass::Constant
            } else if param.ty.is_ptr() {
                ArgClass::DupArg
            } else if param.ty.is_float() {
                ArgClass::OutDiff
            } else {
                ArgClass::Constant
            }
        })
        .collect();

    let mut fx = Function::new();
    fx.sig.name = name.to_owned();
    fx.sig.params = src.sig.params.clone();

    let global_shadows = module
        .globals
        .iter()
        .filter_map(|(global, data)| data.shadow.expand().map(|shadow| (global, shadow)))
        .collect();

    let mut fb = FnBuilder {
        mode,
        key,
        config: ctx.config,
        src,
        fx,
        cfg,
        domtree,
        uses,
        activity,
        typeinfo,
        can_modref,
        uncacheable_args,
        needed,
        unreachable,
        loops,
        ret_block,
        arg_classes,
        return_used: false,
        differential_return: false,
        shadow_params: AHashMap::new(),
        seed: None,
        val_map: SecondaryMap::new(),
        blk_map: SecondaryMap::new(),
        rev_map: SecondaryMap::new(),
        shadow_fwd_map: AHashMap::new(),
        shadow_sources: AHashMap::new(),
        diffe_slots: AHashMap::new(),
        rev_sources: AHashMap::new(),
        remat: AHashMap::new(),
        shadow_remat: AHashMap::new(),
        can_remat_memo: AHashSet::new(),
        fwd_loops: AHashMap::new(),
        rev_loops: AHashMap::new(),
        tape: crate::tape::TapeBuilder::new(),
        tape_out: AHashMap::new(),
        sub_augmented: AHashMap::new(),
        handled_calls: AHashSet::new(),
        sub_tape_sources: AHashMap::new(),
        global_shadows,
        pending_arr_frees: AHashMap::new(),
        indicators: AHashMap::new(),
        ret_primal_source: None,
        pending_phi_fixups: Vec::new(),
        pending_shadow_fixups: Vec::new(),
    };
    fb.return_used = fb.key.return_used;
    fb.differential_return = fb.key.differential_return;
    fb
}

/// The parameter surface common to both builders: original parameters
/// followed by one shadow pointer per duplicated argument.
fn widened_params(fb: &FnBuilder) -> Vec<AbiParam> {
    let mut params = fb.src.sig.params.clone();
    for (idx, class) in fb.arg_classes.iter().enumerate() {
        if *class == ArgClass::DupArg {
            let mut shadow = AbiParam::new(Type::Ptr);
            shadow.nocapture = fb.src.sig.params[idx].nocapture;
            params.push(shadow);
        }
    }
    params
}

/// The signature recursive callers observe while the augmentation is in
/// progress: tape boxed to one opaque pointer.
fn reserved_signature(fb: &FnBuilder, name: &str, shadow_ret: bool) -> FunctionSignature {
    let mut returns = vec![Type::Ptr];
    if fb.return_used {
        returns.extend(fb.src.sig.returns.iter().copied());
    }
    if shadow_ret {
        returns.push(Type::Ptr);
    }
    FunctionSignature::new(name, widened_params(fb), returns)
}

fn gradient_signature(
    fb: &FnBuilder,
    name: &str,
    shadow_ret: bool,
    aug: Option<&AugmentedReturn>,
) -> FunctionSignature {
    let mut params = widened_params(fb);
    if fb.differential_return {
        params.push(AbiParam::new(fb.src.sig.returns[0]));
    }
    if let Some(aug) = aug {
        for ty in &aug.tape_tys {
            params.push(AbiParam::new(*ty));
        }
    }
    let mut returns = Vec::new();
    if fb.return_used {
        returns.extend(fb.src.sig.returns.iter().copied());
    }
    if shadow_ret {
        returns.push(Type::Ptr);
    }
    // Out-differentials appear in the argument order of the primal.
    for (idx, class) in fb.arg_classes.iter().enumerate() {
        if *class == ArgClass::OutDiff {
            returns.push(fb.src.sig.params[idx].ty);
        }
    }
    FunctionSignature::new(name, params, returns)
}

/// Create the entry block, bind original parameters, shadow parameters,
/// the cotangent seed and the incoming tape; then pre-create the loop
/// counters.
fn bind_signature_values(fb: &mut FnBuilder, aug: Option<&AugmentedReturn>) {
    let entry = fb.fx.create_entry_block();
    let params: Vec<Value> = fb.fx.dfg.block_params(entry).to_vec();
    let src_entry = fb.src.layout.entry_block().unwrap();
    fb.blk_map[src_entry] = entry.into();

    let num_orig = fb.src.sig.params.len();
    let orig_params: Vec<Value> = fb.src.params().to_vec();
    for (idx, orig) in orig_params.iter().enumerate() {
        fb.set_val(*orig, params[idx]);
    }
    let mut cursor = num_orig;
    for (idx, class) in fb.arg_classes.clone().iter().enumerate() {
        if *class == ArgClass::DupArg {
            let shadow = params[cursor];
            cursor += 1;
            fb.shadow_params.insert(idx, shadow);
            fb.shadow_fwd_map.insert(orig_params[idx], shadow);
        }
    }
    if fb.differential_return && fb.mode != DerivativeMode::Forward {
        fb.seed = Some(params[cursor]);
        cursor += 1;
    }

    if let Some(aug) = aug {
        let tape_values: Vec<Value> = if aug.tape_boxed {
            let handle = params[cursor];
            pop_boxed_tape(fb, entry, handle, aug)
        } else {
            params[cursor..].to_vec()
        };
        bind_tape(fb, aug, &tape_values);
    }

    fb.create_loop_counters();
}

/// Pop a boxed tape back into values, in reverse push order, then
/// release the tape.
fn pop_boxed_tape(
    fb: &mut FnBuilder,
    entry: Block,
    handle: Value,
    aug: &AugmentedReturn,
) -> Vec<Value> {
    let mut values = vec![None; aug.boxed_tys.len()];
    for (idx, ty) in aug.boxed_tys.iter().enumerate().rev() {
        let pop = match crate::transform::transport_kind(*ty) {
            crate::transform::TransportKind::F64 => fb.import_runtime(runtime::TAPE_POP_F64),
            crate::transform::TransportKind::I64 => fb.import_runtime(runtime::TAPE_POP_I64),
            crate::transform::TransportKind::Ptr => fb.import_runtime(runtime::TAPE_POP_PTR),
        };
        let mut cur = FuncCursor::at_end(&mut fb.fx, entry);
        let call = cur.call(pop, &[handle]);
        let raw = cur.func.dfg.first_result(call);
        let val = match ty {
            Type::F32 => cur.cast(Opcode::Fptrunc, raw, Type::F32),
            Type::I32 => cur.cast(Opcode::Itrunc, raw, Type::I32),
            Type::I1 => {
                let one = cur.iconst(Type::I64, 1);
                cur.ieq(raw, one)
            }
            _ => raw,
        };
        values[idx] = Some(val);
    }
    let free = fb.import_runtime(runtime::TAPE_FREE);
    FuncCursor::at_end(&mut fb.fx, entry).call(free, &[handle]);
    values.into_iter().map(|v| v.unwrap()).collect()
}

/// Wire the flat tape values to the reverse sources the body will ask
/// for: cached primals, cached shadows, and sub-call tapes; buffered
/// slots rebuild their per-iteration buffer chain from the loop nest.
fn bind_tape(fb: &mut FnBuilder, aug: &AugmentedReturn, values: &[Value]) {
    let mut offset = 0;
    for slot in aug.slots.clone() {
        let TapeSlotDesc { inst, kind, tys, buffered } = slot;
        let slot_values = &values[offset..offset + tys.len()];
        offset += tys.len();

        let block = fb.src.layout.inst_block(inst).expect("cached instruction not in layout");
        let mut sources = Vec::with_capacity(tys.len());
        for (value, ty) in slot_values.iter().zip(&tys) {
            let source = if buffered {
                arr_chain(fb, RevSource::Ssa(*value), block, *ty)
            } else {
                RevSource::Ssa(*value)
            };
            sources.push(source);
        }

        match kind {
            CacheKind::Primal => {
                let result = fb.src.dfg.first_result(inst);
                fb.rev_sources.insert(result, sources[0].clone());
            }
            CacheKind::Shadow => {
                let result = fb.src.dfg.first_result(inst);
                fb.shadow_sources.insert(result, sources[0].clone());
            }
            CacheKind::Tape => {
                fb.sub_tape_sources.insert(inst, sources);
            }
        }
    }
}

/// Rebuild the buffer nesting of a value cached inside `block`'s loop
/// nest: the tape carried the outermost handle.
fn arr_chain(fb: &mut FnBuilder, leaf: RevSource, block: Block, elem: Type) -> RevSource {
    let containing = fb.loops.containing(block).map(|lp| (lp.header, lp.preheader));
    match containing {
        None => leaf,
        Some((header, preheader)) => {
            let handle = arr_chain(fb, leaf, preheader, Type::Ptr);
            fb.pending_arr_frees.entry(preheader).or_default().push(handle.clone());
            RevSource::Arr { handle: Box::new(handle), header, elem }
        }
    }
}

/// Clone the body front-to-back, applying the forward-direction edits of
/// the dispatcher and the call transformer; then place predecessor
/// indicators and resolve deferred phi edges.
fn forward_pass(fb: &mut FnBuilder, ctx: &mut AdContext, module: &mut Module) {
    if fb.fx.layout.entry_block().is_none() {
        // The augmented builder binds no tape; set up the entry now.
        fb.fx.sig.params = widened_params(fb);
        bind_signature_values(fb, None);
    }

    let blocks: Vec<Block> = fb.src.layout.blocks().collect();
    for block in blocks {
        fb.fwd_block(block);
        let plain = fb.unreachable.contains(block) || !fb.domtree.is_reachable(block);
        let insts: Vec<_> = fb.src.layout.block_insts(block).collect();
        for inst in insts {
            forward_inst(fb, ctx, module, inst, block, plain);
        }
    }

    // Deferred phi edges: every value exists now.
    for (phi_inst, idx, orig) in std::mem::take(&mut fb.pending_phi_fixups) {
        let val = fb.get_val(orig);
        fb.fx.dfg.inst_args_mut(phi_inst)[idx] = val;
    }
    for (phi_inst, idx, orig, pred) in std::mem::take(&mut fb.pending_shadow_fixups) {
        let val = fb.shadow_fwd(orig, pred);
        fb.fx.dfg.inst_args_mut(phi_inst)[idx] = val;
    }

    if fb.mode != DerivativeMode::Forward {
        indicator_pass(fb);
        ensure_ret_transfers(fb);
    }
}

fn forward_inst(
    fb: &mut FnBuilder,
    ctx: &mut AdContext,
    module: &mut Module,
    inst: lir::Inst,
    block: Block,
    plain: bool,
) {
    use lir::InstructionData as D;
    let data = fb.src.dfg[inst];
    let opcode = data.opcode();

    match data {
        D::PhiNode { .. } => clone_phi(fb, inst, block, plain),
        D::Jump { .. } | D::Branch { .. } | D::Nullary { op: Opcode::Unreachable } => {
            if fb.mode != DerivativeMode::Forward && fb.fwd_loops.contains_key(&block) {
                fb.emit_trip_count_store(block);
            }
            clone_terminator(fb, inst, block);
        }
        D::Ret { .. } => {
            // The epilogue (augmented) or the junction into the reverse
            // region (gradient) replaces the return.
        }
        D::Call { .. } => {
            if plain {
                calls::clone_call(fb, inst, block);
            } else if fb.mode == DerivativeMode::Reverse {
                reverse_mode_call_binding(fb, inst, block);
            } else {
                calls::forward_call(fb, ctx, module, inst, block);
            }
        }
        D::UnaryTy { op: Opcode::Load, arg, ty } => {
            forward_load(fb, inst, block, arg, ty, plain)
        }
        D::Binary { op: Opcode::Store, args } => {
            if fb.mode == DerivativeMode::Reverse {
                return;
            }
            clone_plain(fb, inst, block);
            if !plain && !fb.is_const_inst(inst) {
                mirror_store(fb, inst, block, args);
            }
        }
        D::Ternary { op: op @ (Opcode::Memcpy | Opcode::Memmove | Opcode::Memset), args } => {
            if fb.mode == DerivativeMode::Reverse {
                return;
            }
            clone_plain(fb, inst, block);
            if !plain && !fb.is_const_inst(inst) {
                mirror_mem_intrinsic(fb, inst, block, op, args);
            }
        }
        D::Unary { op: Opcode::LifetimeStart, .. } => {
            if fb.mode != DerivativeMode::Reverse {
                clone_plain(fb, inst, block);
            }
        }
        D::Unary { op: Opcode::LifetimeEnd, .. } => {
            // Erased: the value range must survive into the reverse pass.
            if plain {
                clone_plain(fb, inst, block);
            }
        }
        D::StackLoad { .. } | D::StackStore { .. } => {
            fatal!("input may not use stack slots: {}", fb.src.dfg.display_inst(inst))
        }
        _ => {
            debug_assert!(opcode.is_pure(), "unhandled side effect {}", opcode);
            clone_plain(fb, inst, block);
            if !plain && fb.mode != DerivativeMode::Forward {
                let results: Vec<Value> = fb.src.dfg.inst_results(inst).to_vec();
                for result in results {
                    if fb.is_needed(result) {
                        let fx_val = fb.get_val(result);
                        fb.register_transfer(result, fx_val, block);
                    }
                }
            }
        }
    }
}

/// Clone an instruction whose operands are all inline, remapping them.
fn clone_plain(fb: &mut FnBuilder, inst: lir::Inst, block: Block) {
    let mut data = fb.src.dfg[inst];
    let orig_args: Vec<Value> = fb.src.dfg.inst_args(inst).to_vec();
    let orig_results: Vec<Value> = fb.src.dfg.inst_results(inst).to_vec();
    let constant = fb.is_const_inst(inst);
    let mapped: Vec<Value> = orig_args.iter().map(|arg| fb.get_val(*arg)).collect();

    let (new_inst, new_results) = {
        let mut cur = fb.cursor_in_fwd_block(block);
        let pool = &mut cur.func.dfg.value_lists;
        for (slot, new) in data.arguments_mut(pool).iter_mut().zip(&mapped) {
            *slot = *new;
        }
        let new_inst = cur.build(data);
        let new_results: Vec<Value> = cur.func.dfg.inst_results(new_inst).to_vec();
        (new_inst, new_results)
    };
    for (orig, new) in orig_results.iter().zip(&new_results) {
        fb.set_val(*orig, *new);
    }
    fb.tag_activity(new_inst, constant);
}

fn clone_terminator(fb: &mut FnBuilder, inst: lir::Inst, block: Block) {
    use lir::InstructionData as D;
    let fx_block = fb.fwd_block(block);
    match fb.src.dfg[inst] {
        D::Jump { destination } => {
            let dest = fb.fwd_block(destination);
            FuncCursor::at_end(&mut fb.fx, fx_block).jump(dest);
        }
        D::Branch { arg, then_dest, else_dest } => {
            let cond = fb.get_val(arg);
            let then_fx = fb.fwd_block(then_dest);
            let else_fx = fb.fwd_block(else_dest);
            FuncCursor::at_end(&mut fb.fx, fx_block).br(cond, then_fx, else_fx);
        }
        D::Nullary { op: Opcode::Unreachable } => {
            FuncCursor::at_end(&mut fb.fx, fx_block).unreachable();
        }
        _ => unreachable!(),
    }
}

fn clone_phi(fb: &mut FnBuilder, inst: lir::Inst, block: Block, plain: bool) {
    let edges: Vec<(Block, Value)> = fb.src.dfg.phi_edges(inst).collect();
    let result = fb.src.dfg.first_result(inst);
    let ty = fb.src.dfg.value_ty(result);

    let mut fx_edges = Vec::with_capacity(edges.len());
    let mut fixups = Vec::new();
    for (idx, (pred, val)) in edges.iter().enumerate() {
        let fx_pred = fb.fwd_block(*pred);
        let fx_val = match fb.val_map[*val].expand() {
            Some(fx_val) => fx_val,
            None => {
                let placeholder = fb.fx.dfg.make_detached_value(ty);
                fixups.push((idx, *val));
                placeholder
            }
        };
        fx_edges.push((fx_pred, fx_val));
    }

    let fx_block = fb.fwd_block(block);
    let (phi_val, phi_inst) = {
        let mut cur = FuncCursor::at_head(&mut fb.fx, fx_block);
        // Keep phis after any pre-created counter phi, still contiguous.
        let val = cur.phi(ty, &fx_edges);
        let inst = match cur.func.dfg.value_def(val) {
            ValueDef::Result(inst, _) => inst,
            ValueDef::Param(..) => unreachable!(),
        };
        (val, inst)
    };
    for (idx, orig) in fixups {
        fb.pending_phi_fixups.push((phi_inst, idx, orig));
    }
    fb.set_val(result, phi_val);
    let constant = fb.is_const_inst(inst);
    fb.tag_activity(phi_inst, constant);

    if plain {
        return;
    }

    // An active pointer phi needs a shadow phi mirroring its edges.
    if ty.is_ptr() && !fb.is_const_val(result) {
        let mut shadow_edges = Vec::with_capacity(edges.len());
        let mut shadow_fixups = Vec::new();
        for (idx, (pred, val)) in edges.iter().enumerate() {
            let fx_pred = fb.fwd_block(*pred);
            let placeholder = fb.fx.dfg.make_detached_value(Type::Ptr);
            shadow_fixups.push((idx, *val, *pred));
            shadow_edges.push((fx_pred, placeholder));
        }
        let (shadow_val, shadow_inst) = {
            let mut cur = FuncCursor::at_head(&mut fb.fx, fx_block);
            let val = cur.phi(Type::Ptr, &shadow_edges);
            let inst = match cur.func.dfg.value_def(val) {
                ValueDef::Result(inst, _) => inst,
                ValueDef::Param(..) => unreachable!(),
            };
            (val, inst)
        };
        for (idx, orig, pred) in shadow_fixups {
            fb.pending_shadow_fixups.push((shadow_inst, idx, orig, pred));
        }
        fb.register_shadow(result, shadow_val, block);
    }

    // Loop-variant values the reverse pass consumes are buffered.
    if fb.mode != DerivativeMode::Forward && fb.is_needed(result) && !ty.is_ptr() {
        fb.register_transfer(result, phi_val, block);
    }
}

/// Forward handling of a load: shadow and primal caching, and the tape
/// binding in the split gradient.
fn forward_load(
    fb: &mut FnBuilder,
    inst: lir::Inst,
    block: Block,
    ptr: Value,
    ty: Type,
    plain: bool,
) {
    let result = fb.src.dfg.first_result(inst);

    if fb.mode == DerivativeMode::Reverse {
        if fb.can_modref[inst] {
            match fb.rev_sources.get(&result).cloned() {
                Some(source) => {
                    let val = fb.fetch_fwd(&source, block);
                    fb.set_val(result, val);
                }
                None => {
                    // Never cached: nothing in the re-executed forward
                    // region may use it.
                }
            }
            // The shadow, if cached, came in through the tape already.
            return;
        }
        clone_plain(fb, inst, block);
        return;
    }

    clone_plain(fb, inst, block);
    if plain {
        return;
    }

    // Shadow of a loaded pointer.
    if ty.is_ptr() && !fb.is_const_val(result) {
        let shadow_ptr = fb.shadow_fwd(ptr, block);
        let shadow = {
            let mut cur = fb.cursor_in_fwd_block(block);
            cur.load(Type::Ptr, shadow_ptr)
        };
        if fb.can_modref[inst] {
            fb.shadow_fwd_map.insert(result, shadow);
            if fb.mode == DerivativeMode::Forward {
                fb.cache_primal(inst, CacheKind::Shadow, Some(result), shadow, block);
            } else {
                fb.register_shadow(result, shadow, block);
            }
        } else {
            fb.shadow_fwd_map.insert(result, shadow);
        }
    }

    // Primal caching.
    let config = fb.config;
    let wanted = config.cache_reads_always
        || (!config.cache_reads_never && fb.can_modref[inst] && fb.is_needed(result));
    if wanted {
        let fx_val = fb.get_val(result);
        if fb.mode == DerivativeMode::Forward {
            fb.cache_primal(inst, CacheKind::Primal, Some(result), fx_val, block);
        } else {
            let source = fb.transfer_emitted(fx_val, block);
            fb.rev_sources.insert(result, source);
        }
    }
}

/// Mirror a pointer/integer store into the shadow; float stores are the
/// reverse pass's business.
fn mirror_store(fb: &mut FnBuilder, _inst: lir::Inst, block: Block, args: [Value; 2]) {
    let [value, ptr] = args;
    if fb.is_const_val(ptr) {
        return;
    }
    let ty = fb.src.dfg.value_ty(value);
    if ty.is_float() || fb.typeinfo.is_secret_float(value) {
        return;
    }
    let shadow_ptr = fb.shadow_fwd(ptr, block);
    let mirrored = if ty.is_ptr() && !fb.is_const_val(value) {
        fb.shadow_fwd(value, block)
    } else {
        fb.get_val(value)
    };
    let mut cur = fb.cursor_in_fwd_block(block);
    cur.store(mirrored, shadow_ptr);
}

fn mirror_mem_intrinsic(
    fb: &mut FnBuilder,
    _inst: lir::Inst,
    block: Block,
    op: Opcode,
    args: [Value; 3],
) {
    let [dst, src, len] = args;
    if fb.is_const_val(dst) {
        return;
    }
    let float_payload = fb
        .typeinfo
        .pointee(dst)
        .or_else(|| fb.typeinfo.pointee(src))
        .map(|ty| ty.is_float())
        .unwrap_or(false);

    match op {
        Opcode::Memset => {
            let shadow_dst = fb.shadow_fwd(dst, block);
            let byte = fb.get_val(src);
            let len = fb.get_val(len);
            let mut cur = fb.cursor_in_fwd_block(block);
            cur.memset(shadow_dst, byte, len);
        }
        Opcode::Memcpy | Opcode::Memmove if !float_payload => {
            // Non-float payload: copy between the shadows (or from the
            // primal source when it carries no shadow).
            let shadow_dst = fb.shadow_fwd(dst, block);
            let src_side = if fb.is_const_val(src) {
                fb.get_val(src)
            } else {
                fb.shadow_fwd(src, block)
            };
            let len = fb.get_val(len);
            let mut cur = fb.cursor_in_fwd_block(block);
            if op == Opcode::Memcpy {
                cur.memcpy(shadow_dst, src_side, len);
            } else {
                cur.memmove(shadow_dst, src_side, len);
            }
        }
        _ => {
            // Float payload: the reverse pass runs the differential copy.
        }
    }
}

/// Split gradient: a call's forward effects already happened in the
/// augmented pass; bind whatever the tape carried. A callee without
/// memory effects was never augmented and is simply re-executed.
fn reverse_mode_call_binding(fb: &mut FnBuilder, inst: lir::Inst, block: Block) {
    let results: Vec<Value> = fb.src.dfg.inst_results(inst).to_vec();
    if let Some(result) = results.first() {
        if let Some(source) = fb.rev_sources.get(result).cloned() {
            let val = fb.fetch_fwd(&source, block);
            fb.set_val(*result, val);
            return;
        }
    }
    let effects = fb.src.dfg.call_signature(inst).unwrap().effects;
    if effects == lir::MemEffects::ReadNone {
        calls::clone_call(fb, inst, block);
    }
}

/// Indicators: every reachable multi-predecessor block (loop headers
/// excepted) gets a forward phi carrying the taken-predecessor index.
fn indicator_pass(fb: &mut FnBuilder) {
    let blocks: Vec<Block> = fb.src.layout.blocks().collect();
    for block in blocks {
        if fb.unreachable.contains(block) || !fb.domtree.is_reachable(block) {
            continue;
        }
        if fb.fwd_loops.contains_key(&block) {
            continue;
        }
        let preds: Vec<Block> = fb.cfg.pred_iter(block).collect();
        if preds.len() < 2 {
            continue;
        }
        let mut edges = Vec::with_capacity(preds.len());
        for (idx, pred) in preds.iter().enumerate() {
            let marker = {
                let mut cur = fb.cursor_in_fwd_block(*pred);
                cur.iconst(Type::I64, idx as i64)
            };
            let fx_pred = fb.fwd_block(*pred);
            edges.push((fx_pred, marker));
        }
        let fx_block = fb.fwd_block(block);
        let indicator = {
            let mut cur = FuncCursor::at_head(&mut fb.fx, fx_block);
            cur.phi(Type::I64, &edges)
        };
        let source = fb.transfer_emitted(indicator, block);
        fb.indicators.insert(block, source);
    }
}

/// The primal return must be obtainable at the very end of the reverse
/// pass. A value that cannot be rebuilt there (say, an accumulator
/// flowing out of a loop) is spilled once, in the return block, where it
/// holds its final value.
fn ensure_ret_transfers(fb: &mut FnBuilder) {
    if !fb.return_used {
        return;
    }
    let ret_inst = fb.src.layout.last_inst(fb.ret_block).unwrap();
    let args: Vec<Value> = fb.src.dfg.inst_args(ret_inst).to_vec();
    let arg = match args.first() {
        Some(arg) => *arg,
        None => return,
    };
    if fb.can_rematerialize(arg) || fb.fwd_value_survives(arg) {
        return;
    }
    let ty = fb.src.dfg.value_ty(arg);
    let fx_val = fb.get_val(arg);
    let slot = fb.fx.create_stack_slot(ty);
    let ret_block = fb.ret_block;
    let mut cur = fb.cursor_in_fwd_block(ret_block);
    cur.stack_store(slot, fx_val);
    fb.ret_primal_source = Some(RevSource::Slot(slot, ty));
}

/// Emit the reverse region: one reverse block per eligible original
/// block, adjoints back-to-front, phi adjoints, inverted terminators,
/// and the packing return in the reverse of the entry block.
fn reverse_pass(fb: &mut FnBuilder, ctx: &mut AdContext, module: &mut Module, shadow_ret: bool) {
    let eligible: Vec<Block> = fb
        .src
        .layout
        .blocks()
        .filter(|block| fb.domtree.is_reachable(*block) && !fb.unreachable.contains(*block))
        .collect();

    // Reverse blocks in reverse layout order, countdown phis up front.
    for block in eligible.iter().rev() {
        let rev_block = fb.fx.dfg.make_block();
        fb.fx.layout.append_block(rev_block);
        fb.rev_map[*block] = rev_block.into();
        if fb.fwd_loops.contains_key(block) {
            let mut cur = FuncCursor::at_end(&mut fb.fx, rev_block);
            let av = cur.phi(Type::I64, &[]);
            let one = cur.iconst(Type::I64, 1);
            let av_dec = cur.isub(av, one);
            fb.rev_loops.insert(*block, crate::transform::RevLoop { av, av_dec });
        }
    }

    // The junction: the forward return block falls into the reverse
    // region, seeding the return value's cotangent.
    let ret_inst = fb.src.layout.last_inst(fb.ret_block).unwrap();
    let ret_args: Vec<Value> = fb.src.dfg.inst_args(ret_inst).to_vec();
    if let (Some(seed), true) = (fb.seed, fb.differential_return) {
        if let Some(arg) = ret_args.first() {
            if !fb.is_const_val(*arg) {
                let slot = fb.diffe_slot(*arg);
                let mut cur = fb.cursor_in_fwd_block(fb.ret_block);
                cur.stack_store(slot, seed);
            }
        }
    }
    {
        let rev_ret = fb.rev_map[fb.ret_block].expand().unwrap();
        let mut cur = fb.cursor_in_fwd_block(fb.ret_block);
        cur.jump(rev_ret);
    }

    let entry = fb.src.layout.entry_block().unwrap();
    for block in eligible.iter().rev() {
        let insts: Vec<lir::Inst> = fb.src.layout.block_insts(*block).collect();
        for inst in insts.into_iter().rev() {
            rules::reverse_inst(fb, ctx, module, inst, *block);
        }
        terminators::reverse_phis(fb, *block);
        terminators::release_arr_buffers(fb, *block);
        if *block == entry {
            emit_final_return(fb, shadow_ret);
        } else {
            terminators::invert_terminator(fb, *block);
        }
    }

    terminators::select_xor_cleanup(&mut fb.fx);
}

/// Pack, in order: the saved primal return (if requested), the shadow
/// return (if requested), then every out-differential in the argument
/// order of the primal.
fn emit_final_return(fb: &mut FnBuilder, shadow_ret: bool) {
    let entry = fb.src.layout.entry_block().unwrap();
    let ret_inst = fb.src.layout.last_inst(fb.ret_block).unwrap();
    let ret_args: Vec<Value> = fb.src.dfg.inst_args(ret_inst).to_vec();

    let mut values = Vec::new();
    if fb.return_used {
        if let Some(arg) = ret_args.first() {
            let primal = match fb.ret_primal_source.clone() {
                Some(source) => fb.fetch(&source, entry),
                None => fb.lookup(*arg, entry),
            };
            values.push(primal);
        }
    }
    if shadow_ret {
        let arg = ret_args[0];
        values.push(fb.lookup_shadow(arg, entry));
    }
    let orig_params: Vec<Value> = fb.src.params().to_vec();
    for (idx, class) in fb.arg_classes.clone().iter().enumerate() {
        if *class == ArgClass::OutDiff {
            values.push(fb.get_diffe(orig_params[idx], entry));
        }
    }

    let rev_entry = fb.rev_map[entry].expand().unwrap();
    FuncCursor::at_end(&mut fb.fx, rev_entry).ret(&values);
}

/// The augmented epilogue: materialize every tape slot at the return
/// block (boxed onto a runtime tape for self-referential functions),
/// then return `{tape..., primal?, shadow?}` and publish the
/// `AugmentedReturn`.
fn augmented_epilogue(
    fb: &mut FnBuilder,
    ctx: &AdContext,
    fid: FuncId,
    shadow_ret: bool,
) -> AugmentedReturn {
    let boxed = ctx.augmented_recursed.contains(&fb.key);
    let ret_block = fb.ret_block;
    let ret_inst = fb.src.layout.last_inst(ret_block).unwrap();
    let ret_args: Vec<Value> = fb.src.dfg.inst_args(ret_inst).to_vec();

    // Materialize each slot's physical values in forward slot order.
    let mut slot_descs = Vec::new();
    let mut flat_values = Vec::new();
    let slot_keys: Vec<(lir::Inst, CacheKind)> =
        fb.tape.iter().map(|(key, _)| *key).collect();
    for key in slot_keys {
        let slot = fb.tape.get(key.0, key.1).unwrap().clone();
        let sources = fb.tape_out.get(&key).cloned().unwrap_or_default();
        for source in &sources {
            let val = materialize_root(fb, source, ret_block);
            flat_values.push(val);
        }
        slot_descs.push(TapeSlotDesc {
            inst: key.0,
            kind: key.1,
            tys: slot.tys.clone(),
            buffered: slot.buffered,
        });
    }

    let mut boxed_tys = Vec::new();
    let mut rets = Vec::new();
    if boxed {
        let tape_new = fb.import_runtime(runtime::TAPE_NEW);
        let handle = {
            let mut cur = fb.cursor_in_fwd_block(ret_block);
            let call = cur.call(tape_new, &[]);
            cur.func.dfg.first_result(call)
        };
        for val in &flat_values {
            let ty = fb.fx.dfg.value_ty(*val);
            boxed_tys.push(ty);
            let push = match crate::transform::transport_kind(ty) {
                crate::transform::TransportKind::F64 => fb.import_runtime(runtime::TAPE_PUSH_F64),
                crate::transform::TransportKind::I64 => fb.import_runtime(runtime::TAPE_PUSH_I64),
                crate::transform::TransportKind::Ptr => fb.import_runtime(runtime::TAPE_PUSH_PTR),
            };
            let mut cur = fb.cursor_in_fwd_block(ret_block);
            let widened = match ty {
                Type::F32 => cur.cast(Opcode::Fpext, *val, Type::F64),
                Type::I32 | Type::I1 => cur.cast(Opcode::Zext, *val, Type::I64),
                _ => *val,
            };
            cur.call(push, &[handle, widened]);
        }
        rets.push(handle);
    } else {
        rets.extend(flat_values.iter().copied());
    }

    if fb.return_used {
        if let Some(arg) = ret_args.first() {
            rets.push(fb.get_val(*arg));
        }
    }
    if shadow_ret {
        let shadow = fb.shadow_fwd(ret_args[0], ret_block);
        rets.push(shadow);
    }

    let ret_tys: Vec<Type> = rets.iter().map(|v| fb.fx.dfg.value_ty(*v)).collect();
    fb.fx.sig.returns = ret_tys;
    {
        let mut cur = fb.cursor_in_fwd_block(ret_block);
        cur.ret(&rets);
    }

    // Return-struct layout.
    let mut return_index = AHashMap::new();
    let mut idx = 0;
    return_index.insert(AugmentedStruct::Tape, idx);
    idx += 1;
    if fb.return_used {
        return_index.insert(AugmentedStruct::Return, idx);
        idx += 1;
    }
    if shadow_ret {
        return_index.insert(AugmentedStruct::DifferentialReturn, idx);
    }

    let tape_tys: Vec<Type> = if boxed {
        vec![Type::Ptr]
    } else {
        slot_descs.iter().flat_map(|slot| slot.physical_tys()).collect()
    };

    AugmentedReturn {
        func: fid,
        key: fb.key.clone(),
        tape_tys,
        tape_boxed: boxed,
        boxed_tys,
        return_index,
        slots: slot_descs,
        uncacheable_args_per_call: fb.uncacheable_args.clone(),
        cacheable_load_flags: fb.can_modref.clone(),
        sub_augmentations: fb
            .sub_augmented
            .iter()
            .map(|(inst, aug)| (*inst, aug.key.clone()))
            .collect(),
    }
}

/// Walk a source down to its root handle (Ssa or Slot) and produce the
/// value at the return block.
fn materialize_root(fb: &mut FnBuilder, source: &RevSource, ret_block: Block) -> Value {
    match source {
        RevSource::Ssa(val) => *val,
        RevSource::Slot(slot, _) => {
            let mut cur = fb.cursor_in_fwd_block(ret_block);
            cur.stack_load(*slot)
        }
        RevSource::Arr { handle, .. } => materialize_root(fb, handle, ret_block),
        RevSource::Counter { .. } => {
            fatal!("an induction counter cannot be a tape value")
        }
    }
}

/// Strip the attributes the transform no longer satisfies, verify, and
/// install the function into the module.
fn finish(module: &mut Module, fid: FuncId, mut fb: FnBuilder) {
    fb.fx.sig.effects = lir::MemEffects::ReadWrite;
    for param in &mut fb.fx.sig.params {
        param.readonly = false;
        param.readnone = false;
    }

    if let Err(err) = lir::verify_function(&fb.fx) {
        fatal!(
            "verification of the transformed function failed: {}\n{}\n{}",
            err,
            dump_for_diagnostics("original", &fb.src),
            dump_for_diagnostics("transformed", &fb.fx)
        );
    }
    module.replace_function(fid, fb.fx);
}
