//! Per-function transform state: the working copy under construction,
//! the orig ↔ new maps, shadow and differential bookkeeping, loop
//! counters, and the machinery that carries primal values across the
//! forward/reverse boundary (direct SSA where dominance allows it,
//! zero-initialized stack slots for branch-local scalars, induction-
//! indexed heap buffers for loop-interior values).

use ahash::{AHashMap, AHashSet};
use bitset::BitSet;
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::SecondaryMap;
use lir::cursor::FuncCursor;
use lir::{
    AbiParam, Block, ControlFlowGraph, DominatorTree, FuncRef, Function, FunctionSignature, Inst,
    InstructionData, MemEffects, Opcode, StackSlot, Type, Use, Value, ValueDef,
};
use std::rc::Rc;
use tracing::trace;

use crate::activity::Activity;
use crate::loops::LoopInfo;
use crate::tape::{AugmentedReturn, CacheKind, TapeBuilder};
use crate::typeinfo::TypeInfo;
use crate::uncacheable::{CanModRef, UncacheableArgs};
use crate::{fatal, runtime, ArgClass, Config, DerivativeMode, SigKey};

/// How the reverse pass (or the augmented epilogue) obtains a value that
/// was computed in the forward pass.
#[derive(Clone, Debug)]
pub(crate) enum RevSource {
    /// The forward value dominates every point that will ask for it.
    Ssa(Value),
    /// Stored into a zero-initialized stack slot at its definition.
    Slot(StackSlot, Type),
    /// One buffer cell per loop iteration, indexed by the induction
    /// counter of `header`'s loop.
    Arr { handle: Box<RevSource>, header: Block, elem: Type },
    /// The value *is* the induction counter of `header`'s loop.
    Counter { header: Block },
}

/// Per-loop forward-pass state.
pub(crate) struct FwdLoop {
    /// The fresh induction counter phi in the new header.
    pub iv: Value,
    /// Scalar slot overwritten with `iv` on every header execution; after
    /// the loop exits it holds the trip count.
    pub n_slot: StackSlot,
}

/// Per-loop reverse-pass state.
pub(crate) struct RevLoop {
    /// Remaining-iterations phi in the reverse header.
    pub av: Value,
    /// `av - 1`: the index of the iteration currently being reversed.
    pub av_dec: Value,
}

pub(crate) struct FnBuilder {
    pub mode: DerivativeMode,
    pub key: SigKey,
    pub config: Config,
    pub src: Function,
    pub fx: Function,

    // Analyses over the original function.
    pub cfg: ControlFlowGraph,
    pub domtree: DominatorTree,
    pub uses: SecondaryMap<Value, Vec<Use>>,
    pub activity: Activity,
    pub typeinfo: TypeInfo,
    pub can_modref: CanModRef,
    pub uncacheable_args: UncacheableArgs,
    pub needed: BitSet<Value>,
    pub unreachable: BitSet<Block>,
    pub loops: LoopInfo,
    pub ret_block: Block,

    // Signature surface.
    pub arg_classes: Vec<ArgClass>,
    pub return_used: bool,
    pub differential_return: bool,
    pub shadow_params: AHashMap<usize, Value>,
    pub seed: Option<Value>,

    // orig -> new maps.
    pub val_map: SecondaryMap<Value, PackedOption<Value>>,
    pub blk_map: SecondaryMap<Block, PackedOption<Block>>,
    pub rev_map: SecondaryMap<Block, PackedOption<Block>>,

    // Shadows and differentials.
    pub shadow_fwd_map: AHashMap<Value, Value>,
    pub shadow_sources: AHashMap<Value, RevSource>,
    pub diffe_slots: AHashMap<Value, StackSlot>,

    // Forward -> reverse transfer.
    pub rev_sources: AHashMap<Value, RevSource>,
    pub(crate) remat: AHashMap<(Value, Block), Value>,
    pub(crate) shadow_remat: AHashMap<(Value, Block), Value>,
    pub(crate) can_remat_memo: AHashSet<Value>,

    // Loops.
    pub fwd_loops: AHashMap<Block, FwdLoop>,
    pub rev_loops: AHashMap<Block, RevLoop>,

    // Tape slots (Forward mode) and how the epilogue materializes them.
    pub tape: TapeBuilder,
    pub tape_out: AHashMap<(Inst, CacheKind), Vec<RevSource>>,

    // Call bookkeeping.
    pub sub_augmented: AHashMap<Inst, Rc<AugmentedReturn>>,
    pub handled_calls: AHashSet<Inst>,
    /// Per call site: how the reverse pass obtains the callee's tape
    /// values saved by the forward pass.
    pub sub_tape_sources: AHashMap<Inst, Vec<RevSource>>,

    /// Shadow globals, snapshotted from the module.
    pub global_shadows: AHashMap<lir::GlobalRef, lir::GlobalRef>,

    /// Iteration buffers to release once their loop's reverse pass is
    /// done, grouped by the loop preheader.
    pub pending_arr_frees: AHashMap<Block, Vec<RevSource>>,

    /// Taken-predecessor indicators of multi-predecessor blocks (loop
    /// headers excluded; they use the induction counter).
    pub indicators: AHashMap<Block, RevSource>,

    /// How the packing return obtains the primal return value when it
    /// cannot be rematerialized at the very end of the reverse pass.
    pub ret_primal_source: Option<RevSource>,

    // Phi edges that referenced not-yet-cloned values.
    pub pending_phi_fixups: Vec<(Inst, usize, Value)>,
    // Shadow-phi edges resolved once every block is cloned: the shadow
    // of the incoming value is materialized at the end of its edge's
    // predecessor.
    pub pending_shadow_fixups: Vec<(Inst, usize, Value, Block)>,
}

impl FnBuilder {
    /// The new block mirroring `block`, creating it on first request.
    pub fn fwd_block(&mut self, block: Block) -> Block {
        if let Some(fx_block) = self.blk_map[block].expand() {
            return fx_block;
        }
        let fx_block = self.fx.dfg.make_block();
        self.fx.layout.append_block(fx_block);
        self.blk_map[block] = fx_block.into();
        fx_block
    }

    /// The already established mapping of an original value.
    pub fn get_val(&self, orig: Value) -> Value {
        match self.val_map[orig].expand() {
            Some(val) => val,
            None => fatal!(
                "no forward value for {} while transforming %{}",
                orig,
                self.src.name()
            ),
        }
    }

    pub fn set_val(&mut self, orig: Value, new: Value) {
        self.val_map[orig] = new.into();
    }

    pub fn is_const_val(&self, v: Value) -> bool {
        self.activity.is_const_val(v)
    }

    pub fn is_const_inst(&self, inst: Inst) -> bool {
        self.activity.is_const_inst(inst)
    }

    pub fn is_needed(&self, v: Value) -> bool {
        self.needed.contains(v)
    }

    /// Tag a freshly emitted instruction with the activity metadata the
    /// contract requires on new instructions.
    pub fn tag_activity(&mut self, inst: Inst, constant: bool) {
        use lir::ActivityTag::*;
        self.fx.tags.activity_inst[inst] = if constant { Const } else { Active };
        let results: Vec<Value> = self.fx.dfg.inst_results(inst).to_vec();
        for result in results {
            self.fx.tags.activity_value[result] = if constant { Const } else { Active };
        }
    }

    /// Import (or find) a callable in the function being built.
    pub fn import(&mut self, sig: FunctionSignature) -> FuncRef {
        if let Some(func_ref) = self.fx.find_import(&sig.name) {
            return func_ref;
        }
        self.fx.import_signature(sig)
    }

    pub fn import_runtime(&mut self, name: &str) -> FuncRef {
        let sig = runtime_signature(name);
        self.import(sig)
    }
}

/// Signatures of the runtime support routines.
fn runtime_signature(name: &str) -> FunctionSignature {
    use Type::*;
    let (params, returns): (Vec<Type>, Vec<Type>) = match name {
        runtime::TAPE_NEW => (vec![], vec![Ptr]),
        runtime::TAPE_FREE => (vec![Ptr], vec![]),
        runtime::TAPE_PUSH_F64 => (vec![Ptr, F64], vec![]),
        runtime::TAPE_POP_F64 => (vec![Ptr], vec![F64]),
        runtime::TAPE_PUSH_I64 => (vec![Ptr, I64], vec![]),
        runtime::TAPE_POP_I64 => (vec![Ptr], vec![I64]),
        runtime::TAPE_PUSH_PTR => (vec![Ptr, Ptr], vec![]),
        runtime::TAPE_POP_PTR => (vec![Ptr], vec![Ptr]),
        runtime::ARR_NEW => (vec![], vec![Ptr]),
        runtime::ARR_FREE => (vec![Ptr], vec![]),
        runtime::ARR_SET_F64 => (vec![Ptr, I64, F64], vec![]),
        runtime::ARR_GET_F64 => (vec![Ptr, I64], vec![F64]),
        runtime::ARR_SET_I64 => (vec![Ptr, I64, I64], vec![]),
        runtime::ARR_GET_I64 => (vec![Ptr, I64], vec![I64]),
        runtime::ARR_SET_PTR => (vec![Ptr, I64, Ptr], vec![]),
        runtime::ARR_GET_PTR => (vec![Ptr, I64], vec![Ptr]),
        runtime::MEMCPY_ADD_F64 | runtime::MEMMOVE_ADD_F64 => (vec![Ptr, Ptr, I64], vec![]),
        runtime::MEMCPY_ADD_F32 | runtime::MEMMOVE_ADD_F32 => (vec![Ptr, Ptr, I64], vec![]),
        _ => fatal!("unknown runtime routine {}", name),
    };
    let mut sig = FunctionSignature::new(
        name,
        params.into_iter().map(AbiParam::new).collect(),
        returns,
    );
    sig.effects = MemEffects::ReadWrite;
    sig
}

/// Which runtime buffer family serves values of `ty`, plus the bridge
/// casts to and from the transported representation.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransportKind {
    F64,
    I64,
    Ptr,
}

pub(crate) fn transport_kind(ty: Type) -> TransportKind {
    match ty {
        Type::F64 | Type::F32 => TransportKind::F64,
        Type::I64 | Type::I32 | Type::I1 => TransportKind::I64,
        Type::Ptr => TransportKind::Ptr,
        Type::F64x2 | Type::F64x4 => {
            // Vectors travel lane by lane; callers split them first.
            fatal!("vector values are transported per lane")
        }
    }
}

impl FnBuilder {
    /// Widen a value to its transport representation (f64 / i64 / ptr).
    fn to_transport(cur: &mut FuncCursor, val: Value, ty: Type) -> Value {
        match ty {
            Type::F32 => cur.cast(Opcode::Fpext, val, Type::F64),
            Type::I32 | Type::I1 => cur.cast(Opcode::Zext, val, Type::I64),
            _ => val,
        }
    }

    /// Narrow a transported value back to `ty`.
    fn from_transport(cur: &mut FuncCursor, val: Value, ty: Type) -> Value {
        match ty {
            Type::F32 => cur.cast(Opcode::Fptrunc, val, Type::F32),
            Type::I32 => cur.cast(Opcode::Itrunc, val, Type::I32),
            Type::I1 => {
                let one = cur.iconst(Type::I64, 1);
                cur.ieq(val, one)
            }
            _ => val,
        }
    }

    /// Emit instructions into the forward block of `orig_block`, before
    /// its terminator when one is already present.
    pub fn cursor_in_fwd_block(&mut self, orig_block: Block) -> FuncCursor<'_> {
        let fx_block = self.fwd_block(orig_block);
        match self.fx.layout.last_inst(fx_block) {
            Some(last) if self.fx.dfg[last].opcode().is_terminator() => {
                FuncCursor::before_inst(&mut self.fx, last)
            }
            _ => FuncCursor::at_end(&mut self.fx, fx_block),
        }
    }
}

/// Loop counters.
impl FnBuilder {
    /// Create the induction counter of every loop up front: a `0` in the
    /// preheader, a counter phi heading the header, the increment in the
    /// latch, and the trip-count slot overwritten in the header.
    pub fn create_loop_counters(&mut self) {
        let headers: Vec<Block> = self.loops.headers().collect();
        for header in headers {
            let lp = self.loops.by_header(header);
            let (preheader, latch) = (lp.preheader, lp.latch);

            let fx_pre = self.fwd_block(preheader);
            let fx_header = self.fwd_block(header);
            let fx_latch = self.fwd_block(latch);

            let mut cur = FuncCursor::at_end(&mut self.fx, fx_pre);
            let zero = cur.iconst(Type::I64, 0);

            // The latch edge is patched below once the increment exists.
            let mut cur = FuncCursor::at_head(&mut self.fx, fx_header);
            let iv = cur.phi(Type::I64, &[(fx_pre, zero), (fx_latch, zero)]);

            let mut cur = FuncCursor::at_end(&mut self.fx, fx_latch);
            let one = cur.iconst(Type::I64, 1);
            let next = cur.iadd(iv, one);

            let phi_inst = match self.fx.dfg.value_def(iv) {
                ValueDef::Result(inst, _) => inst,
                ValueDef::Param(..) => unreachable!(),
            };
            self.fx.dfg.inst_args_mut(phi_inst)[1] = next;

            let n_slot = self.fx.create_stack_slot(Type::I64);
            self.fwd_loops.insert(header, FwdLoop { iv, n_slot });
        }
    }

    /// Store the counter into the trip-count slot; called when the
    /// header's terminator is about to be emitted.
    pub fn emit_trip_count_store(&mut self, header: Block) {
        if let Some(lp) = self.fwd_loops.get(&header) {
            let (iv, n_slot) = (lp.iv, lp.n_slot);
            let mut cur = self.cursor_in_fwd_block(header);
            cur.stack_store(n_slot, iv);
        }
    }

    /// The forward iteration index valid at `orig_block`.
    fn fwd_index(&mut self, header: Block) -> Value {
        self.fwd_loops[&header].iv
    }

    /// The reverse iteration index valid in the reverse block of
    /// `at_block`: `av` inside the reverse header itself, `av - 1` in
    /// the body, and the final trip count outside the loop (the value
    /// that flowed out of the last header execution).
    fn rev_index(&mut self, header: Block, at_block: Block) -> Value {
        if at_block == header {
            return self.rev_loops[&header].av;
        }
        if self.loops.by_header(header).blocks.contains(at_block) {
            return self.rev_loops[&header].av_dec;
        }
        let n_slot = self.fwd_loops[&header].n_slot;
        let rev_block = self.rev_map[at_block].expand().expect("no reverse block");
        let mut cur = FuncCursor::at_end(&mut self.fx, rev_block);
        cur.stack_load(n_slot)
    }
}

/// Transfer registration (forward side).
impl FnBuilder {
    /// Is the forward value of `v` statically available in every reverse
    /// block? Every path into the reverse region runs through the return
    /// block, so a loop-free definition dominating it survives.
    pub fn fwd_value_survives(&self, v: Value) -> bool {
        match self.src.dfg.value_def(v) {
            ValueDef::Param(block, _) => Some(block) == self.src.layout.entry_block(),
            ValueDef::Result(inst, _) => {
                let block = match self.src.layout.inst_block(inst) {
                    Some(block) => block,
                    None => return false,
                };
                !self.loops.in_any_loop(block) && self.domtree.dominates(block, self.ret_block)
            }
        }
    }

    /// Can the reverse pass rebuild `v` without any cached state?
    pub fn can_rematerialize(&mut self, v: Value) -> bool {
        if self.can_remat_memo.contains(&v) {
            return true;
        }
        let ok = self.can_rematerialize_uncached(v);
        if ok {
            self.can_remat_memo.insert(v);
        }
        ok
    }

    fn can_rematerialize_uncached(&mut self, v: Value) -> bool {
        if self.rev_sources.contains_key(&v) {
            return true;
        }
        let inst = match self.src.dfg.value_def(v) {
            ValueDef::Param(block, _) => {
                return Some(block) == self.src.layout.entry_block();
            }
            ValueDef::Result(inst, _) => inst,
        };
        match self.src.dfg[inst] {
            InstructionData::PhiNode { .. } => false,
            InstructionData::UnaryTy { op: Opcode::Load, arg, .. } => {
                !self.can_modref[inst] && self.can_rematerialize(arg)
            }
            InstructionData::Call { .. } => false,
            ref data if data.opcode().is_pure() => {
                let args: Vec<Value> = self.src.dfg.inst_args(inst).to_vec();
                args.into_iter().all(|arg| self.can_rematerialize(arg))
            }
            _ => false,
        }
    }

    /// Record how the reverse pass will obtain `orig`, whose forward
    /// value `fx_val` was just emitted in `orig_block`. Values that can
    /// be rematerialized register nothing.
    pub fn register_transfer(&mut self, orig: Value, fx_val: Value, orig_block: Block) {
        if self.rev_sources.contains_key(&orig) || self.can_rematerialize(orig) {
            return;
        }
        let source = self.transfer_emitted(fx_val, orig_block);
        self.rev_sources.insert(orig, source);
    }

    /// Like `register_transfer` but for values that have no original
    /// counterpart (shadow allocations, buffer handles, sub-call tapes).
    pub fn transfer_emitted(&mut self, fx_val: Value, orig_block: Block) -> RevSource {
        let ty = self.fx.dfg.value_ty(fx_val);
        let containing = self.loops.containing(orig_block).map(|lp| (lp.header, lp.preheader));
        if let Some((header, preheader)) = containing {
            if ty.is_vector() {
                fatal!("vector values inside loops must be transferred per lane");
            }
            let handle = self.create_arr_handle(preheader);
            let handle_src = self.transfer_emitted(handle, preheader);
            self.emit_arr_write(orig_block, handle, header, fx_val, ty);
            if self.mode != DerivativeMode::Forward {
                self.pending_arr_frees
                    .entry(preheader)
                    .or_default()
                    .push(handle_src.clone());
            }
            RevSource::Arr { handle: Box::new(handle_src), header, elem: ty }
        } else if self.domtree.dominates(orig_block, self.ret_block) {
            RevSource::Ssa(fx_val)
        } else {
            let slot = self.fx.create_stack_slot(ty);
            let mut cur = self.cursor_in_fwd_block(orig_block);
            cur.stack_store(slot, fx_val);
            RevSource::Slot(slot, ty)
        }
    }

    fn create_arr_handle(&mut self, preheader: Block) -> Value {
        let arr_new = self.import_runtime(runtime::ARR_NEW);
        let mut cur = self.cursor_in_fwd_block(preheader);
        let call = cur.call(arr_new, &[]);
        cur.func.dfg.first_result(call)
    }

    fn emit_arr_write(
        &mut self,
        orig_block: Block,
        handle: Value,
        header: Block,
        fx_val: Value,
        ty: Type,
    ) {
        let set_fn = match transport_kind(ty) {
            TransportKind::F64 => self.import_runtime(runtime::ARR_SET_F64),
            TransportKind::I64 => self.import_runtime(runtime::ARR_SET_I64),
            TransportKind::Ptr => self.import_runtime(runtime::ARR_SET_PTR),
        };
        let iv = self.fwd_index(header);
        let mut cur = self.cursor_in_fwd_block(orig_block);
        let widened = Self::to_transport(&mut cur, fx_val, ty);
        cur.call(set_fn, &[handle, iv, widened]);
    }
}

/// Reverse-side lookup.
impl FnBuilder {
    /// Fetch the primal value of `orig` inside the reverse block of
    /// `at_block`, rematerializing or reading caches as registered.
    pub fn lookup(&mut self, orig: Value, at_block: Block) -> Value {
        if let Some(&cached) = self.remat.get(&(orig, at_block)) {
            return cached;
        }
        let val = self.lookup_uncached(orig, at_block);
        self.remat.insert((orig, at_block), val);
        val
    }

    fn lookup_uncached(&mut self, orig: Value, at_block: Block) -> Value {
        if let ValueDef::Param(block, _) = self.src.dfg.value_def(orig) {
            if Some(block) == self.src.layout.entry_block() {
                return self.get_val(orig);
            }
        }

        // Prefer the forward value outright when its definition reaches
        // every reverse block.
        if self.fwd_value_survives(orig) {
            if let Some(val) = self.val_map[orig].expand() {
                return val;
            }
        }

        if let Some(source) = self.rev_sources.get(&orig).cloned() {
            return self.fetch(&source, at_block);
        }

        let inst = self.src.dfg.value_def(orig).unwrap_inst();

        match self.src.dfg[inst] {
            InstructionData::PhiNode { .. } => {
                fatal!("phi {} reached the reverse pass without a cache", orig)
            }
            InstructionData::Call { .. } => {
                fatal!("call result {} reached the reverse pass without a cache", orig)
            }
            InstructionData::UnaryTy { op: Opcode::Load, .. } if self.can_modref[inst] => {
                fatal!("uncacheable load {} reached the reverse pass without a cache", orig)
            }
            _ => {}
        }

        // Rematerialize the pure chain (or cacheable load) at the point
        // of use.
        let args: Vec<Value> = self.src.dfg.inst_args(inst).to_vec();
        let looked_up: Vec<Value> =
            args.iter().map(|arg| self.lookup(*arg, at_block)).collect();
        let mut data = self.src.dfg[inst];
        let rev_block = self.rev_map[at_block].expand().expect("no reverse block");
        let mut cur = FuncCursor::at_end(&mut self.fx, rev_block);
        {
            let pool = &mut cur.func.dfg.value_lists;
            for (slot, new) in data.arguments_mut(pool).iter_mut().zip(&looked_up) {
                *slot = *new;
            }
        }
        let new_inst = cur.build(data);
        if data.opcode() == Opcode::Load {
            // Pin the re-executed load: the cacheability analysis proved
            // it reads unchanged memory, and that must survive.
            self.fx.tags.mustcache[new_inst] = true;
        }
        self.fx.dfg.first_result(new_inst)
    }

    /// Fetch a tape-bound source *in the forward region*, at `at_block`:
    /// the split gradient binds tape-fed values into its re-executed
    /// forward region through this (buffers are read at the forward
    /// iteration index).
    pub(crate) fn fetch_fwd(&mut self, source: &RevSource, at_block: Block) -> Value {
        match source {
            RevSource::Ssa(val) => *val,
            RevSource::Slot(slot, _ty) => {
                let mut cur = self.cursor_in_fwd_block(at_block);
                cur.stack_load(*slot)
            }
            RevSource::Arr { handle, header, elem } => {
                let handle_val = self.fetch_fwd(handle, at_block);
                let get_fn = match transport_kind(*elem) {
                    TransportKind::F64 => self.import_runtime(runtime::ARR_GET_F64),
                    TransportKind::I64 => self.import_runtime(runtime::ARR_GET_I64),
                    TransportKind::Ptr => self.import_runtime(runtime::ARR_GET_PTR),
                };
                let index = self.fwd_index(*header);
                let mut cur = self.cursor_in_fwd_block(at_block);
                let call = cur.call(get_fn, &[handle_val, index]);
                let raw = cur.func.dfg.first_result(call);
                Self::from_transport(&mut cur, raw, *elem)
            }
            RevSource::Counter { header } => self.fwd_index(*header),
        }
    }

    /// Fetch a registered source in the reverse block of `at_block`.
    pub(crate) fn fetch(&mut self, source: &RevSource, at_block: Block) -> Value {
        match source {
            RevSource::Ssa(val) => *val,
            RevSource::Slot(slot, _ty) => {
                let rev_block = self.rev_map[at_block].expand().expect("no reverse block");
                let mut cur = FuncCursor::at_end(&mut self.fx, rev_block);
                cur.stack_load(*slot)
            }
            RevSource::Arr { handle, header, elem } => {
                let handle_val = self.fetch(handle, at_block);
                let get_fn = match transport_kind(*elem) {
                    TransportKind::F64 => self.import_runtime(runtime::ARR_GET_F64),
                    TransportKind::I64 => self.import_runtime(runtime::ARR_GET_I64),
                    TransportKind::Ptr => self.import_runtime(runtime::ARR_GET_PTR),
                };
                let index = self.rev_index(*header, at_block);
                let rev_block = self.rev_map[at_block].expand().expect("no reverse block");
                let mut cur = FuncCursor::at_end(&mut self.fx, rev_block);
                let call = cur.call(get_fn, &[handle_val, index]);
                let raw = cur.func.dfg.first_result(call);
                Self::from_transport(&mut cur, raw, *elem)
            }
            RevSource::Counter { header } => self.rev_index(*header, at_block),
        }
    }
}

/// Differentials.
impl FnBuilder {
    pub(crate) fn diffe_slot(&mut self, orig: Value) -> StackSlot {
        if let Some(slot) = self.diffe_slots.get(&orig) {
            return *slot;
        }
        let ty = self.src.dfg.value_ty(orig);
        let slot = self.fx.create_stack_slot(ty);
        self.diffe_slots.insert(orig, slot);
        slot
    }

    /// Current accumulated cotangent of `orig` (zero before any
    /// contribution: slots are zero-initialized).
    pub fn get_diffe(&mut self, orig: Value, at_block: Block) -> Value {
        let slot = self.diffe_slot(orig);
        let rev_block = self.rev_map[at_block].expand().expect("no reverse block");
        let mut cur = FuncCursor::at_end(&mut self.fx, rev_block);
        cur.stack_load(slot)
    }

    pub fn set_diffe(&mut self, orig: Value, val: Value, at_block: Block) {
        let slot = self.diffe_slot(orig);
        let rev_block = self.rev_map[at_block].expand().expect("no reverse block");
        let mut cur = FuncCursor::at_end(&mut self.fx, rev_block);
        cur.stack_store(slot, val);
    }

    pub fn zero_diffe(&mut self, orig: Value, at_block: Block) {
        let ty = self.src.dfg.value_ty(orig);
        let rev_block = self.rev_map[at_block].expand().expect("no reverse block");
        let zero = {
            let mut cur = FuncCursor::at_end(&mut self.fx, rev_block);
            cur.zero(ty)
        };
        self.set_diffe(orig, zero, at_block);
    }

    /// `d(orig) += delta`. No-op on constant values.
    pub fn add_to_diffe(&mut self, orig: Value, delta: Value, at_block: Block) {
        if self.is_const_val(orig) {
            trace!("dropping differential for constant {}", orig);
            return;
        }
        let slot = self.diffe_slot(orig);
        let rev_block = self.rev_map[at_block].expand().expect("no reverse block");
        let mut cur = FuncCursor::at_end(&mut self.fx, rev_block);
        let old = cur.stack_load(slot);
        let ty = cur.func.dfg.value_ty(old);
        let sum = if ty.is_float() {
            cur.fadd(old, delta)
        } else {
            // Secret-float integers accumulate bitwise through a cast.
            let old_f = cur.cast(Opcode::Bitcast, old, Type::F64);
            let delta_f = cur.cast(Opcode::Bitcast, delta, Type::F64);
            let sum = cur.fadd(old_f, delta_f);
            cur.cast(Opcode::Bitcast, sum, ty)
        };
        cur.stack_store(slot, sum);
    }
}

/// Shadows.
impl FnBuilder {
    /// The shadow of `orig` during the forward pass. Derived pointers
    /// (geps, casts, selects) build their shadow on demand; argument,
    /// allocation, call and phi shadows must have been registered when
    /// their defining instruction was processed.
    pub fn shadow_fwd(&mut self, orig: Value, orig_block: Block) -> Value {
        if let Some(shadow) = self.shadow_fwd_map.get(&orig) {
            return *shadow;
        }
        if self.is_const_val(orig) {
            fatal!("shadow requested for constant value {}", orig);
        }
        // In the split gradient, shadows the augmented pass saved come
        // in through the tape rather than being re-derived.
        if self.mode == DerivativeMode::Reverse {
            if let Some(source) = self.shadow_sources.get(&orig).cloned() {
                let shadow = self.fetch_fwd(&source, orig_block);
                self.shadow_fwd_map.insert(orig, shadow);
                return shadow;
            }
        }
        let shadow = match self.src.dfg.value_def(orig) {
            ValueDef::Param(block, idx) => {
                if Some(block) != self.src.layout.entry_block() {
                    fatal!("pointer {} has no shadow", orig);
                }
                match self.shadow_params.get(&idx) {
                    Some(shadow) => *shadow,
                    None => fatal!("argument {} was not duplicated with a shadow", orig),
                }
            }
            ValueDef::Result(inst, _) => {
                let data = self.src.dfg[inst];
                match data {
                    InstructionData::Gep { args, elem_ty } => {
                        let base = self.shadow_fwd(args[0], orig_block);
                        let index = self.get_val(args[1]);
                        let mut cur = self.cursor_in_fwd_block(orig_block);
                        cur.gep(elem_ty, base, index)
                    }
                    InstructionData::UnaryTy {
                        op: op @ (Opcode::Bitcast | Opcode::Inttoptr),
                        arg,
                        ty,
                    } => {
                        let base = self.shadow_fwd(arg, orig_block);
                        let mut cur = self.cursor_in_fwd_block(orig_block);
                        cur.cast(op, base, ty)
                    }
                    InstructionData::Ternary { op: Opcode::Select, args } => {
                        let cond = self.get_val(args[0]);
                        let lhs = self.shadow_fwd(args[1], orig_block);
                        let rhs = self.shadow_fwd(args[2], orig_block);
                        let mut cur = self.cursor_in_fwd_block(orig_block);
                        cur.select(cond, lhs, rhs)
                    }
                    InstructionData::Nullary { op: Opcode::Nullptr } => {
                        let mut cur = self.cursor_in_fwd_block(orig_block);
                        cur.nullptr()
                    }
                    InstructionData::UnaryGlobal { global } => self.global_shadow(global, orig_block),
                    InstructionData::UnaryTy { op: Opcode::Load, arg, .. } => {
                        // The shadow of a loaded pointer is the pointer
                        // stored at the mirrored location.
                        let shadow_ptr = self.shadow_fwd(arg, orig_block);
                        let mut cur = self.cursor_in_fwd_block(orig_block);
                        cur.load(Type::Ptr, shadow_ptr)
                    }
                    _ => fatal!(
                        "no shadow rule for {} defined by {}",
                        orig,
                        self.src.dfg.display_inst(inst)
                    ),
                }
            }
        };
        self.shadow_fwd_map.insert(orig, shadow);
        shadow
    }

    fn global_shadow(&mut self, global: lir::GlobalRef, orig_block: Block) -> Value {
        match self.global_shadows.get(&global).copied() {
            Some(shadow) => {
                let mut cur = self.cursor_in_fwd_block(orig_block);
                cur.global_addr(shadow)
            }
            None => fatal!("global {} is active but carries no shadow", global),
        }
    }

    /// The shadow of `orig` inside the reverse block of `at_block`.
    pub fn lookup_shadow(&mut self, orig: Value, at_block: Block) -> Value {
        if let Some(&cached) = self.shadow_remat.get(&(orig, at_block)) {
            return cached;
        }
        let val = self.lookup_shadow_uncached(orig, at_block);
        self.shadow_remat.insert((orig, at_block), val);
        val
    }

    fn lookup_shadow_uncached(&mut self, orig: Value, at_block: Block) -> Value {
        if let Some(source) = self.shadow_sources.get(&orig).cloned() {
            return self.fetch(&source, at_block);
        }
        match self.src.dfg.value_def(orig) {
            ValueDef::Param(block, idx) => {
                if Some(block) != self.src.layout.entry_block() {
                    fatal!("pointer {} has no shadow", orig);
                }
                match self.shadow_params.get(&idx) {
                    Some(shadow) => *shadow,
                    None => fatal!("argument {} was not duplicated with a shadow", orig),
                }
            }
            ValueDef::Result(inst, _) => {
                let data = self.src.dfg[inst];
                let rev_block = self.rev_map[at_block].expand().expect("no reverse block");
                match data {
                    InstructionData::Gep { args, elem_ty } => {
                        let base = self.lookup_shadow(args[0], at_block);
                        let index = self.lookup(args[1], at_block);
                        let mut cur = FuncCursor::at_end(&mut self.fx, rev_block);
                        cur.gep(elem_ty, base, index)
                    }
                    InstructionData::UnaryTy {
                        op: op @ (Opcode::Bitcast | Opcode::Inttoptr),
                        arg,
                        ty,
                    } => {
                        let base = self.lookup_shadow(arg, at_block);
                        let mut cur = FuncCursor::at_end(&mut self.fx, rev_block);
                        cur.cast(op, base, ty)
                    }
                    InstructionData::Ternary { op: Opcode::Select, args } => {
                        let cond = self.lookup(args[0], at_block);
                        let lhs = self.lookup_shadow(args[1], at_block);
                        let rhs = self.lookup_shadow(args[2], at_block);
                        let mut cur = FuncCursor::at_end(&mut self.fx, rev_block);
                        cur.select(cond, lhs, rhs)
                    }
                    InstructionData::Nullary { op: Opcode::Nullptr } => {
                        let mut cur = FuncCursor::at_end(&mut self.fx, rev_block);
                        cur.nullptr()
                    }
                    InstructionData::UnaryTy { op: Opcode::Load, arg, .. }
                        if !self.can_modref[inst] =>
                    {
                        let shadow_ptr = self.lookup_shadow(arg, at_block);
                        let mut cur = FuncCursor::at_end(&mut self.fx, rev_block);
                        cur.load(Type::Ptr, shadow_ptr)
                    }
                    _ => fatal!(
                        "no reverse shadow for {} defined by {}",
                        orig,
                        self.src.dfg.display_inst(inst)
                    ),
                }
            }
        }
    }

    /// Register the shadow of a value that cannot be derived on demand
    /// (allocations, call returns, phis), both for the forward map and
    /// for reverse fetches.
    pub fn register_shadow(&mut self, orig: Value, shadow_fx: Value, orig_block: Block) {
        self.shadow_fwd_map.insert(orig, shadow_fx);
        if self.mode != DerivativeMode::Forward {
            let source = self.transfer_emitted(shadow_fx, orig_block);
            self.shadow_sources.insert(orig, source);
        }
    }
}

/// Primal caching (tape in Forward mode, local transfer otherwise).
impl FnBuilder {
    /// Save `fx_val` (the forward value of `orig` produced by `inst`) so
    /// the reverse pass can see it.
    ///
    /// In the augmented primal this allocates a tape slot; in the
    /// combined mode it registers a local transfer; the split gradient
    /// never calls this (its values come in through the tape).
    pub fn cache_primal(
        &mut self,
        inst: Inst,
        kind: CacheKind,
        orig: Option<Value>,
        fx_val: Value,
        orig_block: Block,
    ) {
        match self.mode {
            DerivativeMode::Forward => {
                let ty = self.fx.dfg.value_ty(fx_val);
                let containing =
                    self.loops.containing(orig_block).map(|lp| (lp.header, lp.preheader));
                let source = if let Some((header, preheader)) = containing {
                    // Per-iteration buffer; the tape carries the handle.
                    if ty.is_vector() {
                        fatal!("vector values inside loops must be cached per lane");
                    }
                    self.tape.slot(inst, kind, &[ty], true);
                    let handle = self.create_arr_handle(preheader);
                    self.emit_arr_write(orig_block, handle, header, fx_val, ty);
                    self.transfer_emitted(handle, preheader)
                } else {
                    self.tape.slot(inst, kind, &[ty], false);
                    self.transfer_emitted(fx_val, orig_block)
                };
                self.tape_out.entry((inst, kind)).or_default().push(source);
            }
            DerivativeMode::Both => {
                let source = self.transfer_emitted(fx_val, orig_block);
                match kind {
                    CacheKind::Shadow => {
                        if let Some(orig) = orig {
                            self.shadow_sources.insert(orig, source);
                        }
                    }
                    _ => {
                        if let Some(orig) = orig {
                            self.rev_sources.insert(orig, source);
                        }
                    }
                }
            }
            DerivativeMode::Reverse => {
                fatal!("the split gradient does not produce caches")
            }
        }
    }

    /// Save a sub-call's tape values (`Tape` slot). Inside a loop each
    /// value gets its own per-iteration buffer.
    pub fn cache_sub_tape(&mut self, inst: Inst, values: &[Value], orig_block: Block) {
        if values.is_empty() {
            return;
        }
        let tys: Vec<Type> = values.iter().map(|v| self.fx.dfg.value_ty(*v)).collect();
        let in_loop = self.loops.in_any_loop(orig_block);
        let mut sources = Vec::with_capacity(values.len());
        for (val, ty) in values.iter().zip(&tys) {
            let source = if in_loop {
                let containing =
                    self.loops.containing(orig_block).map(|lp| (lp.header, lp.preheader));
                let (header, preheader) = containing.unwrap();
                let handle = self.create_arr_handle(preheader);
                let handle_src = self.transfer_emitted(handle, preheader);
                self.emit_arr_write(orig_block, handle, header, *val, *ty);
                if self.mode != DerivativeMode::Forward {
                    self.pending_arr_frees
                        .entry(preheader)
                        .or_default()
                        .push(handle_src.clone());
                }
                RevSource::Arr { handle: Box::new(handle_src), header, elem: *ty }
            } else {
                self.transfer_emitted(*val, orig_block)
            };
            sources.push(source);
        }
        if self.mode == DerivativeMode::Forward {
            self.tape.slot(inst, CacheKind::Tape, &tys, in_loop);
            self.tape_out.insert((inst, CacheKind::Tape), sources.clone());
        }
        self.sub_tape_sources.insert(inst, sources);
    }
}
