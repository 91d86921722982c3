//! Reverse-mode automatic differentiation as a source-to-source transform
//! over the `lir` SSA IR.
//!
//! Given a function `f(x1, ..., xn) -> y` the transform synthesizes
//!
//! * an *augmented primal* `f⁺` that computes `y` while saving the tape
//!   the reverse pass will consume, and
//! * a *gradient* `f′` that, given the tape and an incoming cotangent
//!   `ȳ`, computes the input cotangents,
//!
//! or a fused version of both when a function is differentiated
//! top-level. The entry points are [`create_augmented_primal`],
//! [`create_primal_and_gradient`] and the top-level convenience
//! [`differentiate`]; all of them memoize on a normalized signature key
//! held by the [`AdContext`] so that mutually recursive functions close
//! into a finite set of synthesized functions.

mod activity;
mod alias;
mod builders;
mod calls;
mod loops;
mod needed;
mod rules;
mod tape;
mod terminators;
mod transform;
mod typeinfo;
mod uncacheable;
mod unreachable;

use ahash::AHashMap;
use lir::{FuncId, Value};
use std::rc::Rc;

pub use crate::activity::Activity;
pub use crate::alias::AliasInfo;
pub use crate::builders::{create_augmented_primal, create_primal_and_gradient, differentiate, Gradient};
pub use crate::loops::LoopInfo;
pub use crate::needed::NeededInReverse;
pub use crate::tape::{AugmentedReturn, AugmentedStruct, CacheKind, TapeSlotDesc};
pub use crate::typeinfo::TypeInfo;
pub use crate::uncacheable::{uncacheable_call_args, uncacheable_loads, CanModRef, UncacheableArgs};
pub use crate::unreachable::unreachable_blocks;

/// Which direction of the transform an instruction edit belongs to.
///
/// `Forward` builds the augmented primal, `Reverse` the split gradient
/// that consumes a tape, and `Both` the fused top-level combined pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DerivativeMode {
    Forward,
    Reverse,
    Both,
}

/// Global switches of the transform.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Force every load into the tape.
    pub cache_reads_always: bool,
    /// Never cache loads. Incompatible with `cache_reads_always`.
    pub cache_reads_never: bool,
    /// Treat globals without a declared shadow as inactive. Defaults to
    /// true; a global that aliases an active pointer silently produces
    /// wrong gradients. Kept as-is deliberately.
    pub nonmarkedglobals_inactiveloads: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_reads_always: false,
            cache_reads_never: false,
            nonmarkedglobals_inactiveloads: true,
        }
    }
}

/// How an argument of the primal participates in the derivative.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArgClass {
    /// Inactive; passed through unchanged.
    Constant,
    /// Pointer duplicated with a shadow argument.
    DupArg,
    /// Float whose cotangent is returned by the gradient.
    OutDiff,
}

/// The normalized key both builder caches memoize on. Two call sites
/// that agree on everything here share one synthesized function.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SigKey {
    pub func: FuncId,
    pub const_args: Vec<bool>,
    pub uncacheable_args: Vec<bool>,
    pub return_used: bool,
    pub differential_return: bool,
    pub type_fingerprint: u64,
}

/// State of an augmented-primal cache entry. While a function's
/// augmentation is still being built, recursive requests observe the
/// reserved entry, which always advertises a boxed tape.
pub(crate) enum AugmentedState {
    InProgress(Rc<AugmentedReturn>),
    Done(Rc<AugmentedReturn>),
}

/// The transform context: configuration plus the two process-wide caches
/// (augmented primals and gradients), owned explicitly instead of being
/// global state.
pub struct AdContext {
    pub config: Config,
    pub(crate) augmented: AHashMap<SigKey, AugmentedState>,
    /// Synthesized gradients; combined and split renditions of the same
    /// key are distinct functions.
    pub(crate) gradients: AHashMap<(SigKey, DerivativeMode), Gradient>,
    /// Keys whose in-progress augmentation was requested recursively;
    /// their tape must be boxed.
    pub(crate) augmented_recursed: std::collections::HashSet<SigKey>,
    /// Secret-float declarations per function: integer-typed values whose
    /// bit pattern the type analysis knows to be a float.
    pub(crate) secret_floats: AHashMap<FuncId, Vec<Value>>,
}

impl AdContext {
    pub fn new(config: Config) -> AdContext {
        assert!(
            !(config.cache_reads_always && config.cache_reads_never),
            "cache_reads_always and cache_reads_never are mutually exclusive"
        );
        AdContext {
            config,
            augmented: AHashMap::new(),
            gradients: AHashMap::new(),
            augmented_recursed: std::collections::HashSet::new(),
            secret_floats: AHashMap::new(),
        }
    }

    /// Register a precomputed augmented primal for `key`, standing in for
    /// the `augment` metadata of the original system: the builder will
    /// return it instead of synthesizing one.
    pub fn register_augmented(&mut self, key: SigKey, augmented: AugmentedReturn) {
        self.augmented.insert(key, AugmentedState::Done(Rc::new(augmented)));
    }

    /// Register a precomputed gradient for `key`.
    pub fn register_gradient(&mut self, key: SigKey, mode: DerivativeMode, gradient: Gradient) {
        self.gradients.insert((key, mode), gradient);
    }

    /// Declare integer-typed values of `func` that actually carry float
    /// bits; the type analysis oracle answers `is_secret_float` from this.
    pub fn declare_secret_floats(&mut self, func: FuncId, values: Vec<Value>) {
        self.secret_floats.insert(func, values);
    }

    pub(crate) fn type_fingerprint(&self, func: FuncId) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = ahash::AHasher::default();
        if let Some(values) = self.secret_floats.get(&func) {
            for v in values {
                v.hash(&mut hasher);
            }
        }
        hasher.finish()
    }
}

/// Names of the runtime support routines the emitted code calls into:
/// the LIFO tape used when a tape must be boxed behind an opaque
/// pointer, the induction-indexed buffers caching loop-interior values,
/// and the differential memory intrinsics of the memcpy/memmove rules.
pub(crate) mod runtime {
    pub const TAPE_NEW: &str = "__ad_tape_new";
    pub const TAPE_FREE: &str = "__ad_tape_free";
    pub const TAPE_PUSH_F64: &str = "__ad_tape_push_f64";
    pub const TAPE_POP_F64: &str = "__ad_tape_pop_f64";
    pub const TAPE_PUSH_I64: &str = "__ad_tape_push_i64";
    pub const TAPE_POP_I64: &str = "__ad_tape_pop_i64";
    pub const TAPE_PUSH_PTR: &str = "__ad_tape_push_ptr";
    pub const TAPE_POP_PTR: &str = "__ad_tape_pop_ptr";
    pub const ARR_NEW: &str = "__ad_arr_new";
    pub const ARR_FREE: &str = "__ad_arr_free";
    pub const ARR_SET_F64: &str = "__ad_arr_set_f64";
    pub const ARR_GET_F64: &str = "__ad_arr_get_f64";
    pub const ARR_SET_I64: &str = "__ad_arr_set_i64";
    pub const ARR_GET_I64: &str = "__ad_arr_get_i64";
    pub const ARR_SET_PTR: &str = "__ad_arr_set_ptr";
    pub const ARR_GET_PTR: &str = "__ad_arr_get_ptr";
    pub const MEMCPY_ADD_F64: &str = "__ad_memcpy_add_f64";
    pub const MEMCPY_ADD_F32: &str = "__ad_memcpy_add_f32";
    pub const MEMMOVE_ADD_F64: &str = "__ad_memmove_add_f64";
    pub const MEMMOVE_ADD_F32: &str = "__ad_memmove_add_f32";

    pub fn is_runtime(name: &str) -> bool {
        name.starts_with("__ad_")
    }
}

/// Classification of well-known callees.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum KnownCallee {
    /// `malloc`, `calloc`: paired with an anti-allocation in the shadow.
    Alloc,
    /// `free`: erased in the forward pass, re-emitted in reverse.
    Dealloc,
    /// Pure or diagnostic routines with no derivative: `printf`, `puts`,
    /// the `lgamma` family, stack save/restore and friends.
    PassThrough,
    /// Anything else: handled by the generic call transformer.
    Generic,
}

pub(crate) fn classify_callee(name: &str) -> KnownCallee {
    match name {
        "malloc" | "calloc" => KnownCallee::Alloc,
        "free" => KnownCallee::Dealloc,
        "printf" | "puts" | "lgamma" | "lgammaf" | "lgamma_r" | "stacksave" | "stackrestore"
        | "assume" | "prefetch" => KnownCallee::PassThrough,
        name if runtime::is_runtime(name) => KnownCallee::PassThrough,
        _ => KnownCallee::Generic,
    }
}

/// Fatal error helper: the transform has no recoverable error channel; a
/// broken precondition dumps the functions involved and aborts.
#[macro_export]
macro_rules! fatal {
    ($($fmt:tt)*) => {{
        panic!($($fmt)*)
    }};
}

pub(crate) fn dump_for_diagnostics(what: &str, func: &lir::Function) -> String {
    format!("=== {} %{} ===\n{}", what, func.name(), func)
}
