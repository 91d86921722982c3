use lir::{FuncId, Function, Module, Opcode};
use lir_reader::parse_module;

use crate::{
    create_augmented_primal, create_primal_and_gradient, differentiate, AdContext, Config,
    DerivativeMode, SigKey,
};

fn ctx() -> AdContext {
    AdContext::new(Config::default())
}

fn count_opcode(func: &Function, op: Opcode) -> usize {
    func.layout
        .blocks()
        .flat_map(|block| func.layout.block_insts(block).collect::<Vec<_>>())
        .filter(|inst| func.dfg[*inst].opcode() == op)
        .count()
}

fn count_calls_to(func: &Function, name: &str) -> usize {
    func.layout
        .blocks()
        .flat_map(|block| func.layout.block_insts(block).collect::<Vec<_>>())
        .filter(|inst| {
            func.dfg.call_signature(*inst).map(|sig| sig.name == name).unwrap_or(false)
        })
        .count()
}

fn key_for(ctx: &AdContext, module: &Module, func: FuncId, const_args: &[bool]) -> SigKey {
    let sig = &module.funcs[func].sig;
    SigKey {
        func,
        const_args: const_args.to_vec(),
        uncacheable_args: vec![false; sig.params.len()],
        return_used: true,
        differential_return: sig.returns.first().map(|ty| ty.is_float()).unwrap_or(false),
        type_fingerprint: ctx.type_fingerprint(func),
    }
}

/// `f(x) = x*x`: the gradient multiplies the cotangent with each factor
/// and accumulates; nothing needs a tape or the cache runtime.
#[test]
fn square_combined() {
    let mut module = parse_module(
        r#"
function %square(f64) -> f64 {
block0(v0: f64):
    v1 = fmul v0, v0
    ret v1
}
"#,
    )
    .unwrap();
    let mut ctx = ctx();
    let func = module.lookup_func("square").unwrap();
    let grad = differentiate(&mut ctx, &mut module, func, &[false], true);

    let gfn = &module.funcs[grad];
    assert_eq!(gfn.name(), "square.diffe");
    // (x, seed) -> (primal, dx)
    let param_tys: Vec<_> = gfn.sig.param_tys().collect();
    assert_eq!(param_tys, vec![lir::Type::F64, lir::Type::F64]);
    assert_eq!(gfn.sig.returns, vec![lir::Type::F64, lir::Type::F64]);
    // d(x) += seed*x twice; the primal is recomputed for the return.
    assert_eq!(count_opcode(gfn, Opcode::Fmul), 3);
    // No heap caching of any kind.
    assert_eq!(count_opcode(gfn, Opcode::Call), 0);
}

/// Repeated differentiation with an identical key returns the same
/// function object; a different constant-argument set does not.
#[test]
fn memoization_round_trip() {
    let mut module = parse_module(
        r#"
function %mix(f64, f64) -> f64 {
block0(v0: f64, v1: f64):
    v2 = fmul v0, v1
    ret v2
}
"#,
    )
    .unwrap();
    let mut ctx = ctx();
    let func = module.lookup_func("mix").unwrap();
    let first = differentiate(&mut ctx, &mut module, func, &[false, false], true);
    let again = differentiate(&mut ctx, &mut module, func, &[false, false], true);
    assert_eq!(first, again);
    let other = differentiate(&mut ctx, &mut module, func, &[false, true], true);
    assert_ne!(first, other);
}

/// `f(a) = a[0] + a[1]`: the gradient scatters the cotangent through the
/// shadow argument.
#[test]
fn pointer_argument_scatter() {
    let mut module = parse_module(
        r#"
function %sum2(ptr) -> f64 {
block0(v0: ptr):
    v1 = load.f64 v0
    v2 = iconst.i64 1
    v3 = gep.f64 v0, v2
    v4 = load.f64 v3
    v5 = fadd v1, v4
    ret v5
}
"#,
    )
    .unwrap();
    let mut ctx = ctx();
    let func = module.lookup_func("sum2").unwrap();
    let grad = differentiate(&mut ctx, &mut module, func, &[false], true);

    let gfn = &module.funcs[grad];
    // (a, a_shadow, seed) -> (primal); no out-diffs for pointer args.
    let param_tys: Vec<_> = gfn.sig.param_tys().collect();
    assert_eq!(param_tys, vec![lir::Type::Ptr, lir::Type::Ptr, lir::Type::F64]);
    assert_eq!(gfn.sig.returns, vec![lir::Type::F64]);
    // Two accumulating read-modify-write sequences against the shadow.
    assert_eq!(count_opcode(gfn, Opcode::Store), 2);
    assert!(count_opcode(gfn, Opcode::Gep) >= 2);
}

/// The malloc/free pair: the allocation gets a zeroed anti-allocation,
/// the free is erased from the forward pass and both buffers are
/// released in reverse.
#[test]
fn allocation_round_trip() {
    let mut module = parse_module(
        r#"
function %boxed(f64) -> f64 {
    fn0 = %malloc(i64) -> ptr
    fn1 = %free(ptr)
block0(v0: f64):
    v1 = iconst.i64 8
    v2 = call fn0(v1)
    store v0, v2
    v3 = load.f64 v2
    call fn1(v2)
    ret v3
}
"#,
    )
    .unwrap();
    let mut ctx = ctx();
    let func = module.lookup_func("boxed").unwrap();
    let grad = differentiate(&mut ctx, &mut module, func, &[false], true);

    let gfn = &module.funcs[grad];
    // Primal allocation plus its anti-allocation.
    assert_eq!(count_calls_to(gfn, "malloc"), 2);
    // Shadow zeroing.
    assert_eq!(count_opcode(gfn, Opcode::Memset), 1);
    // The erased forward free and the anti-allocation's release both
    // happen in the reverse pass.
    assert_eq!(count_calls_to(gfn, "free"), 2);
    assert_eq!(gfn.sig.returns, vec![lir::Type::F64, lir::Type::F64]);
}

/// A reduction loop: the reverse pass runs a countdown driven by the
/// cached trip count and rebuilds `x[i]` from the buffered index.
#[test]
fn loop_reduction() {
    let mut module = parse_module(
        r#"
function %sinsum(ptr, i64) -> f64 {
block0(v0: ptr, v1: i64):
    v2 = iconst.i64 0
    v3 = fconst.f64 0.0
    jmp block1

block1:
    v4 = phi i64 [v2, block0], [v10, block2]
    v5 = phi f64 [v3, block0], [v8, block2]
    v6 = ilt v4, v1
    br v6, block2, block3

block2:
    v7 = gep.f64 v0, v4
    v9 = load.f64 v7
    v11 = sin v9
    v8 = fadd v5, v11
    v12 = iconst.i64 1
    v10 = iadd v4, v12
    jmp block1

block3:
    ret v5
}
"#,
    )
    .unwrap();
    let mut ctx = ctx();
    let func = module.lookup_func("sinsum").unwrap();
    let grad = differentiate(&mut ctx, &mut module, func, &[false, true], true);

    let gfn = &module.funcs[grad];
    // The adjoint of sin shows up exactly once, in the reverse body.
    assert_eq!(count_opcode(gfn, Opcode::Cos), 1);
    // The loop-variant index is buffered per iteration.
    assert!(count_calls_to(gfn, "__ad_arr_set_i64") >= 1);
    assert!(count_calls_to(gfn, "__ad_arr_get_i64") >= 1);
    assert!(count_calls_to(gfn, "__ad_arr_new") >= 1);
    assert_eq!(
        count_calls_to(gfn, "__ad_arr_new"),
        count_calls_to(gfn, "__ad_arr_free")
    );
    // The cotangent lands in the shadow of the array.
    assert!(count_opcode(gfn, Opcode::Store) >= 1);
}

/// Mutually recursive functions close into exactly one augmented primal
/// and one gradient each; the outer tape is boxed behind an opaque
/// pointer while the inner one stays inline.
#[test]
fn mutual_recursion_closes() {
    let mut module = parse_module(
        r#"
function %ping(f64) -> f64 {
    fn0 = %pong(f64) -> f64
block0(v0: f64):
    v1 = call fn0(v0)
    v2 = fmul v1, v0
    ret v2
}

function %pong(f64) -> f64 {
    fn0 = %ping(f64) -> f64
block0(v0: f64):
    v1 = call fn0(v0)
    v2 = fadd v1, v1
    ret v2
}
"#,
    )
    .unwrap();
    let mut ctx = ctx();
    let ping = module.lookup_func("ping").unwrap();
    let key = key_for(&ctx, &module, ping, &[false]);

    let aug_ping = create_augmented_primal(&mut ctx, &mut module, key.clone());
    assert!(aug_ping.tape_boxed, "the self-referential tape must be boxed");

    // The inner augmentation was created along the way and is inline.
    let pong_aug = module.lookup_func("pong.aug").expect("inner augmentation exists");
    assert!(module.lookup_func("ping.aug").is_some());
    let _ = pong_aug;

    let grad = create_primal_and_gradient(&mut ctx, &mut module, key.clone(), DerivativeMode::Reverse);
    assert!(module.lookup_func("pong.grad").is_some());

    // Recursive closure: nothing new on a second request.
    let count = module.funcs.len();
    let again = create_primal_and_gradient(&mut ctx, &mut module, key, DerivativeMode::Reverse);
    assert_eq!(grad, again);
    assert_eq!(module.funcs.len(), count);

    // The boxed tape travels through the runtime tape routines.
    let aug_fn = &module.funcs[aug_ping.func];
    assert!(count_calls_to(aug_fn, "__ad_tape_new") == 1);
    let grad_fn = &module.funcs[grad.func];
    assert!(count_calls_to(grad_fn, "__ad_tape_free") == 1);
}

/// A branch into `unreachable` produces no reverse code for the dead
/// region.
#[test]
fn unreachable_branch_has_no_reverse() {
    let mut module = parse_module(
        r#"
function %guarded(f64, i1) -> f64 {
block0(v0: f64, v1: i1):
    br v1, block1, block2

block1:
    v2 = fmul v0, v0
    ret v2

block2:
    unreachable
}
"#,
    )
    .unwrap();
    let mut ctx = ctx();
    let func = module.lookup_func("guarded").unwrap();
    let grad = differentiate(&mut ctx, &mut module, func, &[false, true], true);

    let gfn = &module.funcs[grad];
    // Forward region: three blocks; reverse region: only the live path
    // (block1's and block0's reverses).
    assert_eq!(gfn.layout.blocks().count(), 5);
    assert_eq!(count_opcode(gfn, Opcode::Unreachable), 1);
}

/// An uncacheable load is saved into the tape by the augmented primal
/// and arrives in the split gradient as a tape parameter.
#[test]
fn uncacheable_load_is_taped() {
    let mut module = parse_module(
        r#"
function %overwrite(ptr, f64) -> f64 {
block0(v0: ptr, v1: f64):
    v2 = load.f64 v0
    store v1, v0
    v3 = fmul v2, v1
    ret v3
}
"#,
    )
    .unwrap();
    let mut ctx = ctx();
    let func = module.lookup_func("overwrite").unwrap();
    let key = key_for(&ctx, &module, func, &[false, false]);

    let aug = create_augmented_primal(&mut ctx, &mut module, key.clone());
    assert!(!aug.tape_boxed);
    assert_eq!(aug.tape_tys, vec![lir::Type::F64]);
    assert_eq!(aug.slots.len(), 1);
    assert_eq!(aug.slots[0].kind, crate::CacheKind::Primal);

    let grad =
        create_primal_and_gradient(&mut ctx, &mut module, key, DerivativeMode::Reverse);
    assert!(!grad.shadow_return);
    let gfn = &module.funcs[grad.func];
    // (p, p_shadow, x, seed, tape) -> (primal, dx)
    let param_tys: Vec<_> = gfn.sig.param_tys().collect();
    assert_eq!(
        param_tys,
        vec![lir::Type::Ptr, lir::Type::Ptr, lir::Type::F64, lir::Type::F64, lir::Type::F64]
    );
    assert_eq!(gfn.sig.returns, vec![lir::Type::F64, lir::Type::F64]);
}

/// One-instruction programs hit the tabulated adjoints.
#[test]
fn intrinsic_adjoints() {
    let cases: &[(&str, Opcode, Opcode)] = &[
        ("sqrt", Opcode::Sqrt, Opcode::Fdiv),
        ("sin", Opcode::Sin, Opcode::Cos),
        ("cos", Opcode::Cos, Opcode::Sin),
        ("exp", Opcode::Exp, Opcode::Fmul),
        ("log", Opcode::Log, Opcode::Fdiv),
        ("fabs", Opcode::Fabs, Opcode::Select),
    ];
    for (name, op, expected) in cases {
        let src = format!(
            "function %wrap(f64) -> f64 {{\nblock0(v0: f64):\n    v1 = {} v0\n    ret v1\n}}\n",
            name
        );
        let mut module = parse_module(&src).unwrap();
        let mut ctx = ctx();
        let func = module.lookup_func("wrap").unwrap();
        let grad = differentiate(&mut ctx, &mut module, func, &[false], false);
        let gfn = &module.funcs[grad];
        assert!(
            count_opcode(gfn, *expected) >= 1,
            "adjoint of {} should contain {}",
            op.name(),
            expected.name()
        );
    }
}

/// `pow` contributes to both operands: the exponent rule and the
/// logarithmic term.
#[test]
fn pow_rule() {
    let mut module = parse_module(
        r#"
function %powxy(f64, f64) -> f64 {
block0(v0: f64, v1: f64):
    v2 = pow v0, v1
    ret v2
}
"#,
    )
    .unwrap();
    let mut ctx = ctx();
    let func = module.lookup_func("powxy").unwrap();
    let grad = differentiate(&mut ctx, &mut module, func, &[false, false], false);
    let gfn = &module.funcs[grad];
    assert!(count_opcode(gfn, Opcode::Pow) >= 1);
    assert!(count_opcode(gfn, Opcode::Log) >= 1);
    // Two out-differentials.
    assert_eq!(gfn.sig.returns, vec![lir::Type::F64, lir::Type::F64]);
}

/// Inactive values produce no adjoint code at all: differentiating with
/// every argument constant yields empty out-diff accumulation.
#[test]
fn constant_arguments_stay_silent() {
    let mut module = parse_module(
        r#"
function %affine(f64, f64) -> f64 {
block0(v0: f64, v1: f64):
    v2 = fmul v0, v1
    ret v2
}
"#,
    )
    .unwrap();
    let mut ctx = ctx();
    let func = module.lookup_func("affine").unwrap();
    let grad = differentiate(&mut ctx, &mut module, func, &[false, true], true);
    let gfn = &module.funcs[grad];
    // Only v0 is active: one out-diff, and only one reverse multiply.
    assert_eq!(gfn.sig.returns, vec![lir::Type::F64, lir::Type::F64]);
    assert_eq!(count_opcode(gfn, Opcode::Fmul), 2);
}

/// A call in the return block whose result feeds the return directly is
/// fused into a single combined sub-gradient call.
#[test]
fn tail_call_fusion() {
    let mut module = parse_module(
        r#"
function %inner(f64) -> f64 readnone {
block0(v0: f64):
    v1 = fmul v0, v0
    ret v1
}

function %outer(f64) -> f64 {
    fn0 = %inner(f64) -> f64 readnone
block0(v0: f64):
    v1 = call fn0(v0)
    ret v1
}
"#,
    )
    .unwrap();
    let mut ctx = ctx();
    let func = module.lookup_func("outer").unwrap();
    let grad = differentiate(&mut ctx, &mut module, func, &[false], true);
    let gfn = &module.funcs[grad];
    // The fused path calls the combined gradient of the callee once and
    // performs no split augmented/gradient pair.
    assert_eq!(count_calls_to(gfn, "inner.diffe"), 1);
    assert!(module.lookup_func("inner.aug").is_none());
}
