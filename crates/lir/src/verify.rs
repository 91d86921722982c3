//! A lightweight IR verifier.
//!
//! Checks layout discipline (terminators, phi placement), operand
//! definedness, phi/predecessor agreement, call and return arities, and
//! the operand typing rules the transform depends on. The builders treat
//! any error from here as fatal.

use std::fmt;

use ahash::AHashMap;

use crate::entities::{Block, Inst};
use crate::flowgraph::ControlFlowGraph;
use crate::instructions::{BranchInfo, InstructionData, Opcode};
use crate::types::Type;
use crate::Function;

#[derive(Debug, Clone)]
pub struct VerifierError {
    pub message: String,
    pub location: Option<Inst>,
}

impl fmt::Display for VerifierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location {
            Some(inst) => write!(f, "{}: {}", inst, self.message),
            None => f.write_str(&self.message),
        }
    }
}

fn err<T>(location: Option<Inst>, message: String) -> Result<T, VerifierError> {
    Err(VerifierError { message, location })
}

pub fn verify_function(func: &Function) -> Result<(), VerifierError> {
    let entry = match func.layout.entry_block() {
        Some(entry) => entry,
        None => return err(None, "function has no entry block".into()),
    };

    let entry_params = func.dfg.block_params(entry);
    if entry_params.len() != func.sig.params.len() {
        return err(
            None,
            format!(
                "entry block has {} params, signature has {}",
                entry_params.len(),
                func.sig.params.len()
            ),
        );
    }
    for (param, abi) in entry_params.iter().zip(&func.sig.params) {
        if func.dfg.value_ty(*param) != abi.ty {
            return err(None, format!("entry param {} does not match the signature", param));
        }
    }

    let cfg = ControlFlowGraph::with_function(func);

    let mut ret_blocks = 0usize;
    for block in func.layout.blocks() {
        verify_block(func, &cfg, block, &mut ret_blocks)?;
    }
    Ok(())
}

fn verify_block(
    func: &Function,
    cfg: &ControlFlowGraph,
    block: Block,
    ret_blocks: &mut usize,
) -> Result<(), VerifierError> {
    let dfg = &func.dfg;
    let terminator = match func.layout.last_inst(block) {
        Some(inst) => inst,
        None => return err(None, format!("{} is empty", block)),
    };
    if !dfg[terminator].opcode().is_terminator() {
        return err(Some(terminator), format!("{} does not end in a terminator", block));
    }
    if dfg[terminator].opcode() == Opcode::Ret {
        *ret_blocks += 1;
        if *ret_blocks > 1 {
            return err(Some(terminator), "more than one ret block".into());
        }
        let args = dfg.inst_args(terminator);
        if args.len() != func.sig.returns.len() {
            return err(Some(terminator), "ret arity does not match the signature".into());
        }
        for (arg, ty) in args.iter().zip(&func.sig.returns) {
            if dfg.value_ty(*arg) != *ty {
                return err(Some(terminator), format!("ret of {} has the wrong type", arg));
            }
        }
    }

    let mut past_phis = false;
    for inst in func.layout.block_insts(block) {
        let opcode = dfg[inst].opcode();
        if opcode.is_terminator() && inst != terminator {
            return err(Some(inst), format!("terminator in the middle of {}", block));
        }
        if opcode == Opcode::Phi {
            if past_phis {
                return err(Some(inst), format!("phi after non-phi instruction in {}", block));
            }
            verify_phi(func, cfg, block, inst)?;
        } else {
            past_phis = true;
        }
        for arg in dfg.inst_args(inst) {
            if !dfg.value_is_valid(*arg) || !dfg.value_is_defined(*arg) {
                return err(Some(inst), format!("use of undefined value {}", arg));
            }
        }
        if let BranchInfo::Cond { then_dest, else_dest, .. } = dfg[inst].analyze_branch() {
            for dest in [then_dest, else_dest] {
                if !func.layout.is_block_inserted(dest) {
                    return err(Some(inst), format!("branch to {} not in the layout", dest));
                }
            }
        }
        if let BranchInfo::Jump(dest) = dfg[inst].analyze_branch() {
            if !func.layout.is_block_inserted(dest) {
                return err(Some(inst), format!("jump to {} not in the layout", dest));
            }
        }
        verify_types(func, inst)?;
    }
    Ok(())
}

fn verify_phi(
    func: &Function,
    cfg: &ControlFlowGraph,
    block: Block,
    inst: Inst,
) -> Result<(), VerifierError> {
    let mut seen: AHashMap<Block, ()> = AHashMap::new();
    for (pred, _val) in func.dfg.phi_edges(inst) {
        if seen.insert(pred, ()).is_some() {
            return err(Some(inst), format!("duplicate phi edge from {}", pred));
        }
    }
    let preds: Vec<Block> = cfg.pred_iter(block).collect();
    if seen.len() != preds.len() || preds.iter().any(|pred| !seen.contains_key(pred)) {
        return err(
            Some(inst),
            format!("phi edges do not match the predecessors of {}", block),
        );
    }
    Ok(())
}

fn verify_types(func: &Function, inst: Inst) -> Result<(), VerifierError> {
    let dfg = &func.dfg;
    let ty = |v| dfg.value_ty(v);
    match dfg[inst] {
        InstructionData::Binary { op, args } => match op {
            Opcode::Fadd
            | Opcode::Fsub
            | Opcode::Fmul
            | Opcode::Fdiv
            | Opcode::Pow
            | Opcode::Fmin
            | Opcode::Fmax => {
                if !ty(args[0]).is_float() || ty(args[0]) != ty(args[1]) {
                    return err(Some(inst), "float binary operands must match".into());
                }
            }
            Opcode::Store => {
                if ty(args[1]) != Type::Ptr {
                    return err(Some(inst), "store destination must be a pointer".into());
                }
            }
            Opcode::Iadd
            | Opcode::Isub
            | Opcode::Imul
            | Opcode::Ishl
            | Opcode::Lshr
            | Opcode::Band
            | Opcode::Bor => {
                if !ty(args[0]).is_int() {
                    return err(Some(inst), "integer binary operands must be integers".into());
                }
            }
            _ => {}
        },
        InstructionData::UnaryTy { op: Opcode::Load, arg, .. } => {
            if ty(arg) != Type::Ptr {
                return err(Some(inst), "load source must be a pointer".into());
            }
        }
        InstructionData::Ternary { op: Opcode::Select, args } => {
            if ty(args[0]) != Type::I1 || ty(args[1]) != ty(args[2]) {
                return err(Some(inst), "malformed select".into());
            }
        }
        InstructionData::Gep { args, .. } => {
            if ty(args[0]) != Type::Ptr || !ty(args[1]).is_int() {
                return err(Some(inst), "gep expects pointer base and integer index".into());
            }
        }
        InstructionData::Branch { arg, .. } => {
            if ty(arg) != Type::I1 {
                return err(Some(inst), "branch condition must be i1".into());
            }
        }
        InstructionData::Call { func_ref, ref args } => {
            let sig = &dfg.signatures[func_ref];
            let args = args.as_slice(&dfg.value_lists);
            if args.len() != sig.params.len() {
                return err(
                    Some(inst),
                    format!("call to %{} has the wrong arity", sig.name),
                );
            }
            for (arg, param) in args.iter().zip(&sig.params) {
                if ty(*arg) != param.ty {
                    return err(
                        Some(inst),
                        format!("call to %{}: argument {} has the wrong type", sig.name, arg),
                    );
                }
            }
        }
        _ => {}
    }
    Ok(())
}
