//! Converting the IR to text.
//!
//! `write_function` emits the textual form that `lir_reader` parses back.

use std::fmt::{self, Write};

use crate::dfg::DataFlowGraph;
use crate::entities::{Block, Inst};
use crate::instructions::InstructionData;
use crate::{Function, Module};

/// Write `func` to `w` as equivalent text.
pub fn write_function(w: &mut dyn Write, func: &Function) -> fmt::Result {
    writeln!(w, "function {} {{", func.sig)?;
    let mut any = write_preamble(w, func)?;
    for block in func.layout.blocks() {
        if any {
            writeln!(w)?;
        }
        write_block_header(w, func, block)?;
        for inst in func.layout.block_insts(block) {
            write_instruction(w, func, inst)?;
        }
        any = true;
    }
    writeln!(w, "}}")
}

/// Write a whole module: globals first, then every function.
pub fn write_module(w: &mut dyn Write, module: &Module) -> fmt::Result {
    let mut any = false;
    for (global, data) in &module.globals {
        write!(w, "{} = global {}", global, data.ty)?;
        if let Some(shadow) = data.shadow.expand() {
            write!(w, " shadow {}", shadow)?;
        }
        writeln!(w)?;
        any = true;
    }
    for (_, func) in &module.funcs {
        if any {
            writeln!(w)?;
        }
        write_function(w, func)?;
        any = true;
    }
    Ok(())
}

fn write_preamble(w: &mut dyn Write, func: &Function) -> Result<bool, fmt::Error> {
    let mut any = false;
    for (func_ref, sig) in &func.dfg.signatures {
        writeln!(w, "    {} = {}", func_ref, sig)?;
        any = true;
    }
    for (slot, data) in &func.dfg.stack_slots {
        writeln!(w, "    {} = slot {}", slot, data.ty)?;
        any = true;
    }
    Ok(any)
}

/// Write the block header, outdented relative to the instructions:
///
/// ```text
/// block0(v0: f64, v1: ptr):
/// block3:
/// ```
fn write_block_header(w: &mut dyn Write, func: &Function, block: Block) -> fmt::Result {
    write!(w, "{}", block)?;
    let mut params = func.dfg.block_params(block).iter();
    if let Some(first) = params.next() {
        write!(w, "({}: {}", first, func.dfg.value_ty(*first))?;
        for param in params {
            write!(w, ", {}: {}", param, func.dfg.value_ty(*param))?;
        }
        write!(w, ")")?;
    }
    writeln!(w, ":")
}

fn write_instruction(w: &mut dyn Write, func: &Function, inst: Inst) -> fmt::Result {
    write!(w, "    ")?;
    let mut has_results = false;
    for r in func.dfg.inst_results(inst) {
        if has_results {
            write!(w, ", {}", r)?;
        } else {
            write!(w, "{}", r)?;
            has_results = true;
        }
    }
    if has_results {
        write!(w, " = ")?;
    }
    let opcode = func.dfg[inst].opcode();
    match func.dfg[inst] {
        // Type-controlled instructions print the type after a dot.
        InstructionData::UnaryTy { ty, .. }
        | InstructionData::UnaryIeee64 { ty, .. }
        | InstructionData::UnaryInt { ty, .. }
        | InstructionData::Gep { elem_ty: ty, .. } => write!(w, "{}.{}", opcode, ty)?,
        _ => write!(w, "{}", opcode)?,
    }
    write_operands(w, &func.dfg, inst)?;
    writeln!(w)
}

/// Write the operands of `inst` to `w` with a prepended space.
pub fn write_operands(w: &mut dyn Write, dfg: &DataFlowGraph, inst: Inst) -> fmt::Result {
    use InstructionData::*;
    let pool = &dfg.value_lists;
    match dfg[inst] {
        Unary { arg, .. } | UnaryTy { arg, .. } => write!(w, " {}", arg),
        Binary { args, .. } | Gep { args, .. } => write!(w, " {}, {}", args[0], args[1]),
        Ternary { args, .. } => write!(w, " {}, {}, {}", args[0], args[1], args[2]),
        Extract { arg, lane } => write!(w, " {}, {}", arg, lane),
        Insert { args, lane } => write!(w, " {}, {}, {}", args[0], args[1], lane),
        Shuffle { args, mask } => write!(w, " {}, {}, 0x{:x}", args[0], args[1], mask),
        UnaryIeee64 { imm, .. } => write!(w, " {}", imm),
        UnaryInt { imm, .. } => write!(w, " {}", imm),
        UnaryBool { imm } => write!(w, " {}", imm),
        Nullary { .. } => Ok(()),
        UnaryGlobal { global } => write!(w, " {}", global),
        StackLoad { slot } => write!(w, " {}", slot),
        StackStore { slot, arg } => write!(w, " {}, {}", arg, slot),
        Call { func_ref, ref args } => {
            write!(w, " {}(", func_ref)?;
            write_value_list(w, args.as_slice(pool))?;
            write!(w, ")")
        }
        Jump { destination } => write!(w, " {}", destination),
        Branch { arg, then_dest, else_dest } => {
            write!(w, " {}, {}, {}", arg, then_dest, else_dest)
        }
        Ret { ref args } => {
            let args = args.as_slice(pool);
            if args.is_empty() {
                Ok(())
            } else {
                write!(w, " ")?;
                write_value_list(w, args)
            }
        }
        PhiNode { ref args, ref blocks, ty } => {
            write!(w, " {}", ty)?;
            let args = args.as_slice(pool);
            let blocks = blocks.as_slice(&dfg.block_lists);
            for (i, (val, block)) in args.iter().zip(blocks).enumerate() {
                if i != 0 {
                    write!(w, ",")?;
                }
                write!(w, " [{}, {}]", val, block)?;
            }
            Ok(())
        }
    }
}

fn write_value_list(w: &mut dyn Write, values: &[crate::Value]) -> fmt::Result {
    for (i, val) in values.iter().enumerate() {
        if i != 0 {
            write!(w, ", ")?;
        }
        write!(w, "{}", val)?;
    }
    Ok(())
}
