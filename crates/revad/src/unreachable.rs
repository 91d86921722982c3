//! Blocks from which every path ends in an `unreachable` terminator.
//! No reverse code is generated for them.

use bitset::BitSet;
use lir::{Block, ControlFlowGraph, Function, Opcode};
use workqueue::WorkQueue;

/// Reverse fixed point: seed with blocks that terminate in
/// `unreachable`, then add any block all of whose successors are already
/// in the set. Blocks ending in `ret` never join.
pub fn unreachable_blocks(func: &Function, cfg: &ControlFlowGraph) -> BitSet<Block> {
    let num_blocks = func.dfg.num_blocks();
    let mut set: BitSet<Block> = BitSet::new_empty(num_blocks);
    let mut queue: WorkQueue<Block> = WorkQueue::with_none(num_blocks);

    for block in func.layout.blocks() {
        let terminator = func.layout.last_inst(block).expect("empty block");
        if func.dfg[terminator].opcode() == Opcode::Unreachable {
            set.insert(block);
            queue.extend(cfg.pred_iter(block));
        }
    }

    while let Some(block) = queue.pop() {
        if set.contains(block) {
            continue;
        }
        let terminator = func.layout.last_inst(block).expect("empty block");
        if func.dfg[terminator].opcode() == Opcode::Ret {
            continue;
        }
        let mut succs = cfg.succ_iter(block).peekable();
        if succs.peek().is_some() && cfg.succ_iter(block).all(|succ| set.contains(succ)) {
            set.insert(block);
            queue.extend(cfg.pred_iter(block));
        }
    }

    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use lir::ControlFlowGraph;

    #[test]
    fn propagates_up_single_chains() {
        let func = trapping_function();
        let cfg = ControlFlowGraph::with_function(&func);
        let set = unreachable_blocks(&func, &cfg);
        let blocks: Vec<usize> = set.iter().map(usize::from).collect();
        // block2 traps, block3 only reaches block2; block0/block1 stay.
        assert_eq!(blocks, vec![2, 3]);
    }

    fn trapping_function() -> lir::Function {
        use lir::cursor::FuncCursor;
        use lir::{AbiParam, Function, FunctionSignature, Type};

        let sig = FunctionSignature::new(
            "trapish",
            vec![AbiParam::new(Type::I1)],
            vec![Type::F64],
        );
        let mut func = Function::with_signature(sig);
        let entry = func.create_entry_block();
        let cond = func.params()[0];
        let b1 = func.dfg.make_block();
        let b2 = func.dfg.make_block();
        let b3 = func.dfg.make_block();
        for b in [b1, b2, b3] {
            func.layout.append_block(b);
        }
        let mut cur = FuncCursor::at_end(&mut func, entry);
        cur.br(cond, b1, b3);
        cur.goto_end(b1);
        let ret = cur.fconst(Type::F64, 1.0);
        cur.ret(&[ret]);
        cur.goto_end(b2);
        cur.unreachable();
        cur.goto_end(b3);
        cur.jump(b2);
        func
    }
}
