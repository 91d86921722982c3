//! Dominator tree, computed with Keith D. Cooper's "Simple, Fast
//! Dominator Algorithm" over a cached CFG postorder.

use std::cmp::Ordering;

use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::SecondaryMap;

use crate::entities::{Block, Inst};
use crate::flowgraph::ControlFlowGraph;
use crate::Function;

#[derive(Clone, Copy, Default, PartialEq, Eq)]
struct DomTreeNode {
    /// Number of this node in a reverse post-order traversal of the CFG,
    /// starting from 2. Unreachable nodes get number 0; number 1 marks a
    /// reachable node that has not been numbered yet.
    rpo_number: u32,

    /// The immediate dominator, `None` for the entry block and for
    /// unreachable blocks.
    idom: PackedOption<Block>,
}

const UNDEF: u32 = 0;
const DONE: u32 = 1;
const SEEN: u32 = 2;

#[derive(Default)]
pub struct DominatorTree {
    nodes: SecondaryMap<Block, DomTreeNode>,

    /// CFG post-order of all reachable blocks.
    postorder: Vec<Block>,

    /// Scratch memory used by `compute_postorder()`.
    stack: Vec<Block>,
}

impl DominatorTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_function(func: &Function, cfg: &ControlFlowGraph) -> Self {
        let mut domtree = Self::new();
        domtree.compute(func, cfg);
        domtree
    }

    /// Reset and compute a CFG post-order and dominator tree.
    pub fn compute(&mut self, func: &Function, cfg: &ControlFlowGraph) {
        debug_assert!(cfg.is_valid());
        self.compute_postorder(func, cfg);
        self.compute_domtree(func, cfg);
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.postorder.clear();
        debug_assert!(self.stack.is_empty());
    }

    /// The CFG post-order that was used to compute the dominator tree.
    ///
    /// This is not updated automatically when the CFG is modified; it is
    /// computed from scratch and cached by `compute()`.
    pub fn cfg_postorder(&self) -> &[Block] {
        &self.postorder
    }

    pub fn is_reachable(&self, block: Block) -> bool {
        self.nodes[block].rpo_number != UNDEF
    }

    pub fn idom(&self, block: Block) -> Option<Block> {
        self.nodes[block].idom.expand()
    }

    /// Does `a` dominate `b`? A block dominates itself.
    pub fn dominates(&self, a: Block, b: Block) -> bool {
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }
        let mut b = b;
        while self.nodes[b].rpo_number > self.nodes[a].rpo_number {
            match self.nodes[b].idom.expand() {
                Some(parent) => b = parent,
                None => return false,
            }
        }
        a == b
    }

    /// Does the definition point of `a` dominate the instruction `b`?
    /// Instructions in the same block are compared by layout order.
    pub fn inst_dominates(&self, func: &Function, a: Inst, b: Inst) -> bool {
        let block_a = func.layout.inst_block(a).expect("instruction not inserted");
        let block_b = func.layout.inst_block(b).expect("instruction not inserted");
        if block_a != block_b {
            return self.dominates(block_a, block_b);
        }
        if a == b {
            return true;
        }
        // Walk forward from `a`; `b` must come later in the same block.
        let mut next = func.layout.next_inst(a);
        while let Some(inst) = next {
            if inst == b {
                return true;
            }
            next = func.layout.next_inst(inst);
        }
        false
    }

    /// Reset all internal data structures and compute a post-order of the
    /// control flow graph.
    fn compute_postorder(&mut self, func: &Function, cfg: &ControlFlowGraph) {
        self.clear();

        match func.layout.entry_block() {
            Some(block) => {
                self.stack.push(block);
                self.nodes[block].rpo_number = SEEN;
            }
            None => return,
        }

        while let Some(block) = self.stack.pop() {
            match self.nodes[block].rpo_number {
                SEEN => {
                    // First pop: scan successors, then revisit.
                    self.nodes[block].rpo_number = DONE;
                    self.stack.push(block);
                    for succ in cfg.succ_iter(block) {
                        if self.nodes[succ].rpo_number == UNDEF {
                            self.nodes[succ].rpo_number = SEEN;
                            self.stack.push(succ);
                        }
                    }
                }
                DONE => {
                    // Second pop: all successors have been processed.
                    self.postorder.push(block);
                }
                _ => unreachable!(),
            }
        }
    }

    fn compute_domtree(&mut self, func: &Function, cfg: &ControlFlowGraph) {
        // Iterate over a reverse post-order of the CFG, skipping the entry.
        let (entry_block, postorder) = match self.postorder.as_slice().split_last() {
            Some((&eb, rest)) => (eb, rest),
            None => return,
        };
        debug_assert_eq!(Some(entry_block), func.layout.entry_block());

        // First pass: assign RPO numbers and initial idom estimates. Due
        // to the nature of the traversal every node visited here has at
        // least one predecessor that was already numbered.
        self.nodes[entry_block].rpo_number = 2;
        for (rpo_idx, &block) in postorder.iter().rev().enumerate() {
            self.nodes[block] = DomTreeNode {
                rpo_number: rpo_idx as u32 + 3,
                idom: self.compute_idom(block, cfg).into(),
            }
        }

        // Iterate until convergence. For reducible control flow this
        // exits after one iteration.
        let mut changed = true;
        while changed {
            changed = false;
            for &block in postorder.iter().rev() {
                let idom = self.compute_idom(block, cfg).into();
                if self.nodes[block].idom != idom {
                    self.nodes[block].idom = idom;
                    changed = true;
                }
            }
        }
    }

    // Compute the immediate dominator of `block` from the current `idom`
    // states of its reachable, already visited predecessors.
    fn compute_idom(&self, block: Block, cfg: &ControlFlowGraph) -> Block {
        let mut reachable_preds =
            cfg.pred_iter(block).filter(|bb| self.nodes[*bb].rpo_number > 1);

        let mut idom =
            reachable_preds.next().expect("block must have one reachable predecessor");

        for pred in reachable_preds {
            idom = self.common_dominator(idom, pred);
        }

        idom
    }

    pub fn common_dominator(&self, mut bb1: Block, mut bb2: Block) -> Block {
        loop {
            let rpo1 = self.nodes[bb1].rpo_number;
            let rpo2 = self.nodes[bb2].rpo_number;
            match rpo1.cmp(&rpo2) {
                Ordering::Less => bb2 = self.nodes[bb2].idom.expect("unreachable block"),
                Ordering::Greater => bb1 = self.nodes[bb1].idom.expect("unreachable block"),
                Ordering::Equal => return bb1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::FuncCursor;
    use crate::{verify_function, AbiParam, FunctionSignature, Type};

    #[test]
    fn diamond() {
        let sig = FunctionSignature::new(
            "diamond",
            vec![AbiParam::new(Type::I1), AbiParam::new(Type::F64)],
            vec![Type::F64],
        );
        let mut func = Function::with_signature(sig);
        let entry = func.create_entry_block();
        let cond = func.params()[0];
        let x = func.params()[1];
        let then_block = func.dfg.make_block();
        let else_block = func.dfg.make_block();
        let join = func.dfg.make_block();
        for block in [then_block, else_block, join] {
            func.layout.append_block(block);
        }
        {
            let mut cur = FuncCursor::at_end(&mut func, entry);
            cur.br(cond, then_block, else_block);
            cur.goto_end(then_block);
            let a = cur.fadd(x, x);
            cur.jump(join);
            cur.goto_end(else_block);
            let b = cur.fmul(x, x);
            cur.jump(join);
            cur.goto_end(join);
            let phi = cur.phi(Type::F64, &[(then_block, a), (else_block, b)]);
            cur.ret(&[phi]);
        }

        let cfg = ControlFlowGraph::with_function(&func);
        let domtree = DominatorTree::with_function(&func, &cfg);
        assert!(domtree.dominates(entry, join));
        assert!(domtree.dominates(entry, then_block));
        assert!(!domtree.dominates(then_block, join));
        assert!(!domtree.dominates(join, entry));
        assert_eq!(domtree.idom(join), Some(entry));
        assert!(verify_function(&func).is_ok());
    }
}
