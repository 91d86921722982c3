//! Control flow graph: successor and predecessor lists for every block,
//! recomputed from the branch instructions of a function.

use cranelift_entity::SecondaryMap;

use crate::entities::{Block, Inst};
use crate::instructions::BranchInfo;
use crate::Function;

/// A basic block denoting where the predecessor edge comes from: the block
/// and its terminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockPredecessor {
    pub block: Block,
    pub inst: Inst,
}

#[derive(Clone, Default)]
struct CfgNode {
    preds: Vec<BlockPredecessor>,
    succs: Vec<Block>,
}

/// The control flow graph maps all blocks of a function to their
/// predecessor and successor blocks.
#[derive(Clone, Default)]
pub struct ControlFlowGraph {
    data: SecondaryMap<Block, CfgNode>,
    valid: bool,
}

impl ControlFlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_function(func: &Function) -> Self {
        let mut cfg = Self::new();
        cfg.compute(func);
        cfg
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.valid = false;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Recompute the whole graph from `func`.
    pub fn compute(&mut self, func: &Function) {
        self.clear();
        for block in func.layout.blocks() {
            let terminator = match func.layout.last_inst(block) {
                Some(inst) => inst,
                None => continue,
            };
            match func.dfg[terminator].analyze_branch() {
                BranchInfo::Jump(dest) => self.add_edge(block, terminator, dest),
                BranchInfo::Cond { then_dest, else_dest, .. } => {
                    self.add_edge(block, terminator, then_dest);
                    if else_dest != then_dest {
                        self.add_edge(block, terminator, else_dest);
                    }
                }
                BranchInfo::NotABranch => {}
            }
        }
        self.valid = true;
    }

    fn add_edge(&mut self, from: Block, from_inst: Inst, to: Block) {
        self.data[from].succs.push(to);
        self.data[to].preds.push(BlockPredecessor { block: from, inst: from_inst });
    }

    pub fn pred_iter(&self, block: Block) -> impl Iterator<Item = Block> + '_ {
        self.data[block].preds.iter().map(|pred| pred.block)
    }

    pub fn preds(&self, block: Block) -> &[BlockPredecessor] {
        &self.data[block].preds
    }

    pub fn succ_iter(&self, block: Block) -> impl Iterator<Item = Block> + '_ {
        self.data[block].succs.iter().copied()
    }

    pub fn num_preds(&self, block: Block) -> usize {
        self.data[block].preds.len()
    }
}
