//! Natural-loop discovery from the dominator tree.
//!
//! The reverse pass supports the canonical rotated-while shape: a header
//! that is the sole exiting block, one back edge from a latch the header
//! dominates, and a dedicated preheader outside the loop. Everything the
//! terminator inverter needs (preheader, latch, membership) is answered
//! from here.

use ahash::AHashMap;
use bitset::BitSet;
use lir::{Block, ControlFlowGraph, DominatorTree, Function};

use crate::fatal;

#[derive(Clone, Debug)]
pub struct Loop {
    pub header: Block,
    pub preheader: Block,
    pub latch: Block,
    /// Blocks of the loop body, header and latch included.
    pub blocks: BitSet<Block>,
}

#[derive(Default)]
pub struct LoopInfo {
    /// Keyed by header block.
    loops: AHashMap<Block, Loop>,
    /// Innermost containing loop of each block.
    containing: AHashMap<Block, Block>,
}

impl LoopInfo {
    pub fn compute(func: &Function, cfg: &ControlFlowGraph, domtree: &DominatorTree) -> LoopInfo {
        let mut info = LoopInfo::default();

        for block in func.layout.blocks() {
            for succ in cfg.succ_iter(block) {
                // A back edge: the target dominates the source.
                if domtree.dominates(succ, block) && domtree.is_reachable(block) {
                    info.add_loop(func, cfg, succ, block);
                }
            }
        }

        // Innermost membership: smaller loops win.
        let mut order: Vec<Block> = info.loops.keys().copied().collect();
        order.sort_by_key(|header| std::cmp::Reverse(info.loops[header].blocks.count()));
        for header in order {
            let blocks: Vec<Block> = info.loops[&header].blocks.iter().collect();
            for block in blocks {
                info.containing.insert(block, header);
            }
        }

        info
    }

    fn add_loop(&mut self, func: &Function, cfg: &ControlFlowGraph, header: Block, latch: Block) {
        if let Some(existing) = self.loops.get(&header) {
            fatal!(
                "loop at {} has multiple back edges ({} and {})",
                header,
                existing.latch,
                latch
            );
        }

        // Gather the body: everything that reaches the latch without
        // passing through the header.
        let num_blocks = func.dfg.num_blocks();
        let mut blocks: BitSet<Block> = BitSet::new_empty(num_blocks);
        blocks.insert(header);
        let mut stack = vec![latch];
        while let Some(block) = stack.pop() {
            if blocks.insert(block) {
                stack.extend(cfg.pred_iter(block));
            }
        }

        let mut preheader = None;
        for pred in cfg.pred_iter(header) {
            if pred == latch {
                continue;
            }
            if blocks.contains(pred) {
                fatal!("loop at {} has an in-loop entry edge from {}", header, pred);
            }
            if preheader.replace(pred).is_some() {
                fatal!("loop at {} has more than one preheader", header);
            }
        }
        let preheader = match preheader {
            Some(preheader) => preheader,
            None => fatal!("loop at {} has no preheader", header),
        };

        self.loops.insert(header, Loop { header, preheader, latch, blocks });
    }

    pub fn is_header(&self, block: Block) -> bool {
        self.loops.contains_key(&block)
    }

    pub fn by_header(&self, header: Block) -> &Loop {
        &self.loops[&header]
    }

    /// The innermost loop containing `block`, if any.
    pub fn containing(&self, block: Block) -> Option<&Loop> {
        self.containing.get(&block).map(|header| &self.loops[header])
    }

    pub fn in_any_loop(&self, block: Block) -> bool {
        self.containing.contains_key(&block)
    }

    pub fn headers(&self) -> impl Iterator<Item = Block> + '_ {
        self.loops.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lir_reader::parse_function;

    #[test]
    fn canonical_while_shape() {
        let func = parse_function(
            "function %f(i64) -> f64 {\n\
             block0(v0: i64):\n\
                 v1 = iconst.i64 0\n\
                 v2 = fconst.f64 0.0\n\
                 jmp block1\n\
             block1:\n\
                 v3 = phi i64 [v1, block0], [v5, block2]\n\
                 v4 = ilt v3, v0\n\
                 br v4, block2, block3\n\
             block2:\n\
                 v6 = iconst.i64 1\n\
                 v5 = iadd v3, v6\n\
                 jmp block1\n\
             block3:\n\
                 ret v2\n\
             }\n",
        )
        .unwrap();
        let cfg = lir::ControlFlowGraph::with_function(&func);
        let domtree = lir::DominatorTree::with_function(&func, &cfg);
        let loops = LoopInfo::compute(&func, &cfg, &domtree);

        let header = Block::from(1usize);
        assert!(loops.is_header(header));
        let lp = loops.by_header(header);
        assert_eq!(lp.preheader, Block::from(0usize));
        assert_eq!(lp.latch, Block::from(2usize));
        assert!(lp.blocks.contains(Block::from(1usize)));
        assert!(lp.blocks.contains(Block::from(2usize)));
        assert!(!lp.blocks.contains(Block::from(3usize)));
        assert!(loops.containing(Block::from(2usize)).is_some());
        assert!(loops.containing(Block::from(3usize)).is_none());
    }
}
