//! Basic-block control-flow graph reconstruction from a linear instruction
//! stream.

use std::collections::{BTreeMap as Map, BTreeSet as Set};

use derive_more::Display;

use super::instr::Instr;
use super::opcodes;

// A malformed control-flow graph: a jump lands somewhere that is not the
// first instruction of a block.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
#[display(fmt = "malformed cfg: jump to offset {} from block {} does not land on a block head", offset, block)]
pub struct CfgError {
    pub offset: u32,
    pub block: usize,
}
impl std::error::Error for CfgError {}

/// The control-flow graph for a routine.  Blocks are identified by their
/// index in `blocks`; block 0 is the entry.
#[derive(Clone, Debug)]
pub struct Cfg {
    pub blocks: Vec<Vec<Instr>>,
    pub edges: Map<usize, Set<usize>>,
    pub reverse_edges: Map<usize, Set<usize>>,
    pub dead_nodes: Set<usize>,
    /// Offsets of the instructions that return from the routine.
    pub returns: Set<u32>,
}

/// Partition `instrs` into basic blocks and derive edges, dead blocks, and
/// the return set.
pub fn build(instrs: &[Instr]) -> Result<Cfg, CfgError> {
    let blocks = partition(instrs);
    let (edges, reverse_edges) = link(&blocks)?;

    let mut cfg = Cfg {
        blocks,
        edges,
        reverse_edges,
        dead_nodes: Set::new(),
        returns: instrs
            .iter()
            .filter(|instr| opcodes::is_return(instr.opcode))
            .map(|instr| instr.offset)
            .collect(),
    };
    cfg.eliminate_dead();
    Ok(cfg)
}

impl Cfg {
    // an iterator over the live blocks in index order.
    pub fn live_blocks(&self) -> impl Iterator<Item = (usize, &Vec<Instr>)> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.dead_nodes.contains(i))
    }

    // the instruction stream, flattened back out of the block partition.
    pub fn instructions(&self) -> impl Iterator<Item = &Instr> {
        self.blocks.iter().flatten()
    }

    // Block 0 is never dead; every other block is dead iff it is unreachable
    // from block 0.  Dead blocks are dropped from both edge maps, keys and
    // members alike.
    fn eliminate_dead(&mut self) {
        if self.blocks.is_empty() {
            return;
        }

        let mut reachable = Set::new();
        let mut worklist = vec![0];
        while let Some(i) = worklist.pop() {
            if !reachable.insert(i) {
                continue;
            }
            if let Some(succs) = self.edges.get(&i) {
                worklist.extend(succs.iter().copied());
            }
        }

        self.dead_nodes = (0..self.blocks.len())
            .filter(|i| !reachable.contains(i))
            .collect();

        let dead = self.dead_nodes.clone();
        let prune = |edges: &mut Map<usize, Set<usize>>| {
            edges.retain(|i, _| !dead.contains(i));
            for succs in edges.values_mut() {
                succs.retain(|j| !dead.contains(j));
            }
        };
        prune(&mut self.edges);
        prune(&mut self.reverse_edges);
    }

    /// Render the live graph in graphviz digraph syntax, one node per block
    /// labeled with its instructions.
    pub fn dot(&self, name: &str) -> String {
        let mut node_str = String::new();
        let mut edge_str = String::new();

        for (i, block) in self.live_blocks() {
            let mut label = format!("bb{i}:\\l");
            for instr in block {
                label.push_str(&format!("  {instr}\\l"));
            }
            node_str.push_str(&format!("bb{i} [label = \"{label}\"];\n"));
        }
        for (i, succs) in &self.edges {
            for j in succs {
                edge_str.push_str(&format!("bb{i} -> bb{j};\n"));
            }
        }

        format!(
            "digraph {name} {{\nnode [shape=box nojustify=true];\n{node_str}{edge_str}}}\n"
        )
    }
}

// Scan once, starting a new block at every jump target and after every
// branch or return.  A trailing empty block is discarded.
fn partition(instrs: &[Instr]) -> Vec<Vec<Instr>> {
    let mut blocks: Vec<Vec<Instr>> = vec![Vec::new()];
    for instr in instrs {
        if !blocks.last().expect("blocks is never empty").is_empty() && instr.is_jump_target {
            blocks.push(vec![instr.clone()]);
            continue;
        }
        blocks.last_mut().expect("blocks is never empty").push(instr.clone());
        if opcodes::is_branch(instr.opcode) {
            blocks.push(Vec::new());
        }
    }
    if blocks.last().is_some_and(|block| block.is_empty()) {
        blocks.pop();
    }
    blocks
}

// Derive successor and predecessor edges from each block's terminator:
// returns have no successor, unconditional gotos only their target, and
// everything else its jump target (if any) plus the fall-through block.
fn link(
    blocks: &[Vec<Instr>],
) -> Result<(Map<usize, Set<usize>>, Map<usize, Set<usize>>), CfgError> {
    let head_offsets: Map<u32, usize> = blocks
        .iter()
        .enumerate()
        .map(|(i, block)| (block[0].offset, i))
        .collect();

    let mut edges: Map<usize, Set<usize>> = Map::new();
    let mut reverse_edges: Map<usize, Set<usize>> = Map::new();
    let mut insert = |edges: &mut Map<usize, Set<usize>>, i: usize, j: usize| {
        edges.entry(i).or_default().insert(j);
    };

    for (i, block) in blocks.iter().enumerate() {
        let term = block.last().expect("blocks are non-empty");
        if opcodes::is_return(term.opcode) {
            continue;
        }

        let mut succs = Set::new();
        if let Some(target) = term.target() {
            let j = *head_offsets.get(&target).ok_or(CfgError {
                offset: term.offset,
                block: i,
            })?;
            succs.insert(j);
        }
        if !opcodes::is_goto(term.opcode) && i + 1 < blocks.len() {
            succs.insert(i + 1);
        }
        for j in succs {
            insert(&mut edges, i, j);
            insert(&mut reverse_edges, j, i);
        }
    }
    Ok((edges, reverse_edges))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::bytecode::parser::parse;

    // 1 if x.foo() else None
    const CONDITIONAL: &str = "\
         0 LOAD_FAST 0 (x)\n\
         2 LOAD_ATTR 0 (foo)\n\
         4 CALL_FUNCTION 0\n\
         6 POP_JUMP_IF_FALSE 12\n\
         8 LOAD_CONST 1 (1)\n\
        10 RETURN_VALUE\n\
        12 LOAD_CONST 0 (None)\n\
        14 RETURN_VALUE\n";

    fn edges_of(cfg: &Cfg, i: usize) -> Vec<usize> {
        cfg.edges.get(&i).cloned().unwrap_or_default().into_iter().collect()
    }

    #[test]
    fn partitions_at_targets_and_branches() {
        let cfg = build(&parse(CONDITIONAL).unwrap()).unwrap();
        let offsets: Vec<Vec<u32>> = cfg
            .blocks
            .iter()
            .map(|block| block.iter().map(|instr| instr.offset).collect())
            .collect();
        assert_eq!(offsets, vec![vec![0, 2, 4, 6], vec![8, 10], vec![12, 14]]);
    }

    #[test]
    fn links_branch_and_fallthrough() {
        let cfg = build(&parse(CONDITIONAL).unwrap()).unwrap();
        assert_eq!(edges_of(&cfg, 0), vec![1, 2]);
        assert_eq!(edges_of(&cfg, 1), vec![]);
        assert_eq!(cfg.reverse_edges[&2], Set::from([0]));
        assert_eq!(cfg.returns, Set::from([10, 14]));
        assert!(cfg.dead_nodes.is_empty());
    }

    #[test]
    fn goto_suppresses_fallthrough() {
        let cfg = build(
            &parse(
                " 0 LOAD_CONST 0 (None)\n\
                  2 JUMP_FORWARD 2 (to 6)\n\
                  4 POP_TOP\n\
                  6 RETURN_VALUE\n",
            )
            .unwrap(),
        )
        .unwrap();
        assert_eq!(edges_of(&cfg, 0), vec![2]);
        assert_eq!(cfg.dead_nodes, Set::from([1]));
        // dead blocks are gone from both edge maps
        assert!(!cfg.edges.contains_key(&1));
        assert!(!cfg.reverse_edges.values().any(|preds| preds.contains(&1)));
    }

    #[test]
    fn rejects_jumps_off_block_heads() {
        let err = build(
            &parse(
                "0 JUMP_ABSOLUTE 3\n\
                 2 RETURN_VALUE\n",
            )
            .unwrap(),
        )
        .unwrap_err();
        assert_eq!(err, CfgError { offset: 0, block: 0 });
    }

    #[test]
    fn empty_stream_builds_empty_cfg() {
        let cfg = build(&[]).unwrap();
        assert!(cfg.blocks.is_empty());
        assert!(cfg.returns.is_empty());
    }

    #[test]
    fn rebuild_is_idempotent() {
        let cfg = build(&parse(CONDITIONAL).unwrap()).unwrap();
        let flattened: Vec<Instr> = cfg.instructions().cloned().collect();
        let rebuilt = build(&flattened).unwrap();
        assert_eq!(cfg.blocks, rebuilt.blocks);
        assert_eq!(cfg.edges, rebuilt.edges);
    }

    #[test]
    fn dot_lists_blocks_and_arcs() {
        let cfg = build(&parse(CONDITIONAL).unwrap()).unwrap();
        let dot = cfg.dot("f");
        assert!(dot.starts_with("digraph f {"));
        assert!(dot.contains("bb0 -> bb2;"));
        assert!(dot.contains("LOAD_ATTR"));
    }
}
