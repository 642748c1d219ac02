// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Parse-tree walker.
//!
//! Turns a parse tree into two ordered step lists: enter steps in
//! left-to-right pre-order and exit steps in reverse order. Execution
//! runs every enter step first; a step that needs I/O awaits, handing the
//! runtime to other work, and the exit steps run once the enters are
//! done.

use std::collections::VecDeque;

use crate::query::grammar::{Gid, Node};

pub struct Plan<'a> {
    pub enter: VecDeque<&'a Node>,
    pub exit: Vec<&'a Node>,
}

/// Gids with an exit callback; these finalize a statement.
fn has_exit(gid: Gid) -> bool {
    matches!(
        gid,
        Gid::Select
            | Gid::List
            | Gid::Count
            | Gid::Drop
            | Gid::Alter
            | Gid::Create
            | Gid::Grant
            | Gid::Revoke
            | Gid::Show
    )
}

pub fn plan(root: &Node) -> Plan<'_> {
    let mut plan = Plan {
        enter: VecDeque::new(),
        exit: Vec::new(),
    };
    walk(root, &mut plan);
    plan.exit.reverse();
    plan
}

fn walk<'a>(node: &'a Node, plan: &mut Plan<'a>) {
    plan.enter.push_back(node);
    for child in &node.children {
        walk(child, plan);
    }
    if has_exit(node.gid) {
        plan.exit.push(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::grammar::parse;

    #[test]
    fn test_enter_is_preorder_exit_reversed() {
        let root = parse("select * from \"cpu\"").unwrap();
        let plan = plan(&root);
        assert_eq!(plan.enter[0].gid, Gid::Select);
        // Every node appears exactly once in the enter list.
        fn count(node: &Node) -> usize {
            1 + node.children.iter().map(count).sum::<usize>()
        }
        assert_eq!(plan.enter.len(), count(&root));
        // Only the statement root has an exit step.
        assert_eq!(plan.exit.len(), 1);
        assert_eq!(plan.exit[0].gid, Gid::Select);
    }
}
