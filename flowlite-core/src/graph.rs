//! Flow-graph reachability, precomputed at registration.
//!
//! Inclusive (OR) joins need to know whether any live sibling token can
//! still arrive; that question reduces to "is the join reachable from the
//! sibling's current element". Process graphs are small, so the full
//! transitive closure is computed once per registered definition.

use crate::process::SequenceFlow;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::{HashMap, HashSet};

#[derive(Debug)]
pub struct ReachabilityIndex {
    /// element id → set of element ids reachable from it (excluding itself
    /// unless it sits on a cycle).
    reachable: HashMap<String, HashSet<String>>,
}

impl ReachabilityIndex {
    pub fn build<'a>(flows: impl Iterator<Item = &'a SequenceFlow>) -> Self {
        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut nodes: HashMap<String, NodeIndex> = HashMap::new();

        let mut node_of = |graph: &mut DiGraph<String, ()>, id: &str| -> NodeIndex {
            *nodes
                .entry(id.to_string())
                .or_insert_with(|| graph.add_node(id.to_string()))
        };

        for flow in flows {
            let source = node_of(&mut graph, &flow.source);
            let target = node_of(&mut graph, &flow.target);
            graph.add_edge(source, target, ());
        }

        let mut reachable: HashMap<String, HashSet<String>> = HashMap::new();
        for (id, &start) in &nodes {
            let mut seen = HashSet::new();
            let mut dfs = Dfs::new(&graph, start);
            while let Some(node) = dfs.next(&graph) {
                if node != start {
                    seen.insert(graph[node].clone());
                }
            }
            reachable.insert(id.clone(), seen);
        }

        // A node sits on a cycle iff some successor reaches back to it;
        // such nodes are reachable from themselves.
        let mut on_cycle = Vec::new();
        for (id, &start) in &nodes {
            let cyclic = graph.neighbors(start).any(|n| {
                let succ = &graph[n];
                succ == id
                    || reachable
                        .get(succ)
                        .map(|set| set.contains(id.as_str()))
                        .unwrap_or(false)
            });
            if cyclic {
                on_cycle.push(id.clone());
            }
        }
        for id in on_cycle {
            if let Some(set) = reachable.get_mut(&id) {
                set.insert(id.clone());
            }
        }

        Self { reachable }
    }

    /// Whether a token currently positioned at `from` can still arrive at
    /// `to` by following sequence flows.
    pub fn can_reach(&self, from: &str, to: &str) -> bool {
        self.reachable
            .get(from)
            .map(|set| set.contains(to))
            .unwrap_or(false)
    }
}
