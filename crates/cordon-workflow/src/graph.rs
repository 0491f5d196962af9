use std::collections::{BTreeSet, HashMap, HashSet};

use thiserror::Error;

use crate::workflow::GraphDef;

#[derive(Debug, Error)]
pub enum GraphError {
  #[error("graph contains a cycle through node '{node_id}'")]
  Cycle { node_id: String },
}

/// Adjacency structure for traversal and analysis.
#[derive(Debug, Clone)]
pub struct Graph {
  /// node_id -> downstream node_ids.
  adjacency: HashMap<String, Vec<String>>,
  /// node_id -> upstream node_ids.
  reverse_adjacency: HashMap<String, Vec<String>>,
}

impl Graph {
  /// Build the adjacency lists from a graph definition.
  ///
  /// Edges naming unknown nodes are skipped; the validator reports them.
  pub fn new(def: &GraphDef) -> Self {
    let known: HashSet<&str> = def.nodes.iter().map(|n| n.id.as_str()).collect();

    let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
    let mut reverse_adjacency: HashMap<String, Vec<String>> = HashMap::new();

    for node in &def.nodes {
      adjacency.entry(node.id.clone()).or_default();
      reverse_adjacency.entry(node.id.clone()).or_default();
    }

    for edge in &def.edges {
      if !known.contains(edge.source.as_str()) || !known.contains(edge.target.as_str()) {
        continue;
      }
      adjacency
        .entry(edge.source.clone())
        .or_default()
        .push(edge.target.clone());
      reverse_adjacency
        .entry(edge.target.clone())
        .or_default()
        .push(edge.source.clone());
    }

    Self {
      adjacency,
      reverse_adjacency,
    }
  }

  /// Downstream nodes for a given node.
  pub fn downstream(&self, node_id: &str) -> &[String] {
    self
      .adjacency
      .get(node_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Upstream nodes for a given node.
  pub fn upstream(&self, node_id: &str) -> &[String] {
    self
      .reverse_adjacency
      .get(node_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Nodes with neither inbound nor outbound edges.
  pub fn orphans(&self) -> Vec<String> {
    self
      .adjacency
      .iter()
      .filter(|(id, down)| down.is_empty() && self.upstream(id).is_empty())
      .map(|(id, _)| id.clone())
      .collect()
  }

  /// Topological order, tie-broken by node id for deterministic plans.
  ///
  /// Kahn's algorithm over a sorted ready set: whenever several nodes have
  /// no remaining predecessors, the lexicographically smallest id leaves
  /// first.
  pub fn topo_order(&self) -> Result<Vec<String>, GraphError> {
    let mut indegree: HashMap<&str, usize> = self
      .adjacency
      .keys()
      .map(|id| (id.as_str(), self.upstream(id).len()))
      .collect();

    let mut ready: BTreeSet<&str> = indegree
      .iter()
      .filter(|(_, d)| **d == 0)
      .map(|(id, _)| *id)
      .collect();

    let mut order = Vec::with_capacity(indegree.len());
    while let Some(id) = ready.pop_first() {
      order.push(id.to_string());
      for next in self.downstream(id) {
        let d = indegree.get_mut(next.as_str()).expect("known node");
        *d -= 1;
        if *d == 0 {
          ready.insert(next.as_str());
        }
      }
    }

    if order.len() < indegree.len() {
      // Some node never reached indegree zero: it sits on a cycle.
      let node_id = indegree
        .iter()
        .filter(|(id, _)| !order.iter().any(|o| o == *id))
        .map(|(id, _)| id.to_string())
        .min()
        .unwrap_or_default();
      return Err(GraphError::Cycle { node_id });
    }

    Ok(order)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::workflow::{EdgeDef, NodeDef};

  fn node(id: &str) -> NodeDef {
    NodeDef {
      id: id.to_string(),
      component_ref: "core.test".to_string(),
      params: serde_json::Map::new(),
      position: None,
      expose_as_run_output: false,
    }
  }

  fn edge(id: &str, source: &str, target: &str) -> EdgeDef {
    EdgeDef {
      id: id.to_string(),
      source: source.to_string(),
      target: target.to_string(),
      source_handle: None,
      target_handle: None,
    }
  }

  #[test]
  fn topo_order_is_deterministic() {
    // diamond: a -> {c, b} -> d; b and c are peers, b sorts first
    let def = GraphDef {
      nodes: vec![node("a"), node("b"), node("c"), node("d")],
      edges: vec![
        edge("e1", "a", "c"),
        edge("e2", "a", "b"),
        edge("e3", "b", "d"),
        edge("e4", "c", "d"),
      ],
      viewport: None,
    };

    let order = Graph::new(&def).topo_order().unwrap();
    assert_eq!(order, vec!["a", "b", "c", "d"]);
  }

  #[test]
  fn cycle_is_detected() {
    let def = GraphDef {
      nodes: vec![node("a"), node("b")],
      edges: vec![edge("e1", "a", "b"), edge("e2", "b", "a")],
      viewport: None,
    };

    let err = Graph::new(&def).topo_order().unwrap_err();
    assert!(matches!(err, GraphError::Cycle { .. }));
  }

  #[test]
  fn orphan_detection() {
    let def = GraphDef {
      nodes: vec![node("a"), node("b"), node("lonely")],
      edges: vec![edge("e1", "a", "b")],
      viewport: None,
    };

    assert_eq!(Graph::new(&def).orphans(), vec!["lonely".to_string()]);
  }
}
