use std::collections::{HashMap, HashSet, VecDeque};

use stepwise_core::error::{Result, StepwiseError};

use super::edge::Branch;
use super::node::{NodeKind, OutputFormat};
use super::WorkflowGraph;

impl WorkflowGraph {
    /// Check the structural invariants a graph must hold before it may run.
    ///
    /// The first violation found is returned, naming the node when one is at fault.
    pub fn validate(&self) -> Result<()> {
        self.check_ids()?;
        let start = self.check_terminals()?;
        self.check_edges()?;
        for node in &self.nodes {
            self.check_degree(&node.id, &node.kind, node.id == start)?;
            check_config(&node.id, &node.kind)?;
        }
        self.check_reachable(&start)?;
        self.check_cycles()?;
        Ok(())
    }

    fn check_ids(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.id.is_empty() {
                return Err(StepwiseError::validation("node with empty id", None));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(StepwiseError::validation(
                    format!("duplicate node id '{}'", node.id),
                    Some(&node.id),
                ));
            }
        }
        let mut seen = HashSet::new();
        for edge in &self.edges {
            if !seen.insert(edge.id.as_str()) {
                return Err(StepwiseError::validation(
                    format!("duplicate edge id '{}'", edge.id),
                    None,
                ));
            }
        }
        Ok(())
    }

    /// Exactly one start and at least one end. Returns the start id.
    fn check_terminals(&self) -> Result<String> {
        let starts: Vec<&str> = self
            .nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Start(_)))
            .map(|n| n.id.as_str())
            .collect();
        let start = match starts.as_slice() {
            [] => return Err(StepwiseError::validation("graph has no start node", None)),
            [one] => one.to_string(),
            [_, second, ..] => {
                return Err(StepwiseError::validation(
                    "graph has more than one start node",
                    Some(*second),
                ))
            }
        };
        if !self.nodes.iter().any(|n| matches!(n.kind, NodeKind::End)) {
            return Err(StepwiseError::validation("graph has no end node", None));
        }
        Ok(start)
    }

    fn check_edges(&self) -> Result<()> {
        for edge in &self.edges {
            for endpoint in [&edge.source, &edge.target] {
                if self.node(endpoint).is_none() {
                    return Err(StepwiseError::validation(
                        format!("edge '{}' references unknown node '{}'", edge.id, endpoint),
                        None,
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_degree(&self, id: &str, kind: &NodeKind, is_start: bool) -> Result<()> {
        let incoming = self.incoming(id).count();
        if is_start && incoming > 0 {
            return Err(StepwiseError::validation(
                "start node must not have incoming edges",
                Some(id),
            ));
        }
        if !is_start && incoming == 0 {
            return Err(StepwiseError::validation(
                "node has no incoming edge",
                Some(id),
            ));
        }

        let outgoing: Vec<_> = self.outgoing(id).collect();
        match kind {
            NodeKind::End => {
                if !outgoing.is_empty() {
                    return Err(StepwiseError::validation(
                        "end node must not have outgoing edges",
                        Some(id),
                    ));
                }
            }
            NodeKind::IfElse(_) => {
                let branches: Vec<_> = outgoing.iter().map(|e| e.branch()).collect();
                let ok = outgoing.len() == 2
                    && branches.contains(&Some(Branch::True))
                    && branches.contains(&Some(Branch::False));
                if !ok {
                    return Err(StepwiseError::validation(
                        "if-else node needs exactly two outgoing edges labeled true and false",
                        Some(id),
                    ));
                }
            }
            NodeKind::While(_) => {
                let branches: Vec<_> = outgoing.iter().map(|e| e.branch()).collect();
                let ok = outgoing.len() == 2
                    && branches.contains(&Some(Branch::Body))
                    && branches.contains(&Some(Branch::Exit));
                if !ok {
                    return Err(StepwiseError::validation(
                        "while node needs exactly one body edge and one exit edge",
                        Some(id),
                    ));
                }
            }
            _ => {
                if outgoing.len() != 1 {
                    return Err(StepwiseError::validation(
                        format!(
                            "{} node needs exactly one outgoing edge, found {}",
                            kind.name(),
                            outgoing.len()
                        ),
                        Some(id),
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_reachable(&self, start: &str) -> Result<()> {
        let mut seen: HashSet<&str> = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(id) = queue.pop_front() {
            for edge in self.outgoing(id) {
                if seen.insert(edge.target.as_str()) {
                    queue.push_back(edge.target.as_str());
                }
            }
        }
        match self.nodes.iter().find(|n| !seen.contains(n.id.as_str())) {
            Some(node) => Err(StepwiseError::validation(
                "node is unreachable from start",
                Some(&node.id),
            )),
            None => Ok(()),
        }
    }

    /// Every cycle must pass through a `while` node: with those removed, the
    /// remaining graph has to be acyclic.
    fn check_cycles(&self) -> Result<()> {
        let loops: HashSet<&str> = self
            .nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::While(_)))
            .map(|n| n.id.as_str())
            .collect();

        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &self.edges {
            if loops.contains(edge.source.as_str()) || loops.contains(edge.target.as_str()) {
                continue;
            }
            adjacency
                .entry(edge.source.as_str())
                .or_default()
                .push(edge.target.as_str());
        }

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Open,
            Done,
        }

        let mut marks: HashMap<&str, Mark> = HashMap::new();
        for root in self.nodes.iter().map(|n| n.id.as_str()) {
            if marks.contains_key(root) {
                continue;
            }
            // Iterative DFS: (node, index of next child to visit)
            let mut stack = vec![(root, 0usize)];
            marks.insert(root, Mark::Open);
            while let Some((id, next)) = stack.pop() {
                let children = adjacency.get(id).map(Vec::as_slice).unwrap_or(&[]);
                if let Some(&child) = children.get(next) {
                    stack.push((id, next + 1));
                    match marks.get(child) {
                        Some(Mark::Open) => {
                            return Err(StepwiseError::validation(
                                "cycle that does not pass through a while node",
                                Some(child),
                            ))
                        }
                        Some(Mark::Done) => {}
                        None => {
                            marks.insert(child, Mark::Open);
                            stack.push((child, 0));
                        }
                    }
                } else {
                    marks.insert(id, Mark::Done);
                }
            }
        }
        Ok(())
    }
}

fn check_config(id: &str, kind: &NodeKind) -> Result<()> {
    let empty = |field: &str| {
        Err(StepwiseError::validation(
            format!("{} must not be empty", field),
            Some(id),
        ))
    };
    match kind {
        NodeKind::Agent(cfg) => {
            if cfg.instructions.trim().is_empty() {
                return empty("instructions");
            }
            if let OutputFormat::Json {
                schema: Some(schema),
            } = &cfg.output_format
            {
                if let Err(e) = jsonschema::JSONSchema::compile(schema) {
                    return Err(StepwiseError::validation(
                        format!("invalid output schema: {}", e),
                        Some(id),
                    ));
                }
            }
        }
        NodeKind::Transform(cfg) if cfg.script.trim().is_empty() => return empty("script"),
        NodeKind::IfElse(cfg) if cfg.condition.trim().is_empty() => return empty("condition"),
        NodeKind::While(cfg) if cfg.while_condition.trim().is_empty() => {
            return empty("whileCondition")
        }
        NodeKind::Tool(cfg) => {
            if cfg.server.is_empty() {
                return empty("server");
            }
            if cfg.tool.is_empty() {
                return empty("tool");
            }
        }
        _ => {}
    }
    Ok(())
}
