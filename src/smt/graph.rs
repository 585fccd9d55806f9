//! Program graph for learned solver selection
//!
//! The graph mirrors the term DAG of a query. Node 0 is a root `AND` that
//! every assertion hangs off. Each distinct symbol also gets a `CONTEXT`
//! node, created on first declaration, that all of its occurrences point at.
//! Node features are the numeric AST codes below, one-hot encoded over
//! [`NODE_FEATURES`] by the consumer.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::smt::query::{Query, Witness};
use crate::smt::term::{BvBinaryOp, BvCompareOp, BvUnaryOp, Term, TermKind};
use crate::smt::{SatResult, SolverBackend, SolverError};

/// Width of the one-hot node encoding
pub const NODE_FEATURES: usize = 67;

/// AST codes understood by the selection model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum NodeKind {
    And = 2,
    Or = 3,
    Not = 4,
    Implies = 5,
    Symbol = 7,
    BoolConstant = 10,
    Equals = 18,
    Ite = 19,
    BvConstant = 21,
    BvNot = 22,
    BvAnd = 23,
    BvOr = 24,
    BvXor = 25,
    BvConcat = 26,
    BvUlt = 28,
    BvUle = 29,
    BvNeg = 30,
    BvAdd = 31,
    BvSub = 32,
    BvMul = 33,
    BvUdiv = 34,
    BvUrem = 35,
    BvShl = 36,
    BvLshr = 37,
    BvSlt = 42,
    BvSle = 43,
    BvSdiv = 45,
    BvSrem = 46,
    BvAshr = 47,
    /// Extraction is reported under this code, as the model was trained on it
    BvToNatural = 65,
    Context = 66,
}

impl NodeKind {
    pub fn code(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgramGraph {
    pub nodes: Vec<u32>,
    pub out_edges: Vec<u32>,
    pub in_edges: Vec<u32>,
    pub edge_attr: Vec<u32>,
    pub problem_type: u32,
}

impl ProgramGraph {
    fn with_root() -> Self {
        Self {
            nodes: vec![NodeKind::And.code()],
            ..Self::default()
        }
    }

    fn add_node(&mut self, kind: NodeKind) -> u32 {
        self.nodes.push(kind.code());
        (self.nodes.len() - 1) as u32
    }

    fn add_edge(&mut self, from: u32, to: u32, attr: u32) {
        self.out_edges.push(from);
        self.in_edges.push(to);
        self.edge_attr.push(attr);
    }

    /// Parent/child edge pair
    fn link(&mut self, parent: u32, child: u32) {
        self.add_edge(parent, child, 0);
        self.add_edge(child, parent, 1);
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edge_attr.len()
    }

    pub fn from_query(query: &Query) -> Self {
        let mut builder = GraphBuilder {
            graph: ProgramGraph::with_root(),
            contexts: HashMap::new(),
            emitted: HashMap::new(),
        };
        for name in query.declarations.keys() {
            let ctx = builder.graph.add_node(NodeKind::Context);
            builder.contexts.insert(name.clone(), ctx);
        }
        for formula in query.formulas() {
            let node = builder.emit(&formula);
            builder.graph.link(0, node);
        }
        builder.graph
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

struct GraphBuilder {
    graph: ProgramGraph,
    contexts: HashMap<String, u32>,
    emitted: HashMap<usize, u32>,
}

impl GraphBuilder {
    fn emit(&mut self, term: &Term) -> u32 {
        if let Some(&node) = self.emitted.get(&term.id()) {
            return node;
        }
        let node = match term.kind() {
            TermKind::ZeroExt { arg, .. } => {
                let zeros = self.graph.add_node(NodeKind::BvConstant);
                let arg = self.emit(arg);
                self.concat(zeros, arg)
            }
            TermKind::SignExt { arg, .. } => {
                // ite(top bit == 0, zeros, ones) ++ arg
                let arg_node = self.emit(arg);
                let top = self.graph.add_node(NodeKind::BvToNatural);
                self.graph.link(top, arg_node);
                let zero_bit = self.graph.add_node(NodeKind::BvConstant);
                let eq = self.graph.add_node(NodeKind::Equals);
                self.graph.link(eq, top);
                self.graph.link(eq, zero_bit);
                let zeros = self.graph.add_node(NodeKind::BvConstant);
                let ones = self.graph.add_node(NodeKind::BvConstant);
                let ite = self.graph.add_node(NodeKind::Ite);
                self.graph.link(ite, eq);
                self.graph.link(ite, zeros);
                self.graph.link(ite, ones);
                self.concat(ite, arg_node)
            }
            kind => {
                let node = self.graph.add_node(node_kind(kind));
                for child in term.children() {
                    let c = self.emit(child);
                    self.graph.link(node, c);
                }
                if let TermKind::Symbol { name, .. } = kind {
                    if let Some(&ctx) = self.contexts.get(name) {
                        self.graph.add_edge(node, ctx, 2);
                    }
                }
                node
            }
        };
        self.emitted.insert(term.id(), node);
        node
    }

    fn concat(&mut self, high: u32, low: u32) -> u32 {
        let node = self.graph.add_node(NodeKind::BvConcat);
        self.graph.link(node, high);
        self.graph.link(node, low);
        node
    }
}

fn node_kind(kind: &TermKind) -> NodeKind {
    match kind {
        TermKind::BoolConst(_) => NodeKind::BoolConstant,
        TermKind::BvConst { .. } => NodeKind::BvConstant,
        TermKind::Symbol { .. } => NodeKind::Symbol,
        TermKind::Not(_) => NodeKind::Not,
        TermKind::And(_) => NodeKind::And,
        TermKind::Or(_) => NodeKind::Or,
        TermKind::Implies(..) => NodeKind::Implies,
        TermKind::Eq(..) => NodeKind::Equals,
        TermKind::Ite(..) => NodeKind::Ite,
        TermKind::BvUnary(BvUnaryOp::Not, _) => NodeKind::BvNot,
        TermKind::BvUnary(BvUnaryOp::Neg, _) => NodeKind::BvNeg,
        TermKind::BvBinary(op, ..) => match op {
            BvBinaryOp::Add => NodeKind::BvAdd,
            BvBinaryOp::Sub => NodeKind::BvSub,
            BvBinaryOp::Mul => NodeKind::BvMul,
            BvBinaryOp::Udiv => NodeKind::BvUdiv,
            BvBinaryOp::Sdiv => NodeKind::BvSdiv,
            BvBinaryOp::Urem => NodeKind::BvUrem,
            BvBinaryOp::Srem => NodeKind::BvSrem,
            BvBinaryOp::And => NodeKind::BvAnd,
            BvBinaryOp::Or => NodeKind::BvOr,
            BvBinaryOp::Xor => NodeKind::BvXor,
            BvBinaryOp::Shl => NodeKind::BvShl,
            BvBinaryOp::Lshr => NodeKind::BvLshr,
            BvBinaryOp::Ashr => NodeKind::BvAshr,
        },
        TermKind::BvCompare(op, ..) => match op {
            BvCompareOp::Ult => NodeKind::BvUlt,
            BvCompareOp::Ule => NodeKind::BvUle,
            BvCompareOp::Slt => NodeKind::BvSlt,
            BvCompareOp::Sle => NodeKind::BvSle,
        },
        TermKind::Extract { .. } => NodeKind::BvToNatural,
        TermKind::ZeroExt { .. } | TermKind::SignExt { .. } => NodeKind::BvConcat,
    }
}

/// Encodes queries as [`ProgramGraph`]s; it never decides satisfiability
#[derive(Debug, Default)]
pub struct GraphBackend {
    graph: Option<ProgramGraph>,
}

impl GraphBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn graph(&self) -> Option<&ProgramGraph> {
        self.graph.as_ref()
    }

    pub fn into_graph(self) -> Option<ProgramGraph> {
        self.graph
    }
}

impl SolverBackend for GraphBackend {
    fn name(&self) -> String {
        "sibyl".to_string()
    }

    fn convert(&mut self, query: &Query) -> Result<(), SolverError> {
        let graph = ProgramGraph::from_query(query);
        debug!(
            nodes = graph.num_nodes(),
            edges = graph.num_edges(),
            "built program graph"
        );
        self.graph = Some(graph);
        Ok(())
    }

    fn dec_solve(&mut self) -> Result<SatResult, SolverError> {
        if self.graph.is_none() {
            return Err(SolverError::NotConverted);
        }
        Ok(SatResult::Unknown("sibyl cannot decide queries".into()))
    }

    fn witness(&mut self) -> Result<Option<Witness>, SolverError> {
        Err(SolverError::Unsupported {
            backend: self.name(),
            operation: "witness",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smt::sort::Sort;

    fn sample_query() -> Query {
        let x = Term::symbol("x#1", Sort::BitVec(8));
        let mut q = Query::new();
        q.assert(Term::eq(
            x.clone(),
            Term::bv_binary(BvBinaryOp::Add, x.clone(), Term::bv(1, 8)),
        ));
        q.add_claim(0, "c", Term::tt(), Term::bv_compare(BvCompareOp::Ult, x, Term::bv(9, 8)), Term::tt());
        q
    }

    #[test]
    fn test_root_and_context_nodes() {
        let g = ProgramGraph::from_query(&sample_query());
        assert_eq!(g.nodes[0], NodeKind::And.code());
        assert_eq!(g.nodes[1], NodeKind::Context.code());
        assert_eq!(g.problem_type, 0);
        assert_eq!(g.out_edges.len(), g.in_edges.len());
        assert_eq!(g.out_edges.len(), g.edge_attr.len());
        assert!(g.nodes.iter().all(|&n| (n as usize) < NODE_FEATURES));

        // the symbol node is shared and points at its context once
        let symbol_nodes = g.nodes.iter().filter(|&&n| n == NodeKind::Symbol.code()).count();
        assert_eq!(symbol_nodes, 1);
        let ctx_edges = g.edge_attr.iter().filter(|&&a| a == 2).count();
        assert_eq!(ctx_edges, 1);
    }

    #[test]
    fn test_every_formula_hangs_off_root() {
        let q = sample_query();
        let g = ProgramGraph::from_query(&q);
        let root_children = g
            .out_edges
            .iter()
            .zip(&g.edge_attr)
            .filter(|(&from, &attr)| from == 0 && attr == 0)
            .count();
        assert_eq!(root_children, q.formulas().len());
    }

    #[test]
    fn test_json_roundtrip() {
        let g = ProgramGraph::from_query(&sample_query());
        let json = g.to_json().unwrap();
        assert!(json.contains("\"problem_type\":0"));
        let back: ProgramGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(back, g);
    }

    #[test]
    fn test_backend_is_undecided() {
        let mut backend = GraphBackend::new();
        assert!(matches!(backend.dec_solve(), Err(SolverError::NotConverted)));
        backend.convert(&sample_query()).unwrap();
        assert!(!backend.dec_solve().unwrap().is_definitive());
        assert!(backend.witness().is_err());
        assert!(backend.graph().is_some());
    }
}
