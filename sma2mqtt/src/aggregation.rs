//! Derived values computed from inverter measurements and other aggregations.
//!
//! Aggregations may reference each other, so the registered nodes form a
//! dependency graph. [`AggregationGraph::evaluate`] walks that graph once per
//! poll cycle in dependency order; every node is computed at most once per
//! cycle and only after all of its dependencies.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use log::{error, warn};
use serde_derive::Deserialize;
use thiserror::Error;

use crate::broadcast::BroadcastFrame;
use crate::registers;
use crate::snapshot::InverterSnapshot;

pub type NodeId = String;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Sum,
    Average,
    Subtraction,
    Division,
    Multiplication,
    Min,
    Max,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Sum => "sum",
            Operation::Average => "average",
            Operation::Subtraction => "subtraction",
            Operation::Division => "division",
            Operation::Multiplication => "multiplication",
            Operation::Min => "min",
            Operation::Max => "max",
        };
        f.write_str(name)
    }
}

impl Operation {
    fn supports_lists(self) -> bool {
        matches!(self, Operation::Sum | Operation::Average)
    }

    /// Applies the operation to exactly two operands.
    ///
    /// A zero denominator divides to 0; inverters report zero power every
    /// night.
    pub fn apply_pair(self, left: f64, right: f64) -> f64 {
        match self {
            Operation::Sum => left + right,
            Operation::Subtraction => left - right,
            Operation::Division if right == 0. => 0.,
            Operation::Division => left / right,
            Operation::Multiplication => left * right,
            Operation::Average => (left + right) / 2.,
            Operation::Min => left.min(right),
            Operation::Max => left.max(right),
        }
    }

    /// Sum or average over a list of operands. Empty lists yield 0.
    pub fn apply_list(self, values: &[f64]) -> f64 {
        let sum: f64 = values.iter().sum();
        match self {
            Operation::Average if values.is_empty() => 0.,
            Operation::Average => sum / values.len() as f64,
            _ => sum,
        }
    }
}

/// Reference to a value an aggregation is computed from.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Inverter { inverter: String, field: String },
    Aggregation { aggregation: NodeId },
}

impl Operand {
    pub fn inverter(inverter: &str, field: &str) -> Self {
        Operand::Inverter {
            inverter: inverter.to_string(),
            field: field.to_string(),
        }
    }

    pub fn aggregation(id: &str) -> Self {
        Operand::Aggregation {
            aggregation: id.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AggregationKind {
    /// One field summed or averaged across inverters.
    InverterList {
        inverters: Vec<String>,
        field: String,
    },
    /// Other aggregations summed or averaged.
    AggregationList { aggregations: Vec<NodeId> },
    /// Any operation applied to two operands.
    Pair { left: Operand, right: Operand },
}

/// Snapshots and broadcast data an evaluation reads from.
///
/// `snapshots` holds an entry for every registered inverter, empty until its
/// first successful poll.
#[derive(Clone, Copy, Debug)]
pub struct EvaluationContext<'a> {
    pub snapshots: &'a BTreeMap<String, InverterSnapshot>,
    pub broadcast: Option<&'a BroadcastFrame>,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum EvalError {
    #[error("aggregation {0} does not exist")]
    UnknownAggregation(NodeId),
    #[error("inverter {0} does not exist")]
    UnknownInverter(String),
    #[error("inverters have no field {0}")]
    UnknownField(String),
    #[error("{field} of inverter {inverter} is not a number")]
    NonNumeric { inverter: String, field: String },
    #[error("{field} of inverter {inverter} is not available yet")]
    Unavailable { inverter: String, field: String },
    #[error("dependency cycle through {}", .0.join(" -> "))]
    Cycle(Vec<NodeId>),
    #[error("dependency {0} was disabled")]
    DependencyRemoved(NodeId),
    #[error("dependency {0} has no value this cycle")]
    DependencySkipped(NodeId),
}

impl EvalError {
    /// Whether the node can never be computed again as configured.
    pub fn is_permanent(&self) -> bool {
        !matches!(
            self,
            EvalError::Unavailable { .. } | EvalError::DependencySkipped(_)
        )
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum GraphError {
    #[error("aggregation {id}: {operation} is not supported for lists")]
    UnsupportedOperation { id: NodeId, operation: Operation },
    #[error("aggregation {0} has no operands")]
    NoOperands(NodeId),
    #[error("aggregation {0} would depend on itself")]
    Cycle(NodeId),
}

#[derive(Clone, Debug, PartialEq)]
pub struct AggregationNode {
    id: NodeId,
    kind: AggregationKind,
    operation: Operation,
    value: f64,
}

impl AggregationNode {
    pub fn new(id: &str, kind: AggregationKind, operation: Operation) -> Self {
        Self {
            id: id.to_string(),
            kind,
            operation,
            value: 0.,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &AggregationKind {
        &self.kind
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Value of the last successful calculation, 0 before the first.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Ids of the aggregations this node reads.
    pub fn dependencies(&self) -> Vec<&NodeId> {
        match &self.kind {
            AggregationKind::InverterList { .. } => Vec::new(),
            AggregationKind::AggregationList { aggregations } => aggregations.iter().collect(),
            AggregationKind::Pair { left, right } => [left, right]
                .into_iter()
                .filter_map(|operand| match operand {
                    Operand::Aggregation { aggregation } => Some(aggregation),
                    Operand::Inverter { .. } => None,
                })
                .collect(),
        }
    }

    fn validate(&self) -> Result<(), GraphError> {
        let operands = match &self.kind {
            AggregationKind::InverterList { inverters, .. } => inverters.len(),
            AggregationKind::AggregationList { aggregations } => aggregations.len(),
            AggregationKind::Pair { .. } => return Ok(()),
        };
        if operands == 0 {
            return Err(GraphError::NoOperands(self.id.clone()));
        }
        if !self.operation.supports_lists() {
            return Err(GraphError::UnsupportedOperation {
                id: self.id.clone(),
                operation: self.operation,
            });
        }
        Ok(())
    }

    fn inverter_value(ctx: &EvaluationContext<'_>, inverter: &str, field: &str) -> Result<f64, EvalError> {
        let snapshot = ctx
            .snapshots
            .get(inverter)
            .ok_or_else(|| EvalError::UnknownInverter(inverter.to_string()))?;
        match snapshot.get(field) {
            Some(value) => value.as_f64().ok_or_else(|| EvalError::NonNumeric {
                inverter: inverter.to_string(),
                field: field.to_string(),
            }),
            None if registers::find(field).is_none() => {
                Err(EvalError::UnknownField(field.to_string()))
            }
            None => Err(EvalError::Unavailable {
                inverter: inverter.to_string(),
                field: field.to_string(),
            }),
        }
    }

    fn operand_value(
        ctx: &EvaluationContext<'_>,
        aggregations: &HashMap<NodeId, f64>,
        operand: &Operand,
    ) -> Result<f64, EvalError> {
        match operand {
            Operand::Inverter { inverter, field } => Self::inverter_value(ctx, inverter, field),
            Operand::Aggregation { aggregation } => aggregations
                .get(aggregation)
                .copied()
                .ok_or_else(|| EvalError::UnknownAggregation(aggregation.clone())),
        }
    }

    /// Computes and stores the node's value.
    ///
    /// `aggregations` must hold the current values of every dependency. The
    /// result only depends on the operands, so repeated calls with unchanged
    /// inputs yield the same value.
    pub fn calculate_value(
        &mut self,
        ctx: &EvaluationContext<'_>,
        aggregations: &HashMap<NodeId, f64>,
    ) -> Result<f64, EvalError> {
        let value = match &self.kind {
            AggregationKind::InverterList { inverters, field } => {
                let values = inverters
                    .iter()
                    .map(|inverter| Self::inverter_value(ctx, inverter, field))
                    .collect::<Result<Vec<_>, _>>()?;
                self.operation.apply_list(&values)
            }
            AggregationKind::AggregationList { aggregations: ids } => {
                let values = ids
                    .iter()
                    .map(|id| {
                        aggregations
                            .get(id)
                            .copied()
                            .ok_or_else(|| EvalError::UnknownAggregation(id.clone()))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                self.operation.apply_list(&values)
            }
            AggregationKind::Pair { left, right } => {
                let left = Self::operand_value(ctx, aggregations, left)?;
                let right = Self::operand_value(ctx, aggregations, right)?;
                self.operation.apply_pair(left, right)
            }
        };
        self.value = value;
        Ok(value)
    }
}

/// Outcome of one evaluation pass.
#[derive(Debug, Default, PartialEq)]
pub struct Evaluation {
    /// Values of every node computed this cycle.
    pub values: BTreeMap<NodeId, f64>,
    /// Nodes taken out of the graph, with the reason.
    pub removed: Vec<(NodeId, EvalError)>,
    /// Nodes that stay registered but have no value this cycle.
    pub skipped: Vec<(NodeId, EvalError)>,
}

#[derive(Debug, Default)]
pub struct AggregationGraph {
    nodes: BTreeMap<NodeId, AggregationNode>,
}

impl AggregationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<&AggregationNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Registers a node, replacing any node with the same id.
    ///
    /// Dependencies that are not registered yet are accepted; they are
    /// resolved when the graph is evaluated.
    pub fn add(&mut self, node: AggregationNode) -> Result<(), GraphError> {
        node.validate()?;
        if self.reaches(&node, &node.id) {
            return Err(GraphError::Cycle(node.id.clone()));
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Option<AggregationNode> {
        self.nodes.remove(id)
    }

    /// Whether `target` is reachable from the dependencies of `from`,
    /// with `from` standing in for any registered node of the same id.
    fn reaches(&self, from: &AggregationNode, target: &str) -> bool {
        let mut stack: Vec<&NodeId> = from.dependencies();
        let mut seen: Vec<&NodeId> = Vec::new();
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if seen.contains(&id) {
                continue;
            }
            seen.push(id);
            if let Some(node) = self.nodes.get(id) {
                stack.extend(node.dependencies());
            }
        }
        false
    }

    /// Computes every node once, dependencies first.
    ///
    /// Nodes with a missing dependency, a cyclic dependency, a field no
    /// register provides or a non-numeric operand are removed from the graph
    /// and reported; so are their dependents, within the same pass. Nodes whose inputs are merely not available yet are
    /// skipped for this cycle only.
    pub fn evaluate(&mut self, ctx: &EvaluationContext<'_>) -> Evaluation {
        let mut roots = Vec::new();
        let mut rest = Vec::new();
        for node in self.nodes.values() {
            if node.dependencies().is_empty() {
                roots.push(node.id.clone());
            } else {
                rest.push(node.id.clone());
            }
        }

        let mut outcomes = HashMap::new();
        let mut visiting = Vec::new();
        for id in roots.iter().chain(rest.iter()) {
            let _ = self.resolve(id, ctx, &mut outcomes, &mut visiting);
        }

        let mut evaluation = Evaluation::default();
        for id in roots.into_iter().chain(rest) {
            match outcomes.remove(&id) {
                Some(Ok(value)) => {
                    evaluation.values.insert(id, value);
                }
                Some(Err(e)) if e.is_permanent() => {
                    error!("aggregation {id} disabled: {e}");
                    self.nodes.remove(&id);
                    evaluation.removed.push((id, e));
                }
                Some(Err(e)) => {
                    warn!("aggregation {id} skipped: {e}");
                    evaluation.skipped.push((id, e));
                }
                None => {}
            }
        }
        evaluation
    }

    fn resolve(
        &mut self,
        id: &NodeId,
        ctx: &EvaluationContext<'_>,
        outcomes: &mut HashMap<NodeId, Result<f64, EvalError>>,
        visiting: &mut Vec<NodeId>,
    ) -> Result<f64, EvalError> {
        if let Some(outcome) = outcomes.get(id) {
            return outcome.clone();
        }
        if let Some(start) = visiting.iter().position(|visited| visited == id) {
            return Err(EvalError::Cycle(visiting[start..].to_vec()));
        }
        let dependencies: Vec<NodeId> = match self.nodes.get(id) {
            Some(node) => node.dependencies().into_iter().cloned().collect(),
            None => return Err(EvalError::UnknownAggregation(id.clone())),
        };

        visiting.push(id.clone());
        let mut values = HashMap::new();
        // every dependency is resolved so a permanent failure wins over a skip
        let mut failure: Option<EvalError> = None;
        for dependency in &dependencies {
            let e = match self.resolve(dependency, ctx, outcomes, visiting) {
                Ok(value) => {
                    values.insert(dependency.clone(), value);
                    continue;
                }
                Err(EvalError::Cycle(members)) if members.contains(id) => {
                    EvalError::Cycle(members)
                }
                Err(_) if !self.nodes.contains_key(dependency) => {
                    EvalError::UnknownAggregation(dependency.clone())
                }
                Err(e) if e.is_permanent() => EvalError::DependencyRemoved(dependency.clone()),
                Err(_) => EvalError::DependencySkipped(dependency.clone()),
            };
            if failure.as_ref().map_or(true, |first| !first.is_permanent() && e.is_permanent()) {
                failure = Some(e);
            }
        }
        visiting.pop();

        let outcome = match (failure, self.nodes.get_mut(id)) {
            (Some(e), _) => Err(e),
            (None, Some(node)) => node.calculate_value(ctx, &values),
            (None, None) => Err(EvalError::UnknownAggregation(id.clone())),
        };
        outcomes.insert(id.clone(), outcome.clone());
        outcome
    }
}
