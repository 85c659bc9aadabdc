use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use weft_core::error::CompileError;
use weft_core::workflow::{
    Binding, FailurePolicy, HandlerRef, InputSpec, RetryPolicy, WorkflowDefinition,
};

use super::expr::{Expression, Scope};

/// Dense index of a step within an [`ExecutionGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// What a compiled step executes.
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    Deterministic {
        handler_id: String,
    },
    ModelBacked {
        tier: String,
        capability: Option<String>,
        escalate: bool,
    },
}

#[derive(Debug, Clone)]
pub enum CompiledBinding {
    Expr {
        expr: Expression,
        default: Option<Value>,
    },
    Literal(Value),
}

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: NodeId,
    pub name: String,
    pub kind: StepKind,
    pub dependencies: Vec<NodeId>,
    pub dependents: Vec<NodeId>,
    pub bindings: Vec<(String, CompiledBinding)>,
    pub retry: RetryPolicy,
    pub on_failure: FailurePolicy,
    pub timeout: Option<Duration>,
}

/// Validated, acyclic form of a workflow definition.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    definition: WorkflowDefinition,
    nodes: Vec<GraphNode>,
    index: HashMap<String, NodeId>,
    order: Vec<NodeId>,
}

impl ExecutionGraph {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &GraphNode {
        &self.nodes[id.0]
    }

    pub fn find(&self, name: &str) -> Option<&GraphNode> {
        self.index.get(name).map(|id| &self.nodes[id.0])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Steps in a dependency-respecting order.
    pub fn topological_order(&self) -> &[NodeId] {
        &self.order
    }

    /// Steps with no dependencies, in declaration order.
    pub fn roots(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.iter().filter(|n| n.dependencies.is_empty())
    }

    pub fn describe(&self) -> DagDescription {
        let nodes = self
            .nodes
            .iter()
            .map(|n| {
                let (kind, handler) = match &n.kind {
                    StepKind::Deterministic { handler_id } => ("deterministic", handler_id.clone()),
                    StepKind::ModelBacked { tier, .. } => ("model", tier.clone()),
                };
                DagNode {
                    name: n.name.clone(),
                    kind: kind.to_string(),
                    handler,
                    capability: match &n.kind {
                        StepKind::ModelBacked { capability, .. } => capability.clone(),
                        StepKind::Deterministic { .. } => None,
                    },
                    depends_on: n
                        .dependencies
                        .iter()
                        .map(|d| self.nodes[d.0].name.clone())
                        .collect(),
                    on_failure: n.on_failure,
                    bindings: n.bindings.iter().map(|(k, _)| k.clone()).collect(),
                }
            })
            .collect();

        let edges = self
            .nodes
            .iter()
            .flat_map(|n| {
                n.dependencies.iter().map(move |d| DagEdge {
                    from: self.nodes[d.0].name.clone(),
                    to: n.name.clone(),
                })
            })
            .collect();

        DagDescription {
            workflow: self.definition.name.clone(),
            description: self.definition.description.clone(),
            inputs: self.definition.inputs.clone(),
            nodes,
            edges,
            topological_order: self
                .order
                .iter()
                .map(|id| self.nodes[id.0].name.clone())
                .collect(),
        }
    }
}

/// Read-only view of a compiled workflow for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct DagDescription {
    pub workflow: String,
    pub description: String,
    pub inputs: Vec<InputSpec>,
    pub nodes: Vec<DagNode>,
    pub edges: Vec<DagEdge>,
    pub topological_order: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DagNode {
    pub name: String,
    pub kind: String,
    /// Handler id for deterministic steps, tier for model-backed steps.
    pub handler: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    pub depends_on: Vec<String>,
    pub on_failure: FailurePolicy,
    pub bindings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DagEdge {
    pub from: String,
    pub to: String,
}

/// Compile a definition into an execution graph. Pure; either the whole
/// definition is accepted or the first problem found is reported.
pub fn compile(def: &WorkflowDefinition) -> Result<ExecutionGraph, CompileError> {
    let mut index = HashMap::with_capacity(def.steps.len());
    for (i, step) in def.steps.iter().enumerate() {
        if index.insert(step.name.clone(), NodeId(i)).is_some() {
            return Err(CompileError::DuplicateStep(step.name.clone()));
        }
    }

    let mut nodes = Vec::with_capacity(def.steps.len());
    for (i, step) in def.steps.iter().enumerate() {
        let mut dependencies = Vec::with_capacity(step.depends_on.len());
        for dep in &step.depends_on {
            if dep == &step.name {
                return Err(CompileError::SelfDependency(step.name.clone()));
            }
            let id = *index
                .get(dep)
                .ok_or_else(|| CompileError::UnknownDependency {
                    step: step.name.clone(),
                    dependency: dep.clone(),
                })?;
            if !dependencies.contains(&id) {
                dependencies.push(id);
            }
        }

        let mut bindings = Vec::with_capacity(step.input_bindings.len());
        for (key, binding) in &step.input_bindings {
            let compiled = match binding {
                Binding::Expr(src) => CompiledBinding::Expr {
                    expr: parse_binding(&step.name, key, src)?,
                    default: None,
                },
                Binding::WithDefault { expr, default } => CompiledBinding::Expr {
                    expr: parse_binding(&step.name, key, expr)?,
                    default: Some(default.clone()),
                },
                Binding::Literal(v) => CompiledBinding::Literal(v.clone()),
            };
            bindings.push((key.clone(), compiled));
        }

        let kind = match &step.handler {
            HandlerRef::Deterministic { id } => StepKind::Deterministic {
                handler_id: id.clone(),
            },
            HandlerRef::Model {
                tier,
                capability,
                escalate,
            } => StepKind::ModelBacked {
                tier: tier.clone(),
                capability: capability.clone(),
                escalate: *escalate,
            },
        };

        nodes.push(GraphNode {
            id: NodeId(i),
            name: step.name.clone(),
            kind,
            dependencies,
            dependents: Vec::new(),
            bindings,
            retry: step.retry.clone(),
            on_failure: step.on_failure,
            timeout: step.timeout_secs.map(Duration::from_secs),
        });
    }

    for i in 0..nodes.len() {
        for d in nodes[i].dependencies.clone() {
            nodes[d.0].dependents.push(NodeId(i));
        }
    }

    let order = topological_sort(&nodes)?;
    check_references(&nodes, &index, &order)?;

    Ok(ExecutionGraph {
        definition: def.clone(),
        nodes,
        index,
        order,
    })
}

fn parse_binding(step: &str, binding: &str, src: &str) -> Result<Expression, CompileError> {
    Expression::parse(src).map_err(|reason| CompileError::InvalidExpression {
        step: step.to_string(),
        binding: binding.to_string(),
        reason,
    })
}

/// Kahn's algorithm. Leftover nodes mean a cycle; one is extracted and reported.
fn topological_sort(nodes: &[GraphNode]) -> Result<Vec<NodeId>, CompileError> {
    let mut in_degree: Vec<usize> = nodes.iter().map(|n| n.dependencies.len()).collect();
    let mut queue: VecDeque<NodeId> = nodes
        .iter()
        .filter(|n| n.dependencies.is_empty())
        .map(|n| n.id)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(id) = queue.pop_front() {
        order.push(id);
        for dep in &nodes[id.0].dependents {
            in_degree[dep.0] -= 1;
            if in_degree[dep.0] == 0 {
                queue.push_back(*dep);
            }
        }
    }

    if order.len() == nodes.len() {
        return Ok(order);
    }

    Err(CompileError::Cycle(extract_cycle(nodes, &in_degree)))
}

/// Walk dependencies among unresolved nodes until one repeats. Every
/// unresolved node has at least one unresolved dependency, so the walk
/// always closes a loop.
fn extract_cycle(nodes: &[GraphNode], in_degree: &[usize]) -> Vec<String> {
    let remaining = |id: &NodeId| in_degree[id.0] > 0;
    let Some(start) = nodes.iter().map(|n| n.id).find(|id| remaining(id)) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut seen = HashMap::from([(start, 0usize)]);
    let mut current = start;
    loop {
        let Some(next) = nodes[current.0].dependencies.iter().copied().find(remaining) else {
            break;
        };
        if let Some(&pos) = seen.get(&next) {
            // Reverse so the cycle reads in execution direction.
            let mut cycle: Vec<String> = path[pos..]
                .iter()
                .rev()
                .map(|id| nodes[id.0].name.clone())
                .collect();
            let first = cycle[0].clone();
            cycle.push(first);
            return cycle;
        }
        seen.insert(next, path.len());
        path.push(next);
        current = next;
    }
    path.iter().map(|id| nodes[id.0].name.clone()).collect()
}

/// A step may only read outputs of steps it (transitively) depends on.
fn check_references(
    nodes: &[GraphNode],
    index: &HashMap<String, NodeId>,
    order: &[NodeId],
) -> Result<(), CompileError> {
    let mut ancestors: Vec<HashSet<NodeId>> = vec![HashSet::new(); nodes.len()];
    for id in order {
        let mut set = HashSet::new();
        for dep in &nodes[id.0].dependencies {
            set.insert(*dep);
            set.extend(ancestors[dep.0].iter().copied());
        }
        ancestors[id.0] = set;
    }

    for node in nodes {
        for (_, binding) in &node.bindings {
            let CompiledBinding::Expr { expr, .. } = binding else {
                continue;
            };
            for path in expr.paths() {
                let target = index.get(&path.head);
                let readable = match (path.scope, target) {
                    (Scope::Inputs, _) => true,
                    (Scope::Either, None) => true,
                    (Scope::Steps, None) => false,
                    (Scope::Steps | Scope::Either, Some(id)) => ancestors[node.id.0].contains(id),
                };
                if !readable {
                    return Err(CompileError::UndeclaredReference {
                        step: node.name.clone(),
                        reference: path.head.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}
