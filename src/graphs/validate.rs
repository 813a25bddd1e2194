//! Structural validation run once before execution.
//!
//! Validation is purely structural: id uniqueness, dependency references, and
//! policy sanity per scope. Dependency cycles are deliberately not detected
//! here; a cycle surfaces at runtime as a deadlock when the ready set goes
//! empty with nodes still pending.

use miette::Diagnostic;
use thiserror::Error;

use super::node::{NodeSpec, StepNode, WaitFor};

#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("duplicate node id `{id}` in scope `{scope}`")]
    #[diagnostic(code(weftflow::graphs::duplicate_id))]
    DuplicateId { id: String, scope: String },

    #[error("node `{id}` in scope `{scope}` depends on unknown sibling `{dep}`")]
    #[diagnostic(
        code(weftflow::graphs::unknown_dependency),
        help("depends_on may only reference ids in the same scope")
    )]
    UnknownDependency {
        id: String,
        dep: String,
        scope: String,
    },

    #[error("invalid node `{id}`: {reason}")]
    #[diagnostic(code(weftflow::graphs::invalid_node))]
    InvalidNode { id: String, reason: String },

    #[error("workflow has no nodes")]
    #[diagnostic(code(weftflow::graphs::empty))]
    Empty,
}

/// Validate a workflow's node tree.
pub fn validate(nodes: &[StepNode]) -> Result<(), GraphError> {
    if nodes.is_empty() {
        return Err(GraphError::Empty);
    }
    validate_scope(nodes, "root")
}

fn validate_scope(nodes: &[StepNode], scope: &str) -> Result<(), GraphError> {
    let mut seen = rustc_hash::FxHashSet::default();
    for node in nodes {
        if !seen.insert(node.id.as_str()) {
            return Err(GraphError::DuplicateId {
                id: node.id.clone(),
                scope: scope.to_string(),
            });
        }
    }
    for node in nodes {
        for dep in &node.depends_on {
            if !seen.contains(dep.as_str()) {
                return Err(GraphError::UnknownDependency {
                    id: node.id.clone(),
                    dep: dep.clone(),
                    scope: scope.to_string(),
                });
            }
        }
        validate_node(node, scope)?;
    }
    Ok(())
}

fn invalid(node: &StepNode, reason: impl Into<String>) -> GraphError {
    GraphError::InvalidNode {
        id: node.id.clone(),
        reason: reason.into(),
    }
}

fn validate_node(node: &StepNode, scope: &str) -> Result<(), GraphError> {
    let child = |suffix: &str| format!("{scope}/{}{suffix}", node.id);
    match &node.spec {
        NodeSpec::Step(spec) => {
            if spec.handler.trim().is_empty() {
                return Err(invalid(node, "step handler must not be empty"));
            }
            if let Some(retry) = &spec.retry {
                if retry.max_attempts == 0 {
                    return Err(invalid(node, "retry.max_attempts must be >= 1"));
                }
                if !(0.0..=1.0).contains(&retry.jitter_fraction) {
                    return Err(invalid(node, "retry.jitter_fraction must be in [0, 1]"));
                }
            }
            if let Some(scoring) = &spec.scoring {
                if !(0.0..=1.0).contains(&scoring.minimum) {
                    return Err(invalid(node, "scoring.minimum must be in [0, 1]"));
                }
            }
            Ok(())
        }
        NodeSpec::Parallel { children, wait_for } => {
            if children.is_empty() && *wait_for != WaitFor::All {
                return Err(invalid(
                    node,
                    "parallel with wait_for any/first needs at least one child",
                ));
            }
            validate_scope(children, &child(""))
        }
        NodeSpec::Branch {
            then, otherwise, ..
        } => {
            validate_scope_allow_empty(then, &child("/then"))?;
            validate_scope_allow_empty(otherwise, &child("/else"))
        }
        NodeSpec::Switch { cases, default, .. } => {
            for (i, case) in cases.iter().enumerate() {
                validate_scope_allow_empty(&case.body, &child(&format!("/case{i}")))?;
            }
            validate_scope_allow_empty(default, &child("/default"))
        }
        NodeSpec::Foreach { body, .. } => validate_scope(body, &child("")),
        NodeSpec::Try {
            body,
            catch,
            finally,
        } => {
            validate_scope(body, &child("/body"))?;
            if let Some(catch) = catch {
                validate_scope_allow_empty(catch, &child("/catch"))?;
            }
            if let Some(finally) = finally {
                validate_scope_allow_empty(finally, &child("/finally"))?;
            }
            Ok(())
        }
        NodeSpec::While {
            body,
            max_iterations,
            ..
        } => {
            if *max_iterations == Some(0) {
                return Err(invalid(node, "while.max_iterations must be >= 1"));
            }
            validate_scope(body, &child(""))
        }
        NodeSpec::MapReduce { map, reduce, .. } => {
            validate_scope(std::slice::from_ref(map), &child("/map"))?;
            validate_scope(std::slice::from_ref(reduce), &child("/reduce"))
        }
        NodeSpec::Suspend { .. } => Ok(()),
        NodeSpec::Sleep { duration_ms, until } => {
            if duration_ms.is_none() && until.is_none() {
                return Err(invalid(node, "sleep needs duration_ms or until"));
            }
            Ok(())
        }
    }
}

// Empty branch arms and switch cases are legal; they just produce null.
fn validate_scope_allow_empty(nodes: &[StepNode], scope: &str) -> Result<(), GraphError> {
    if nodes.is_empty() {
        return Ok(());
    }
    validate_scope(nodes, scope)
}
