//! Step tree
//!
//! A raw YAML step is classified once, at load time, into a [`StepKind`].
//! The interpreter matches on the kind and never inspects raw keys again.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Section of a document a step was declared in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Section {
    Setup,
    Steps,
    Teardown,
}

impl Section {
    /// YAML key of the section
    pub fn key(&self) -> &'static str {
        match self {
            Section::Setup => "setup",
            Section::Steps => "steps",
            Section::Teardown => "teardown",
        }
    }
}

/// Where a top-level step was declared
///
/// Lets a correction source rewrite the persisted step that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOrigin {
    /// Reference of the declaring document
    pub script: String,
    pub section: Section,
    /// Index within the section's list
    pub index: usize,
}

/// A single unit of execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Skip instead of failing when `condition` is unmet
    #[serde(default)]
    pub optional: bool,

    /// Guard evaluated before the step runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Per-step override of the retry bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<StepOrigin>,

    pub kind: StepKind,
}

impl Step {
    /// Create a step with no common options
    pub fn new(kind: StepKind) -> Self {
        Self {
            description: None,
            optional: false,
            condition: None,
            max_retries: None,
            origin: None,
            kind,
        }
    }

    /// Create a leaf action step
    pub fn action(action: impl Into<String>, params: Map<String, Value>) -> Self {
        Self::new(StepKind::Action {
            action: action.into(),
            params,
            save_as: None,
        })
    }

    /// Human readable label: the description, else a summary of the kind
    pub fn label(&self) -> String {
        if let Some(description) = &self.description {
            return description.clone();
        }
        match &self.kind {
            StepKind::Action { action, .. } => action.clone(),
            StepKind::If { branches, .. } => match branches.first() {
                Some(branch) => format!("if {}", branch.condition),
                None => "if".to_string(),
            },
            StepKind::For {
                binding, source, ..
            } => format!("for {} in {}", binding, source),
            StepKind::Try { .. } => "try".to_string(),
            StepKind::Set { assignments } => {
                let names: Vec<&str> = assignments.iter().map(|a| a.name.as_str()).collect();
                format!("set {}", names.join(", "))
            }
            StepKind::Compose(composition) => format!("compose {}", composition.script),
        }
    }

    /// Action identifier for leaf steps, kind keyword otherwise
    pub fn action_name(&self) -> &str {
        match &self.kind {
            StepKind::Action { action, .. } => action,
            StepKind::If { .. } => "if",
            StepKind::For { .. } => "for",
            StepKind::Try { .. } => "try",
            StepKind::Set { .. } => "set",
            StepKind::Compose(composition) => &composition.script,
        }
    }

    /// Number of leaf action steps in this subtree
    pub fn leaf_count(&self) -> usize {
        match &self.kind {
            StepKind::Action { .. } => 1,
            StepKind::Set { .. } => 0,
            StepKind::If {
                branches,
                otherwise,
            } => {
                branches
                    .iter()
                    .flat_map(|b| b.steps.iter())
                    .chain(otherwise.iter())
                    .map(Step::leaf_count)
                    .sum()
            }
            StepKind::For { steps, .. } => steps.iter().map(Step::leaf_count).sum(),
            StepKind::Try {
                body,
                catch,
                finally,
                ..
            } => body
                .iter()
                .chain(catch.iter())
                .chain(finally.iter())
                .map(Step::leaf_count)
                .sum(),
            StepKind::Compose(composition) => composition
                .steps
                .iter()
                .chain(composition.teardown.iter())
                .map(Step::leaf_count)
                .sum(),
        }
    }
}

/// Discriminated step kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Dispatch an action, optionally storing its result
    Action {
        action: String,
        #[serde(default)]
        params: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        save_as: Option<String>,
    },

    /// `if` / `elif` / `else`
    If {
        branches: Vec<Branch>,
        #[serde(default)]
        otherwise: Vec<Step>,
    },

    /// Iterate over a list, a map or a count
    For {
        binding: LoopBinding,
        source: String,
        steps: Vec<Step>,
    },

    /// `try` / `catch` / `finally`
    Try {
        body: Vec<Step>,
        #[serde(default)]
        catch: Vec<Step>,
        #[serde(default)]
        finally: Vec<Step>,
        error_var: String,
    },

    /// Variable assignment
    Set { assignments: Vec<Assignment> },

    /// Inlined composed script, run in an isolated frame
    Compose(Composition),
}

/// One arm of a conditional
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub condition: String,
    pub steps: Vec<Step>,
}

/// Names bound by a `for` loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoopBinding {
    /// `item in items`
    Single(String),
    /// `key, value in mapping` or `index, item in list`
    Pair(String, String),
}

impl LoopBinding {
    pub fn names(&self) -> Vec<&str> {
        match self {
            LoopBinding::Single(name) => vec![name],
            LoopBinding::Pair(first, second) => vec![first, second],
        }
    }
}

impl fmt::Display for LoopBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopBinding::Single(name) => write!(f, "{}", name),
            LoopBinding::Pair(first, second) => write!(f, "{}, {}", first, second),
        }
    }
}

/// A single `set` assignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub name: String,
    pub value: AssignValue,
}

/// Right-hand side of an assignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignValue {
    /// `name = expr` form; placeholders are sub-expressions
    Expression(String),
    /// Mapping form; strings are rendered as templates
    Template(Value),
}

/// A composed script inlined at its call site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Composition {
    /// Reference of the composed script
    pub script: String,
    /// Parameters supplied by the caller, rendered in the caller's scope
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Declared parameter defaults and variables of the composed script
    #[serde(default)]
    pub defaults: Map<String, Value>,
    /// `setup` followed by `steps` of the composed script
    pub steps: Vec<Step>,
    /// Run after `steps`, whether they succeeded or not
    #[serde(default)]
    pub teardown: Vec<Step>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn click() -> Step {
        Step::action("click", Map::new())
    }

    #[test]
    fn test_labels() {
        let mut step = click();
        assert_eq!(step.label(), "click");
        step.description = Some("Press login".into());
        assert_eq!(step.label(), "Press login");

        let looped = Step::new(StepKind::For {
            binding: LoopBinding::Pair("k".into(), "v".into()),
            source: "data".into(),
            steps: vec![],
        });
        assert_eq!(looped.label(), "for k, v in data");
        assert_eq!(looped.action_name(), "for");
    }

    #[test]
    fn test_leaf_count() {
        let tree = Step::new(StepKind::Try {
            body: vec![click(), click()],
            catch: vec![click()],
            finally: vec![Step::new(StepKind::Set {
                assignments: vec![Assignment {
                    name: "x".into(),
                    value: AssignValue::Template(json!(1)),
                }],
            })],
            error_var: "error".into(),
        });
        assert_eq!(tree.leaf_count(), 3);
    }

    #[test]
    fn test_step_serializes() {
        let step = click();
        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value["kind"]["type"], "action");
        let back: Step = serde_json::from_value(value).unwrap();
        assert_eq!(back, step);
    }
}
