use std::fmt::Write as _;
use std::hash::Hasher;

use serde::Serialize;
use xxhash_rust::xxh64::Xxh64;

use crate::exec::TaskRunner;

/// Explain node representing a stage with optional metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExplainNode {
    /// Stage kind.
    pub op: String,
    /// Additional properties describing the stage.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub props: Vec<ExplainProp>,
    /// Nested stages.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<ExplainNode>,
}

impl ExplainNode {
    /// Creates a node with the given stage name.
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            props: Vec::new(),
            inputs: Vec::new(),
        }
    }

    /// Value of the first property named `key`.
    pub fn prop(&self, key: &str) -> Option<&str> {
        self.props
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_str())
    }

    /// Copy of the tree with every redactable property value replaced by `?`.
    pub fn redacted(&self) -> ExplainNode {
        ExplainNode {
            op: self.op.clone(),
            props: self
                .props
                .iter()
                .map(|p| ExplainProp {
                    value: if p.redactable { "?".to_owned() } else { p.value.clone() },
                    ..p.clone()
                })
                .collect(),
            inputs: self.inputs.iter().map(ExplainNode::redacted).collect(),
        }
    }

    /// Text rendering, one node per line, children indented two spaces.
    pub fn render_text(&self, redact: bool) -> String {
        let mut out = String::new();
        render(self, 0, redact, &mut out);
        out
    }
}

/// Single property associated with an [`ExplainNode`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExplainProp {
    /// Property key.
    pub key: String,
    /// Property value serialized for display.
    pub value: String,
    /// Whether this property contains literal data that may be redacted.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub redactable: bool,
}

impl ExplainProp {
    /// Property that is always shown.
    pub fn plain(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: false,
        }
    }

    /// Property carrying query literals.
    pub fn literal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: true,
        }
    }
}

/// Builds the explain tree of a task graph.
pub fn explain(task: &dyn TaskRunner) -> ExplainNode {
    let mut node = ExplainNode::new(task.kind().as_str());
    node.props = task.props();
    node.inputs = task
        .children()
        .iter()
        .map(|child| explain(child.as_ref()))
        .collect();
    node
}

/// Deterministic hash of an explain tree.
pub fn plan_hash(node: &ExplainNode) -> u64 {
    let mut hasher = Xxh64::new(0);
    hash_node(node, &mut hasher);
    hasher.finish()
}

fn hash_node(node: &ExplainNode, hasher: &mut Xxh64) {
    hasher.write(node.op.as_bytes());
    for prop in &node.props {
        hasher.write(prop.key.as_bytes());
        hasher.write(prop.value.as_bytes());
    }
    hasher.write_u64(node.inputs.len() as u64);
    for child in &node.inputs {
        hash_node(child, hasher);
    }
}

fn render(node: &ExplainNode, depth: usize, redact: bool, out: &mut String) {
    let _ = write!(out, "{:indent$}{}", "", node.op, indent = depth * 2);
    if !node.props.is_empty() {
        let props: Vec<String> = node
            .props
            .iter()
            .map(|p| {
                let value = if redact && p.redactable { "?" } else { p.value.as_str() };
                format!("{}={}", p.key, value)
            })
            .collect();
        let _ = write!(out, " [{}]", props.join(", "));
    }
    out.push('\n');
    for child in &node.inputs {
        render(child, depth + 1, redact, out);
    }
}
