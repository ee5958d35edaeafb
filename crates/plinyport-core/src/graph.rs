use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::{ModelSpec, PlinyError, Tensor, TensorSpec};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeValue {
    Float(f32),
    Int(i64),
    String(String),
    Floats(Vec<f32>),
    Ints(Vec<i64>),
    Strings(Vec<String>),
    Tensor(Tensor),
}

/// One operator invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub name: String,
    pub op_type: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl Node {
    pub fn new<I, O>(op_type: impl Into<String>, inputs: I, outputs: O) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        Self {
            name: String::new(),
            op_type: op_type.into(),
            inputs: inputs.into_iter().map(Into::into).collect(),
            outputs: outputs.into_iter().map(Into::into).collect(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    fn label(&self, index: usize) -> String {
        if self.name.is_empty() {
            format!("#{index} ({})", self.op_type)
        } else {
            format!("`{}`", self.name)
        }
    }
}

/// An immutable computation graph, as handed over by the graph-format parser.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    name: String,
    nodes: Vec<Node>,
    inputs: Vec<TensorSpec>,
    outputs: Vec<TensorSpec>,
    #[serde(default)]
    initializers: Vec<(String, Tensor)>,
}

impl Graph {
    pub fn builder(name: impl Into<String>) -> GraphBuilder {
        GraphBuilder {
            graph: Graph {
                name: name.into(),
                nodes: Vec::new(),
                inputs: Vec::new(),
                outputs: Vec::new(),
                initializers: Vec::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn inputs(&self) -> &[TensorSpec] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorSpec] {
        &self.outputs
    }

    pub fn initializers(&self) -> &[(String, Tensor)] {
        &self.initializers
    }

    pub fn spec(&self) -> ModelSpec {
        ModelSpec {
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
        }
    }

    /// Checks that the graph can be executed as a whole.
    ///
    /// All problems are collected so callers see every defect at once.
    pub fn validate(&self) -> Result<(), PlinyError> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(PlinyError::InvalidGraph { problems })
        }
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.nodes.is_empty() {
            problems.push("graph has no nodes".to_string());
        }

        let mut sources: HashSet<&str> = HashSet::new();
        for spec in &self.inputs {
            if !sources.insert(spec.name.as_str()) {
                problems.push(format!("duplicate graph input `{}`", spec.name));
            }
        }
        for (name, _) in &self.initializers {
            if !sources.insert(name.as_str()) {
                problems.push(format!("initializer `{name}` redefines an existing tensor"));
            }
        }

        let mut producers: HashMap<&str, usize> = HashMap::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            for out in node.outputs.iter().filter(|o| !o.is_empty()) {
                if sources.contains(out.as_str()) || producers.insert(out.as_str(), idx).is_some() {
                    problems.push(format!(
                        "node {} redefines tensor `{out}`",
                        node.label(idx)
                    ));
                }
            }
        }

        // deps[i] = producers feeding node i
        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (idx, node) in self.nodes.iter().enumerate() {
            // empty name = omitted optional input
            for input in node.inputs.iter().filter(|i| !i.is_empty()) {
                if sources.contains(input.as_str()) {
                    continue;
                }
                match producers.get(input.as_str()) {
                    Some(&producer) => deps[idx].push(producer),
                    None => problems.push(format!(
                        "node {} consumes unknown tensor `{input}`",
                        node.label(idx)
                    )),
                }
            }
        }

        let cyclic = self.cyclic_nodes(&deps);
        if !cyclic.is_empty() {
            let labels: Vec<String> = cyclic
                .iter()
                .map(|&i| self.nodes[i].label(i))
                .collect();
            problems.push(format!("graph contains a cycle through {}", labels.join(", ")));
        } else {
            for (idx, node_deps) in deps.iter().enumerate() {
                if node_deps.iter().any(|&p| p > idx) {
                    problems.push(format!(
                        "node {} is not in topological order",
                        self.nodes[idx].label(idx)
                    ));
                }
            }
        }

        for spec in &self.outputs {
            let name = spec.name.as_str();
            if !sources.contains(name) && !producers.contains_key(name) {
                problems.push(format!("graph output `{name}` is never produced"));
            }
        }

        let declared = self.inputs.iter().map(|s| ("input", s));
        for (role, spec) in declared.chain(self.outputs.iter().map(|s| ("output", s))) {
            if !spec.dtype.is_supported() {
                problems.push(format!(
                    "graph {role} `{}` has dtype {}, which cannot cross the wire",
                    spec.name, spec.dtype
                ));
            }
        }

        problems
    }

    /// Kahn's algorithm; returns the nodes that never become ready.
    fn cyclic_nodes(&self, deps: &[Vec<usize>]) -> Vec<usize> {
        let mut pending: Vec<usize> = deps.iter().map(Vec::len).collect();
        let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); deps.len()];
        for (idx, node_deps) in deps.iter().enumerate() {
            for &p in node_deps {
                consumers[p].push(idx);
            }
        }

        let mut ready: VecDeque<usize> = (0..deps.len()).filter(|&i| pending[i] == 0).collect();
        let mut done = vec![false; deps.len()];
        while let Some(idx) = ready.pop_front() {
            done[idx] = true;
            for &c in &consumers[idx] {
                pending[c] -= 1;
                if pending[c] == 0 {
                    ready.push_back(c);
                }
            }
        }

        (0..deps.len()).filter(|&i| !done[i]).collect()
    }
}

pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    pub fn input(mut self, spec: TensorSpec) -> Self {
        self.graph.inputs.push(spec);
        self
    }

    pub fn output(mut self, spec: TensorSpec) -> Self {
        self.graph.outputs.push(spec);
        self
    }

    pub fn initializer(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.graph.initializers.push((name.into(), tensor));
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        self.graph.nodes.push(node);
        self
    }

    /// Builds without validating; see [`Graph::validate`].
    pub fn build(self) -> Graph {
        self.graph
    }
}
