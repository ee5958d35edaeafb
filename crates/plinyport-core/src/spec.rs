use serde::{Deserialize, Serialize};

use crate::{DType, PlinyError, Shape, Tensor};

/// Declared graph input or output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub dtype: DType,
    pub dims: Vec<Option<usize>>, // None = dynamic
}

impl TensorSpec {
    pub fn new(name: impl Into<String>, dtype: DType, dims: Vec<Option<usize>>) -> Self {
        Self {
            name: name.into(),
            dtype,
            dims,
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Concrete shape with every dynamic dimension bound to `dynamic`.
    pub fn bind(&self, dynamic: usize) -> Shape {
        Shape::from_slice(
            &self
                .dims
                .iter()
                .map(|d| d.unwrap_or(dynamic))
                .collect::<Vec<_>>(),
        )
    }

    /// Checks that `tensor` can be fed where this spec is declared.
    ///
    /// Dynamic dimensions accept any size; fixed dimensions must match exactly.
    pub fn check(&self, tensor: &Tensor) -> Result<(), PlinyError> {
        if tensor.dtype() != self.dtype {
            return Err(PlinyError::InputType {
                input: self.name.clone(),
                expected: self.dtype,
                actual: tensor.dtype(),
            });
        }

        let dims = tensor.shape().dims();
        if dims.len() != self.rank() {
            return Err(PlinyError::InputShape {
                input: self.name.clone(),
                detail: format!("expected rank {}, got shape {}", self.rank(), tensor.shape()),
            });
        }

        for (axis, (declared, actual)) in self.dims.iter().zip(dims).enumerate() {
            if let Some(fixed) = declared {
                if fixed != actual {
                    return Err(PlinyError::InputShape {
                        input: self.name.clone(),
                        detail: format!("dimension {axis} must be {fixed}, got {actual}"),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Declared inputs and outputs of a graph, in declaration order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModelSpec {
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

impl ModelSpec {
    pub fn input(&self, name: &str) -> Option<&TensorSpec> {
        self.inputs.iter().find(|s| s.name == name)
    }

    pub fn output_names(&self) -> Vec<String> {
        self.outputs.iter().map(|s| s.name.clone()).collect()
    }
}

/// Named results of one whole-graph run, in the graph's declared output order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Outputs {
    entries: Vec<(String, Tensor)>,
}

impl Outputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.entries.push((name.into(), tensor));
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries.iter().map(|(n, t)| (n.as_str(), t))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IntoIterator for Outputs {
    type Item = (String, Tensor);
    type IntoIter = std::vec::IntoIter<(String, Tensor)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl FromIterator<(String, Tensor)> for Outputs {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
