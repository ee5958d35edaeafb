use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::{Endpoint, Graph, ModelSpec, Node, Outputs, PlinyError, Tensor};

/// Input tensors for one run, keyed by declared input name.
pub type Inputs = HashMap<String, Tensor>;

/// Where the caller would like the graph to execute.
///
/// Advisory only: it is recorded on the session but not forwarded to the engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExecutionTarget {
    #[default]
    Cpu,
    Cuda {
        device_id: u32,
    },
}

impl fmt::Display for ExecutionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionTarget::Cpu => f.write_str("cpu"),
            ExecutionTarget::Cuda { device_id } => write!(f, "cuda:{device_id}"),
        }
    }
}

impl FromStr for ExecutionTarget {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw.eq_ignore_ascii_case("cpu") {
            return Ok(ExecutionTarget::Cpu);
        }

        if let Some(rest) = raw.strip_prefix("cuda:") {
            let device_id: u32 = rest
                .parse()
                .map_err(|_| format!("invalid cuda device id: {rest}"))?;
            return Ok(ExecutionTarget::Cuda { device_id });
        }

        Err(format!("unsupported execution target: {raw} (expected cpu or cuda:N)"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub supports_dynamic_shapes: bool,
    pub supports_single_node: bool,
    pub enforces_execution_target: bool,
}

pub trait Backend {
    type Session: GraphSession;

    fn name(&self) -> &'static str;
    fn capabilities(&self) -> BackendCapabilities;
    fn supports_target(&self, target: &ExecutionTarget) -> bool;

    /// Validates `graph`, then binds it to a live session on `endpoint`.
    fn prepare(
        &self,
        graph: &Graph,
        endpoint: &Endpoint,
        target: ExecutionTarget,
    ) -> Result<Self::Session, PlinyError>;

    fn run_whole_graph(
        &self,
        session: &mut Self::Session,
        inputs: &Inputs,
    ) -> Result<Outputs, PlinyError> {
        session.run(inputs)
    }

    /// Never supported: graphs only ever execute whole.
    fn run_single_node(&self, node: &Node, inputs: &[Tensor]) -> Result<Vec<Tensor>, PlinyError> {
        let _ = (node, inputs);
        Err(PlinyError::single_node_unsupported())
    }
}

pub trait GraphSession {
    fn spec(&self) -> &ModelSpec;

    fn run(&mut self, inputs: &Inputs) -> Result<Outputs, PlinyError>;

    /// Releases the remote graph and the connection. Calling it again is a no-op.
    fn close(&mut self);

    /// Whether the requested execution target was actually applied remotely.
    fn target_honored(&self) -> bool;
}
