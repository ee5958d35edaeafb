//! Pure conversions between the graph model and the wire messages.

use std::collections::{BTreeMap, HashSet};

use bytes::Bytes;
use plinyport_core::{
    AttributeValue, DType, Graph, Inputs, ModelSpec, Node, Outputs, PlinyError, Shape, Tensor,
    TensorSpec,
};
use prost::Message;

use crate::v1 as pb;

pub const PROTOCOL_VERSION: u32 = 1;

/// Serializes a graph for upload.
///
/// Deterministic: equal graphs always produce identical bytes.
pub fn encode_graph(graph: &Graph) -> Bytes {
    let msg = pb::Graph {
        name: graph.name().to_string(),
        nodes: graph.nodes().iter().map(node_to_pb).collect(),
        inputs: graph.inputs().iter().map(spec_to_pb).collect(),
        outputs: graph.outputs().iter().map(spec_to_pb).collect(),
        initializers: graph
            .initializers()
            .iter()
            .map(|(name, t)| tensor_to_pb(name, t))
            .collect(),
    };
    Bytes::from(msg.encode_to_vec())
}

pub fn decode_graph(bytes: &[u8]) -> Result<Graph, PlinyError> {
    let msg = pb::Graph::decode(bytes).map_err(|e| PlinyError::malformed(format!("graph: {e}")))?;

    let mut builder = Graph::builder(msg.name);
    for spec in msg.inputs {
        builder = builder.input(spec_from_pb(spec)?);
    }
    for spec in msg.outputs {
        builder = builder.output(spec_from_pb(spec)?);
    }
    for init in msg.initializers {
        let (name, tensor) = tensor_from_pb(init)?;
        builder = builder.initializer(name, tensor);
    }
    for node in msg.nodes {
        builder = builder.node(node_from_pb(node)?);
    }
    Ok(builder.build())
}

/// Little-endian element bytes of `tensor`.
pub fn encode_tensor(tensor: &Tensor) -> Result<Bytes, PlinyError> {
    ensure_supported(tensor.dtype())?;
    Ok(tensor.data().clone())
}

pub fn decode_tensor(bytes: Bytes, dtype: DType, shape: &Shape) -> Result<Tensor, PlinyError> {
    ensure_supported(dtype)?;
    Tensor::from_bytes(dtype, shape.clone(), bytes).map_err(|e| PlinyError::malformed(e.to_string()))
}

/// Encodes run inputs in the declared input order.
pub fn encode_inputs(spec: &ModelSpec, inputs: &Inputs) -> Result<Bytes, PlinyError> {
    let mut tensors = Vec::with_capacity(spec.inputs.len());
    for declared in &spec.inputs {
        let tensor = inputs
            .get(&declared.name)
            .ok_or_else(|| PlinyError::InputShape {
                input: declared.name.clone(),
                detail: "input not supplied".to_string(),
            })?;
        tensors.push(named_tensor_to_pb(&declared.name, tensor)?);
    }
    Ok(Bytes::from(pb::TensorBundle { tensors }.encode_to_vec()))
}

pub fn encode_outputs(outputs: &Outputs) -> Result<Bytes, PlinyError> {
    let tensors = outputs
        .iter()
        .map(|(name, t)| named_tensor_to_pb(name, t))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Bytes::from(pb::TensorBundle { tensors }.encode_to_vec()))
}

pub fn decode_named_tensors(bytes: &[u8]) -> Result<Vec<(String, Tensor)>, PlinyError> {
    let bundle = pb::TensorBundle::decode(bytes)
        .map_err(|e| PlinyError::malformed(format!("tensor bundle: {e}")))?;
    bundle.tensors.into_iter().map(named_tensor_from_pb).collect()
}

/// Decodes a run result, requiring exactly the `expected` output names.
pub fn decode_outputs(bytes: &[u8], expected: &[String]) -> Result<Outputs, PlinyError> {
    let mut received: BTreeMap<String, Tensor> = BTreeMap::new();
    for (name, tensor) in decode_named_tensors(bytes)? {
        if received.insert(name.clone(), tensor).is_some() {
            return Err(PlinyError::malformed(format!("output `{name}` appears twice")));
        }
    }

    let wanted: HashSet<&str> = expected.iter().map(String::as_str).collect();
    let missing: Vec<&str> = expected
        .iter()
        .map(String::as_str)
        .filter(|n| !received.contains_key(*n))
        .collect();
    let unexpected: Vec<&str> = received
        .keys()
        .map(String::as_str)
        .filter(|n| !wanted.contains(n))
        .collect();
    if !missing.is_empty() || !unexpected.is_empty() {
        return Err(PlinyError::malformed(format!(
            "output names mismatch (missing: {missing:?}, unexpected: {unexpected:?})"
        )));
    }

    let mut outputs = Outputs::new();
    for name in expected {
        if let Some(tensor) = received.remove(name) {
            outputs.push(name.clone(), tensor);
        }
    }
    Ok(outputs)
}

/// What an engine says about itself in reply to `Ping`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineInfo {
    pub name: String,
    pub version: String,
    pub workers: u32,
}

pub fn encode_engine_info(info: &EngineInfo) -> Bytes {
    let msg = pb::EngineInfo {
        name: info.name.clone(),
        version: info.version.clone(),
        workers: info.workers,
    };
    Bytes::from(msg.encode_to_vec())
}

pub fn decode_engine_info(bytes: &[u8]) -> Result<EngineInfo, PlinyError> {
    let msg = pb::EngineInfo::decode(bytes)
        .map_err(|e| PlinyError::malformed(format!("engine info: {e}")))?;
    Ok(EngineInfo {
        name: msg.name,
        version: msg.version,
        workers: msg.workers,
    })
}

impl pb::Envelope {
    pub fn new(kind: pb::FrameKind, handle: u64, payload: Bytes) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind: kind as i32,
            handle,
            payload,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(pb::FrameKind::Error, 0, Bytes::from(message.into()))
    }

    /// The error text carried by an `Error` frame.
    pub fn error_message(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

pub fn encode_envelope(envelope: &pb::Envelope) -> Bytes {
    Bytes::from(envelope.encode_to_vec())
}

pub fn decode_envelope(bytes: &[u8]) -> Result<pb::Envelope, PlinyError> {
    let envelope =
        pb::Envelope::decode(bytes).map_err(|e| PlinyError::malformed(format!("envelope: {e}")))?;
    if envelope.version != PROTOCOL_VERSION {
        return Err(PlinyError::malformed(format!(
            "protocol version {} (expected {PROTOCOL_VERSION})",
            envelope.version
        )));
    }
    match pb::FrameKind::try_from(envelope.kind) {
        Ok(pb::FrameKind::FrameUnspecified) | Err(_) => Err(PlinyError::malformed(format!(
            "unknown frame kind {}",
            envelope.kind
        ))),
        Ok(_) => Ok(envelope),
    }
}

fn ensure_supported(dtype: DType) -> Result<(), PlinyError> {
    if dtype.is_supported() {
        Ok(())
    } else {
        Err(PlinyError::UnsupportedDtype { dtype })
    }
}

fn to_proto_dtype(dtype: DType) -> pb::DType {
    match dtype {
        DType::F32 => pb::DType::F32,
        DType::F64 => pb::DType::F64,
        DType::I32 => pb::DType::I32,
        DType::I64 => pb::DType::I64,
        DType::Bool => pb::DType::Bool,
        DType::F16 => pb::DType::F16,
        DType::U8 => pb::DType::U8,
    }
}

fn parse_dtype(raw: i32) -> Result<DType, PlinyError> {
    let dtype = pb::DType::try_from(raw)
        .map_err(|_| PlinyError::malformed(format!("unknown dtype enum value {raw}")))?;
    Ok(match dtype {
        pb::DType::F32 => DType::F32,
        pb::DType::F64 => DType::F64,
        pb::DType::I32 => DType::I32,
        pb::DType::I64 => DType::I64,
        pb::DType::Bool => DType::Bool,
        pb::DType::F16 => DType::F16,
        pb::DType::U8 => DType::U8,
        pb::DType::DtypeUnspecified => return Err(PlinyError::malformed("dtype is unspecified")),
    })
}

fn spec_to_pb(spec: &TensorSpec) -> pb::TensorSpec {
    pb::TensorSpec {
        name: spec.name.clone(),
        dtype: to_proto_dtype(spec.dtype) as i32,
        dims: spec
            .dims
            .iter()
            .map(|d| d.map_or(-1, |d| d as i64))
            .collect(),
    }
}

fn spec_from_pb(spec: pb::TensorSpec) -> Result<TensorSpec, PlinyError> {
    let dtype = parse_dtype(spec.dtype)?;
    let dims = spec
        .dims
        .iter()
        .map(|d| match *d {
            -1 => Ok(None),
            d if d >= 0 => Ok(Some(d as usize)),
            d => Err(PlinyError::malformed(format!("negative dimension {d} in `{}`", spec.name))),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(TensorSpec::new(spec.name, dtype, dims))
}

/// Graph initializers travel as-is; only run payloads are restricted to
/// the supported dtypes.
fn tensor_to_pb(name: &str, tensor: &Tensor) -> pb::Tensor {
    pb::Tensor {
        name: name.to_string(),
        dtype: to_proto_dtype(tensor.dtype()) as i32,
        shape: tensor.shape().dims().iter().map(|d| *d as u64).collect(),
        data: tensor.data().clone(),
    }
}

fn tensor_from_pb(tensor: pb::Tensor) -> Result<(String, Tensor), PlinyError> {
    let dtype = parse_dtype(tensor.dtype)?;
    let shape = shape_from_pb(&tensor.shape)?;
    let decoded = Tensor::from_bytes(dtype, shape, tensor.data)
        .map_err(|e| PlinyError::malformed(format!("tensor `{}`: {e}", tensor.name)))?;
    Ok((tensor.name, decoded))
}

fn named_tensor_to_pb(name: &str, tensor: &Tensor) -> Result<pb::Tensor, PlinyError> {
    let data = encode_tensor(tensor)?;
    Ok(pb::Tensor {
        name: name.to_string(),
        dtype: to_proto_dtype(tensor.dtype()) as i32,
        shape: tensor.shape().dims().iter().map(|d| *d as u64).collect(),
        data,
    })
}

fn named_tensor_from_pb(tensor: pb::Tensor) -> Result<(String, Tensor), PlinyError> {
    let dtype = parse_dtype(tensor.dtype)?;
    let shape = shape_from_pb(&tensor.shape)?;
    let decoded = decode_tensor(tensor.data, dtype, &shape)?;
    Ok((tensor.name, decoded))
}

fn shape_from_pb(dims: &[u64]) -> Result<Shape, PlinyError> {
    let dims = dims
        .iter()
        .map(|d| usize::try_from(*d).map_err(|_| PlinyError::malformed(format!("dimension {d} overflows"))))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Shape::from(dims))
}

fn node_to_pb(node: &Node) -> pb::Node {
    pb::Node {
        name: node.name.clone(),
        op_type: node.op_type.clone(),
        inputs: node.inputs.clone(),
        outputs: node.outputs.clone(),
        attributes: node
            .attributes
            .iter()
            .map(|(name, value)| attribute_to_pb(name, value))
            .collect(),
    }
}

fn node_from_pb(node: pb::Node) -> Result<Node, PlinyError> {
    let mut decoded = Node::new(node.op_type, node.inputs, node.outputs).named(node.name);
    for attr in node.attributes {
        let (name, value) = attribute_from_pb(attr)?;
        decoded = decoded.with_attribute(name, value);
    }
    Ok(decoded)
}

fn attribute_to_pb(name: &str, value: &AttributeValue) -> pb::Attribute {
    let mut attr = pb::Attribute {
        name: name.to_string(),
        ..Default::default()
    };
    let kind = match value {
        AttributeValue::Float(f) => {
            attr.f = *f;
            pb::AttributeKind::Float
        }
        AttributeValue::Int(i) => {
            attr.i = *i;
            pb::AttributeKind::Int
        }
        AttributeValue::String(s) => {
            attr.s = s.clone();
            pb::AttributeKind::String
        }
        AttributeValue::Floats(v) => {
            attr.floats = v.clone();
            pb::AttributeKind::Floats
        }
        AttributeValue::Ints(v) => {
            attr.ints = v.clone();
            pb::AttributeKind::Ints
        }
        AttributeValue::Strings(v) => {
            attr.strings = v.clone();
            pb::AttributeKind::Strings
        }
        AttributeValue::Tensor(t) => {
            attr.t = Some(tensor_to_pb(name, t));
            pb::AttributeKind::Tensor
        }
    };
    attr.kind = kind as i32;
    attr
}

fn attribute_from_pb(attr: pb::Attribute) -> Result<(String, AttributeValue), PlinyError> {
    let kind = pb::AttributeKind::try_from(attr.kind)
        .map_err(|_| PlinyError::malformed(format!("unknown attribute kind {}", attr.kind)))?;
    let value = match kind {
        pb::AttributeKind::Float => AttributeValue::Float(attr.f),
        pb::AttributeKind::Int => AttributeValue::Int(attr.i),
        pb::AttributeKind::String => AttributeValue::String(attr.s),
        pb::AttributeKind::Floats => AttributeValue::Floats(attr.floats),
        pb::AttributeKind::Ints => AttributeValue::Ints(attr.ints),
        pb::AttributeKind::Strings => AttributeValue::Strings(attr.strings),
        pb::AttributeKind::Tensor => {
            let t = attr
                .t
                .ok_or_else(|| PlinyError::malformed(format!("attribute `{}` has no tensor", attr.name)))?;
            AttributeValue::Tensor(tensor_from_pb(t)?.1)
        }
        pb::AttributeKind::AttributeUnspecified => {
            return Err(PlinyError::malformed(format!(
                "attribute `{}` has no kind",
                attr.name
            )))
        }
    };
    Ok((attr.name, value))
}
