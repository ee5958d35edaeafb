//! Wire messages exchanged with the PlinyCompute engine, protocol version 1.
//!
//! Declared by hand with `prost` derives; field tags are part of the contract
//! and must never be reused.

use prost::bytes::Bytes;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum DType {
    DtypeUnspecified = 0,
    F32 = 1,
    F64 = 2,
    I32 = 3,
    I64 = 4,
    Bool = 5,
    F16 = 6,
    U8 = 7,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AttributeKind {
    AttributeUnspecified = 0,
    Float = 1,
    Int = 2,
    String = 3,
    Floats = 4,
    Ints = 5,
    Strings = 6,
    Tensor = 7,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum FrameKind {
    FrameUnspecified = 0,
    UploadGraph = 1,
    GraphHandle = 2,
    RunGraph = 3,
    RunResult = 4,
    Shutdown = 5,
    Ack = 6,
    Error = 7,
    Ping = 8,
    Pong = 9,
}

/// Declared graph input or output; a dim of -1 is dynamic.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TensorSpec {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(enumeration = "DType", tag = "2")]
    pub dtype: i32,
    #[prost(int64, repeated, tag = "3")]
    pub dims: Vec<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Tensor {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(enumeration = "DType", tag = "2")]
    pub dtype: i32,
    #[prost(uint64, repeated, tag = "3")]
    pub shape: Vec<u64>,
    /// Little-endian element bytes.
    #[prost(bytes = "bytes", tag = "4")]
    pub data: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Attribute {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(enumeration = "AttributeKind", tag = "2")]
    pub kind: i32,
    #[prost(float, tag = "3")]
    pub f: f32,
    #[prost(int64, tag = "4")]
    pub i: i64,
    #[prost(string, tag = "5")]
    pub s: String,
    #[prost(float, repeated, tag = "6")]
    pub floats: Vec<f32>,
    #[prost(int64, repeated, tag = "7")]
    pub ints: Vec<i64>,
    #[prost(string, repeated, tag = "8")]
    pub strings: Vec<String>,
    #[prost(message, optional, tag = "9")]
    pub t: Option<Tensor>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Node {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub op_type: String,
    #[prost(string, repeated, tag = "3")]
    pub inputs: Vec<String>,
    #[prost(string, repeated, tag = "4")]
    pub outputs: Vec<String>,
    #[prost(message, repeated, tag = "5")]
    pub attributes: Vec<Attribute>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Graph {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub nodes: Vec<Node>,
    #[prost(message, repeated, tag = "3")]
    pub inputs: Vec<TensorSpec>,
    #[prost(message, repeated, tag = "4")]
    pub outputs: Vec<TensorSpec>,
    #[prost(message, repeated, tag = "5")]
    pub initializers: Vec<Tensor>,
}

/// Payload of `RunGraph` (inputs) and `RunResult` (outputs).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TensorBundle {
    #[prost(message, repeated, tag = "1")]
    pub tensors: Vec<Tensor>,
}

/// Payload of `Pong`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EngineInfo {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub version: String,
    #[prost(uint32, tag = "3")]
    pub workers: u32,
}

/// The unit carried by one length-prefixed frame.
///
/// `handle` names the uploaded graph for `RunGraph`/`Shutdown` and is the
/// engine's answer in `GraphHandle`. `Error` carries a UTF-8 message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(enumeration = "FrameKind", tag = "2")]
    pub kind: i32,
    #[prost(uint64, tag = "3")]
    pub handle: u64,
    #[prost(bytes = "bytes", tag = "4")]
    pub payload: Bytes,
}
