//! A loopback engine speaking the framed protocol, for integration tests.
//!
//! Runs return zero tensors shaped like the declared outputs, with dynamic
//! dimensions bound to the leading dimension of the first input.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use bytes::Bytes;
use plinyport_core::{
    DType, Endpoint, Graph, ModelSpec, Node, Outputs, PlinyError, Shape, Tensor, TensorSpec,
};
use plinyport_proto::v1::{Envelope, FrameKind};
use plinyport_proto::{
    decode_envelope, decode_graph, decode_named_tensors, encode_engine_info, encode_envelope,
    encode_outputs, EngineInfo,
};
use plinyport_runtime::{read_frame, write_frame, DEFAULT_MAX_FRAME_BYTES};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

#[derive(Clone, Debug, Default)]
pub struct Behavior {
    /// Reply to every upload with this error.
    pub reject_upload: Option<String>,
    /// Reply to every run with this error.
    pub fail_runs: Option<String>,
    /// Hang up as soon as a run request arrives.
    pub drop_on_run: bool,
    /// Read requests but never answer.
    pub silent: bool,
    /// Accept uploads but never answer a run.
    pub silent_on_run: bool,
}

#[derive(Debug, Default)]
pub struct Stats {
    connections: AtomicUsize,
    uploads: AtomicUsize,
    runs: AtomicUsize,
    shutdowns: AtomicUsize,
    pings: AtomicUsize,
}

impl Stats {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

pub struct FakeEngine {
    endpoint: Endpoint,
    stats: Arc<Stats>,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl FakeEngine {
    pub fn start() -> Result<Self> {
        Self::with_behavior(Behavior::default())
    }

    pub fn with_behavior(behavior: Behavior) -> Result<Self> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").context("bind fake engine")?;
        listener.set_nonblocking(true)?;
        let endpoint = Endpoint::new("127.0.0.1", listener.local_addr()?.port());

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("build fake engine runtime")?;
        let stats = Arc::new(Stats::default());
        let (stop, stopped) = oneshot::channel();

        let thread = {
            let stats = stats.clone();
            let behavior = Arc::new(behavior);
            std::thread::spawn(move || {
                runtime.block_on(accept_loop(listener, behavior, stats, stopped));
            })
        };

        Ok(Self {
            endpoint,
            stats,
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

pub fn engine_info() -> EngineInfo {
    EngineInfo {
        name: "fake-pliny".to_string(),
        version: "0.0.1".to_string(),
        workers: 2,
    }
}

/// `x[?,10] -> Gemm -> Relu -> Gemm -> Softmax -> y[?,2]`
pub fn dense_graph() -> Graph {
    Graph::builder("dense")
        .input(TensorSpec::new("x", DType::F32, vec![None, Some(10)]))
        .output(TensorSpec::new("y", DType::F32, vec![None, Some(2)]))
        .initializer("w1", Tensor::ones(DType::F32, Shape::from_slice(&[100, 10])))
        .initializer("b1", Tensor::zeros(DType::F32, Shape::from_slice(&[100])))
        .initializer("w2", Tensor::ones(DType::F32, Shape::from_slice(&[2, 100])))
        .node(Node::new("Gemm", ["x", "w1", "b1"], ["h"]).named("dense_1"))
        .node(Node::new("Relu", ["h"], ["r"]))
        .node(Node::new("Gemm", ["r", "w2"], ["z"]).named("dense_2"))
        .node(Node::new("Softmax", ["z"], ["y"]))
        .build()
}

/// Finds a local port with nothing listening on it.
pub fn dead_endpoint() -> Result<Endpoint> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(Endpoint::new("127.0.0.1", port))
}

async fn accept_loop(
    listener: std::net::TcpListener,
    behavior: Arc<Behavior>,
    stats: Arc<Stats>,
    mut stopped: oneshot::Receiver<()>,
) {
    let Ok(listener) = TcpListener::from_std(listener) else {
        return;
    };
    loop {
        tokio::select! {
            _ = &mut stopped => return,
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { return };
                stats.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, behavior.clone(), stats.clone()));
            }
        }
    }
}

async fn serve(mut stream: TcpStream, behavior: Arc<Behavior>, stats: Arc<Stats>) {
    let mut graphs: HashMap<u64, ModelSpec> = HashMap::new();
    let mut next_handle = 1u64;

    loop {
        let Ok(frame) = read_frame(&mut stream, DEFAULT_MAX_FRAME_BYTES).await else {
            return;
        };
        let Ok(request) = decode_envelope(&frame) else {
            return;
        };

        let reply = match request.kind() {
            FrameKind::Ping => {
                stats.pings.fetch_add(1, Ordering::SeqCst);
                Envelope::new(FrameKind::Pong, 0, encode_engine_info(&engine_info()))
            }
            FrameKind::UploadGraph => {
                stats.uploads.fetch_add(1, Ordering::SeqCst);
                match (&behavior.reject_upload, decode_graph(&request.payload)) {
                    (Some(reason), _) => Envelope::error(reason.clone()),
                    (None, Ok(graph)) => {
                        let handle = next_handle;
                        next_handle += 1;
                        graphs.insert(handle, graph.spec());
                        Envelope::new(FrameKind::GraphHandle, handle, Bytes::new())
                    }
                    (None, Err(err)) => Envelope::error(err.to_string()),
                }
            }
            FrameKind::RunGraph => {
                stats.runs.fetch_add(1, Ordering::SeqCst);
                if behavior.drop_on_run {
                    return;
                }
                if behavior.silent_on_run {
                    continue;
                }
                match (&behavior.fail_runs, graphs.get(&request.handle)) {
                    (Some(reason), _) => Envelope::error(reason.clone()),
                    (None, Some(spec)) => match run_zeros(spec, &request.payload) {
                        Ok(payload) => Envelope::new(FrameKind::RunResult, request.handle, payload),
                        Err(err) => Envelope::error(err.to_string()),
                    },
                    (None, None) => Envelope::error(format!("unknown graph handle {}", request.handle)),
                }
            }
            FrameKind::Shutdown => {
                stats.shutdowns.fetch_add(1, Ordering::SeqCst);
                graphs.remove(&request.handle);
                Envelope::new(FrameKind::Ack, request.handle, Bytes::new())
            }
            other => Envelope::error(format!("unexpected {other:?} request")),
        };

        if behavior.silent {
            continue;
        }
        if write_frame(&mut stream, &encode_envelope(&reply), DEFAULT_MAX_FRAME_BYTES)
            .await
            .is_err()
        {
            return;
        }
    }
}

fn run_zeros(spec: &ModelSpec, payload: &[u8]) -> Result<Bytes, PlinyError> {
    let inputs = decode_named_tensors(payload)?;
    let batch = inputs
        .first()
        .and_then(|(_, t)| t.shape().dims().first().copied())
        .unwrap_or(1);
    let outputs: Outputs = spec
        .outputs
        .iter()
        .map(|o| (o.name.clone(), Tensor::zeros(o.dtype, o.bind(batch))))
        .collect();
    encode_outputs(&outputs)
}
