mod cli;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command, Fill, GlobalArgs};
use plinyport_backend_pliny::{PlinyBackend, SessionConfig};
use plinyport_core::{DType, Endpoint, ExecutionTarget, Graph, Inputs, Outputs, Tensor};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();

    std::env::set_var("RUST_LOG", &cli.global.log);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let backend = PlinyBackend::with_config(session_config(&cli.global));
    match cli.command {
        Command::Ping { addr } => ping(&backend, &addr),
        Command::Run {
            graph,
            addr,
            target,
            batch,
            fill,
        } => {
            let raw = std::fs::read_to_string(&graph)
                .with_context(|| format!("read graph {}", graph.display()))?;
            let graph: Graph = serde_json::from_str(&raw)
                .with_context(|| format!("parse graph {}", graph.display()))?;
            run(&backend, &graph, &addr, target, batch, fill)
        }
    }
}

fn session_config(args: &GlobalArgs) -> SessionConfig {
    let millis = |ms: u64| (ms > 0).then(|| Duration::from_millis(ms));
    SessionConfig::default()
        .with_connect_timeout(millis(args.connect_timeout_ms))
        .with_request_timeout(millis(args.request_timeout_ms))
}

fn ping(backend: &PlinyBackend, addr: &Endpoint) -> Result<()> {
    let info = backend
        .probe(addr)
        .with_context(|| format!("probe {addr}"))?;
    let report = json!({
        "endpoint": addr.to_string(),
        "engine": info.name,
        "version": info.version,
        "workers": info.workers,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run(
    backend: &PlinyBackend,
    graph: &Graph,
    addr: &Endpoint,
    target: ExecutionTarget,
    batch: usize,
    fill: Fill,
) -> Result<()> {
    let inputs: Inputs = graph
        .inputs()
        .iter()
        .map(|spec| {
            let shape = spec.bind(batch);
            let tensor = match fill {
                Fill::Zeros => Tensor::zeros(spec.dtype, shape),
                Fill::Ones => Tensor::ones(spec.dtype, shape),
            };
            (spec.name.clone(), tensor)
        })
        .collect();

    tracing::info!(graph = graph.name(), inputs = inputs.len(), batch, "running graph");
    let outputs = backend
        .run_model(graph, addr, target, &inputs)
        .with_context(|| format!("run {} on {addr}", graph.name()))?;

    println!("{}", serde_json::to_string_pretty(&report(&outputs)?)?);
    Ok(())
}

fn report(outputs: &Outputs) -> Result<Value> {
    let mut entries = Vec::with_capacity(outputs.len());
    for (name, tensor) in outputs.iter() {
        entries.push(json!({
            "name": name,
            "dtype": tensor.dtype().name(),
            "shape": tensor.shape().dims(),
            "values": values(tensor)?,
        }));
    }
    Ok(Value::Array(entries))
}

fn values(tensor: &Tensor) -> Result<Value> {
    let values = match tensor.dtype() {
        DType::F32 => json!(tensor.to_vec::<f32>()?),
        DType::F64 => json!(tensor.to_vec::<f64>()?),
        DType::I32 => json!(tensor.to_vec::<i32>()?),
        DType::I64 => json!(tensor.to_vec::<i64>()?),
        DType::Bool => json!(tensor.to_vec::<bool>()?),
        DType::F16 | DType::U8 => Value::Null,
    };
    Ok(values)
}
