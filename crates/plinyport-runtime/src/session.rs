//! A live binding between one uploaded graph and one engine connection.
//!
//! ```text
//! Created -> Connected -> GraphUploaded -> Ready <-> Running
//!    \___________\______________\___________\_________\____-> Closed
//! ```
//!
//! `Closed` is terminal. A failed connect leaves the session `Created` so the
//! caller may retry; every later failure that breaks the wire contract or the
//! connection closes it.

use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use plinyport_core::{
    Endpoint, ExecutionTarget, Graph, GraphSession, Inputs, ModelSpec, Outputs, Phase, PlinyError,
};
use plinyport_proto::v1::{Envelope, FrameKind};
use plinyport_proto::{decode_envelope, decode_outputs, encode_envelope, encode_graph, encode_inputs};
use tracing::{debug, info, warn};

use crate::{Connector, SessionConfig, Transport, TransportError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Connected,
    GraphUploaded,
    Ready,
    Running,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Connected => "connected",
            SessionState::GraphUploaded => "graph-uploaded",
            SessionState::Ready => "ready",
            SessionState::Running => "running",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Session<T: Transport> {
    endpoint: Endpoint,
    target: ExecutionTarget,
    config: SessionConfig,
    state: SessionState,
    transport: Option<T>,
    handle: Option<u64>,
    spec: ModelSpec,
}

impl<T: Transport> Session<T> {
    pub fn new(endpoint: Endpoint, target: ExecutionTarget, config: SessionConfig) -> Self {
        Self {
            endpoint,
            target,
            config,
            state: SessionState::Created,
            transport: None,
            handle: None,
            spec: ModelSpec::default(),
        }
    }

    /// Connects, uploads `graph` and marks the session ready.
    pub fn open<C>(
        connector: &C,
        graph: &Graph,
        endpoint: Endpoint,
        target: ExecutionTarget,
        config: SessionConfig,
    ) -> Result<Self, PlinyError>
    where
        C: Connector<Transport = T>,
    {
        let mut session = Self::new(endpoint, target, config);
        session.connect(connector)?;
        session.upload(graph)?;
        session.mark_ready()?;
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn execution_target(&self) -> ExecutionTarget {
        self.target
    }

    pub fn graph_handle(&self) -> Option<u64> {
        self.handle
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn connect<C>(&mut self, connector: &C) -> Result<(), PlinyError>
    where
        C: Connector<Transport = T>,
    {
        self.expect_state(SessionState::Created)?;

        info!(endpoint = %self.endpoint, "connecting to engine");
        let transport = connector
            .connect(&self.endpoint, self.config.connect_timeout)
            .map_err(|e| transport_error(&self.endpoint, Phase::Connect, e))?;

        self.transport = Some(transport);
        self.state = SessionState::Connected;
        Ok(())
    }

    /// Serializes `graph` once and sends it as a single upload frame.
    ///
    /// The graph is only borrowed here; the session keeps its declared I/O.
    pub fn upload(&mut self, graph: &Graph) -> Result<(), PlinyError> {
        self.expect_state(SessionState::Connected)?;

        let request = Envelope::new(FrameKind::UploadGraph, 0, encode_graph(graph));
        let reply = match self.round_trip(Phase::Upload, &request) {
            Ok(reply) => reply,
            Err(err) => {
                self.close();
                return Err(err);
            }
        };

        match reply.kind() {
            FrameKind::GraphHandle => {
                self.handle = Some(reply.handle);
                self.spec = graph.spec();
                self.state = SessionState::GraphUploaded;
                info!(
                    endpoint = %self.endpoint,
                    graph = graph.name(),
                    handle = reply.handle,
                    nodes = graph.nodes().len(),
                    "graph uploaded"
                );
                Ok(())
            }
            FrameKind::Error => {
                self.close();
                Err(PlinyError::GraphUpload {
                    endpoint: self.endpoint.clone(),
                    message: reply.error_message(),
                })
            }
            other => {
                self.close();
                Err(unexpected_reply(&self.endpoint, Phase::Upload, other))
            }
        }
    }

    pub fn mark_ready(&mut self) -> Result<(), PlinyError> {
        self.expect_state(SessionState::GraphUploaded)?;
        self.state = SessionState::Ready;
        Ok(())
    }

    /// Runs the whole graph once.
    ///
    /// Inputs are checked against the declared graph inputs before anything
    /// is sent; a mismatch never reaches the engine.
    pub fn run(&mut self, inputs: &Inputs) -> Result<Outputs, PlinyError> {
        self.expect_state(SessionState::Ready)?;
        let Some(handle) = self.handle else {
            return Err(PlinyError::NotReady {
                state: self.state.as_str(),
            });
        };

        self.check_inputs(inputs)?;
        let payload = encode_inputs(&self.spec, inputs)?;

        self.state = SessionState::Running;
        let started = Instant::now();
        let result = self.execute(handle, payload);

        match &result {
            Ok(outputs) => {
                self.state = SessionState::Ready;
                debug!(
                    endpoint = %self.endpoint,
                    handle,
                    outputs = outputs.len(),
                    elapsed_us = started.elapsed().as_micros() as u64,
                    "graph run complete"
                );
            }
            // the engine answered, or never saw the request
            Err(PlinyError::RunFailed { .. } | PlinyError::RequestTooLarge { .. }) => {
                self.state = SessionState::Ready
            }
            Err(err) => {
                warn!(endpoint = %self.endpoint, error = %err, "run failed; closing session");
                self.close();
            }
        }
        result
    }

    /// Closes the session: best-effort shutdown notice, then the transport.
    ///
    /// Idempotent. Notice and transport failures are logged, never returned.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }

        if let (Some(handle), Some(transport)) = (self.handle.take(), self.transport.as_mut()) {
            let notice = encode_envelope(&Envelope::new(FrameKind::Shutdown, handle, Bytes::new()));
            match send_shutdown(transport, &notice, self.config.shutdown_timeout) {
                Ok(()) => debug!(endpoint = %self.endpoint, handle, "engine acknowledged shutdown"),
                Err(reason) => warn!(
                    endpoint = %self.endpoint,
                    handle,
                    %reason,
                    "shutdown notice failed; closing anyway"
                ),
            }
        }

        if let Some(mut transport) = self.transport.take() {
            if let Err(err) = transport.close() {
                warn!(endpoint = %self.endpoint, error = %err, "transport close failed");
            }
        }

        self.state = SessionState::Closed;
        info!(endpoint = %self.endpoint, "session closed");
    }

    fn execute(&mut self, handle: u64, payload: Bytes) -> Result<Outputs, PlinyError> {
        let request = Envelope::new(FrameKind::RunGraph, handle, payload);
        let reply = self.round_trip(Phase::Run, &request)?;

        match reply.kind() {
            FrameKind::RunResult => decode_outputs(&reply.payload, &self.spec.output_names())
                .map_err(|e| e.in_phase(&self.endpoint, Phase::Run)),
            FrameKind::Error => Err(PlinyError::RunFailed {
                endpoint: self.endpoint.clone(),
                message: reply.error_message(),
            }),
            other => Err(unexpected_reply(&self.endpoint, Phase::Run, other)),
        }
    }

    fn round_trip(&mut self, phase: Phase, request: &Envelope) -> Result<Envelope, PlinyError> {
        let transport = self.transport.as_mut().ok_or(PlinyError::SessionClosed)?;
        let timeout = self.config.request_timeout;

        transport
            .send(&encode_envelope(request), timeout)
            .map_err(|e| match e {
                // refused before any byte was written
                TransportError::FrameTooLarge { len, max } => PlinyError::RequestTooLarge { len, max },
                e => transport_error(&self.endpoint, phase, e),
            })?;
        let frame = transport
            .receive(timeout)
            .map_err(|e| transport_error(&self.endpoint, phase, e))?;

        decode_envelope(&frame).map_err(|e| e.in_phase(&self.endpoint, phase))
    }

    fn check_inputs(&self, inputs: &Inputs) -> Result<(), PlinyError> {
        if let Some(unknown) = inputs.keys().find(|name| self.spec.input(name).is_none()) {
            return Err(PlinyError::InputShape {
                input: unknown.clone(),
                detail: "not a declared graph input".to_string(),
            });
        }

        for declared in &self.spec.inputs {
            let tensor = inputs.get(&declared.name).ok_or_else(|| PlinyError::InputShape {
                input: declared.name.clone(),
                detail: "input not supplied".to_string(),
            })?;
            declared.check(tensor)?;
        }
        Ok(())
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), PlinyError> {
        match self.state {
            s if s == expected => Ok(()),
            SessionState::Closed => Err(PlinyError::SessionClosed),
            s => Err(PlinyError::NotReady { state: s.as_str() }),
        }
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: Transport> GraphSession for Session<T> {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn run(&mut self, inputs: &Inputs) -> Result<Outputs, PlinyError> {
        Session::run(self, inputs)
    }

    fn close(&mut self) {
        Session::close(self)
    }

    fn target_honored(&self) -> bool {
        // the engine protocol has no placement field yet
        false
    }
}

fn send_shutdown<T: Transport>(transport: &mut T, notice: &[u8], timeout: Duration) -> Result<(), String> {
    transport
        .send(notice, Some(timeout))
        .map_err(|e| e.to_string())?;
    let frame = transport.receive(Some(timeout)).map_err(|e| e.to_string())?;
    let reply = decode_envelope(&frame).map_err(|e| e.to_string())?;
    match reply.kind() {
        FrameKind::Ack => Ok(()),
        FrameKind::Error => Err(reply.error_message()),
        other => Err(format!("expected ack, got {other:?}")),
    }
}

fn unexpected_reply(endpoint: &Endpoint, phase: Phase, kind: FrameKind) -> PlinyError {
    PlinyError::malformed(format!("unexpected {kind:?} frame")).in_phase(endpoint, phase)
}

pub(crate) fn transport_error(endpoint: &Endpoint, phase: Phase, err: TransportError) -> PlinyError {
    match err {
        TransportError::Refused(e) | TransportError::Runtime(e) => PlinyError::Connection {
            endpoint: endpoint.clone(),
            message: e.to_string(),
        },
        TransportError::Timeout(elapsed) => PlinyError::Timeout {
            endpoint: endpoint.clone(),
            phase,
            elapsed,
        },
        TransportError::ConnectionLost(e) => PlinyError::ConnectionLost {
            endpoint: endpoint.clone(),
            phase,
            message: e.to_string(),
        },
        err @ TransportError::FrameTooLarge { .. } => {
            PlinyError::malformed(err.to_string()).in_phase(endpoint, phase)
        }
        TransportError::Closed => PlinyError::SessionClosed,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use plinyport_core::{DType, Node, Shape, Tensor, TensorSpec};
    use plinyport_proto::encode_outputs;

    use super::*;

    #[derive(Default)]
    struct Calls {
        connects: AtomicUsize,
        sends: AtomicUsize,
        receives: AtomicUsize,
        closes: AtomicUsize,
        sent: Mutex<Vec<FrameKind>>,
    }

    impl Calls {
        fn wire_calls(&self) -> usize {
            self.sends.load(Ordering::SeqCst) + self.receives.load(Ordering::SeqCst)
        }
    }

    type Reply = Result<Envelope, TransportError>;

    struct FakeConnector {
        calls: Arc<Calls>,
        refuse: Option<fn() -> TransportError>,
        replies: Mutex<VecDeque<Reply>>,
    }

    impl FakeConnector {
        fn replying(replies: Vec<Reply>) -> Self {
            Self {
                calls: Arc::default(),
                refuse: None,
                replies: Mutex::new(replies.into()),
            }
        }

        fn refusing(err: fn() -> TransportError) -> Self {
            Self {
                refuse: Some(err),
                ..Self::replying(vec![])
            }
        }
    }

    struct FakeTransport {
        calls: Arc<Calls>,
        replies: VecDeque<Reply>,
    }

    impl Connector for FakeConnector {
        type Transport = FakeTransport;

        fn connect(
            &self,
            _endpoint: &Endpoint,
            _timeout: Option<Duration>,
        ) -> Result<FakeTransport, TransportError> {
            self.calls.connects.fetch_add(1, Ordering::SeqCst);
            if let Some(refuse) = self.refuse {
                return Err(refuse());
            }
            Ok(FakeTransport {
                calls: Arc::clone(&self.calls),
                replies: std::mem::take(&mut *self.replies.lock().unwrap()),
            })
        }
    }

    impl Transport for FakeTransport {
        fn send(&mut self, frame: &[u8], _timeout: Option<Duration>) -> Result<(), TransportError> {
            self.calls.sends.fetch_add(1, Ordering::SeqCst);
            let env = decode_envelope(frame).unwrap();
            self.calls.sent.lock().unwrap().push(env.kind());
            Ok(())
        }

        fn receive(&mut self, _timeout: Option<Duration>) -> Result<Bytes, TransportError> {
            self.calls.receives.fetch_add(1, Ordering::SeqCst);
            match self.replies.pop_front() {
                Some(Ok(env)) => Ok(encode_envelope(&env)),
                Some(Err(e)) => Err(e),
                None => Err(TransportError::ConnectionLost(std::io::ErrorKind::UnexpectedEof.into())),
            }
        }

        fn close(&mut self) -> Result<(), TransportError> {
            self.calls.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn dense() -> Graph {
        Graph::builder("dense")
            .input(TensorSpec::new("x", DType::F32, vec![None, Some(10)]))
            .output(TensorSpec::new("y", DType::F32, vec![None, Some(2)]))
            .initializer("w", Tensor::zeros(DType::F32, Shape::from_slice(&[10, 2])))
            .node(Node::new("MatMul", ["x", "w"], ["y"]))
            .build()
    }

    fn endpoint() -> Endpoint {
        Endpoint::new("localhost", 8108)
    }

    fn handle_reply(handle: u64) -> Reply {
        Ok(Envelope::new(FrameKind::GraphHandle, handle, Bytes::new()))
    }

    fn zeros_reply(batch: usize) -> Reply {
        let mut outputs = Outputs::new();
        outputs.push("y", Tensor::zeros(DType::F32, Shape::from_slice(&[batch, 2])));
        Ok(Envelope::new(
            FrameKind::RunResult,
            0,
            encode_outputs(&outputs).unwrap(),
        ))
    }

    fn ack() -> Reply {
        Ok(Envelope::new(FrameKind::Ack, 0, Bytes::new()))
    }

    fn x(batch: usize) -> Inputs {
        let mut inputs = Inputs::new();
        inputs.insert("x".to_string(), Tensor::ones(DType::F32, Shape::from_slice(&[batch, 10])));
        inputs
    }

    fn open(connector: &FakeConnector) -> Session<FakeTransport> {
        Session::open(
            connector,
            &dense(),
            endpoint(),
            ExecutionTarget::Cpu,
            SessionConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn open_walks_to_ready() {
        let connector = FakeConnector::replying(vec![handle_reply(41)]);
        let session = open(&connector);
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.graph_handle(), Some(41));
        assert_eq!(session.spec().output_names(), vec!["y".to_string()]);
        assert!(!session.target_honored());
        assert_eq!(connector.calls.sent.lock().unwrap()[0], FrameKind::UploadGraph);
    }

    #[test]
    fn run_returns_named_outputs_and_stays_ready() {
        let connector = FakeConnector::replying(vec![handle_reply(1), zeros_reply(3), zeros_reply(1)]);
        let mut session = open(&connector);

        let out = session.run(&x(3)).unwrap();
        assert_eq!(out.get("y").unwrap().shape(), &Shape::from_slice(&[3, 2]));
        assert_eq!(session.state(), SessionState::Ready);

        session.run(&x(1)).unwrap();
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn connect_timeout_leaves_session_created_and_retryable() {
        let slow = FakeConnector::refusing(|| TransportError::Timeout(Duration::from_secs(2)));
        let mut session: Session<FakeTransport> =
            Session::new(endpoint(), ExecutionTarget::Cpu, SessionConfig::default());

        let err = session.connect(&slow).unwrap_err();
        assert!(matches!(
            err,
            PlinyError::Timeout {
                phase: Phase::Connect,
                elapsed,
                ..
            } if elapsed == Duration::from_secs(2)
        ));
        assert!(err.is_retryable());
        assert_eq!(session.state(), SessionState::Created);

        let healthy = FakeConnector::replying(vec![]);
        session.connect(&healthy).unwrap();
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn refused_connect_is_a_connection_error() {
        let refusing = FakeConnector::refusing(|| {
            TransportError::Refused(std::io::ErrorKind::ConnectionRefused.into())
        });
        let mut session: Session<FakeTransport> =
            Session::new(endpoint(), ExecutionTarget::Cpu, SessionConfig::default());
        assert!(matches!(
            session.connect(&refusing),
            Err(PlinyError::Connection { .. })
        ));
        assert_eq!(session.state(), SessionState::Created);
    }

    #[test]
    fn rejected_upload_is_terminal() {
        let connector = FakeConnector::replying(vec![Ok(Envelope::error("unsupported operator MatMul"))]);
        let mut session = Session::new(endpoint(), ExecutionTarget::Cpu, SessionConfig::default());
        session.connect(&connector).unwrap();

        let err = session.upload(&dense()).unwrap_err();
        assert!(matches!(err, PlinyError::GraphUpload { ref message, .. } if message.contains("MatMul")));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!err.is_retryable());

        assert!(matches!(session.run(&x(1)), Err(PlinyError::SessionClosed)));
        // no handle was issued, so no shutdown notice goes out
        assert_eq!(*connector.calls.sent.lock().unwrap(), vec![FrameKind::UploadGraph]);
        assert_eq!(connector.calls.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn run_before_ready_is_guarded() {
        let mut session: Session<FakeTransport> =
            Session::new(endpoint(), ExecutionTarget::Cpu, SessionConfig::default());
        assert!(matches!(
            session.run(&x(1)),
            Err(PlinyError::NotReady { state: "created" })
        ));
    }

    #[test]
    fn invalid_inputs_never_touch_the_wire() {
        let connector = FakeConnector::replying(vec![handle_reply(1)]);
        let mut session = open(&connector);
        let before = connector.calls.wire_calls();

        let missing = session.run(&Inputs::new()).unwrap_err();
        assert!(matches!(missing, PlinyError::InputShape { ref input, .. } if input == "x"));

        let mut wrong_type = Inputs::new();
        wrong_type.insert("x".into(), Tensor::zeros(DType::F64, Shape::from_slice(&[1, 10])));
        assert!(matches!(session.run(&wrong_type), Err(PlinyError::InputType { .. })));

        let mut wrong_shape = Inputs::new();
        wrong_shape.insert("x".into(), Tensor::zeros(DType::F32, Shape::from_slice(&[1, 11])));
        assert!(matches!(session.run(&wrong_shape), Err(PlinyError::InputShape { .. })));

        let mut extra = x(1);
        extra.insert("bogus".into(), Tensor::scalar(1.0f32));
        assert!(matches!(
            session.run(&extra),
            Err(PlinyError::InputShape { ref input, .. }) if input == "bogus"
        ));

        assert_eq!(connector.calls.wire_calls(), before);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn engine_run_error_keeps_session_ready() {
        let connector = FakeConnector::replying(vec![
            handle_reply(1),
            Ok(Envelope::error("worker 3 out of memory")),
            zeros_reply(1),
        ]);
        let mut session = open(&connector);

        assert!(matches!(session.run(&x(1)), Err(PlinyError::RunFailed { .. })));
        assert_eq!(session.state(), SessionState::Ready);
        session.run(&x(1)).unwrap();
    }

    #[test]
    fn lost_connection_closes_the_session() {
        let connector = FakeConnector::replying(vec![handle_reply(1)]);
        let mut session = open(&connector);

        let err = session.run(&x(1)).unwrap_err();
        assert!(matches!(err, PlinyError::ConnectionLost { phase: Phase::Run, .. }));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(session.run(&x(1)), Err(PlinyError::SessionClosed)));
    }

    #[test]
    fn wrong_output_names_are_malformed_and_fatal() {
        let mut outputs = Outputs::new();
        outputs.push("logits", Tensor::zeros(DType::F32, Shape::from_slice(&[1, 2])));
        let reply = Envelope::new(FrameKind::RunResult, 0, encode_outputs(&outputs).unwrap());
        let connector = FakeConnector::replying(vec![handle_reply(1), Ok(reply), ack()]);
        let mut session = open(&connector);

        let err = session.run(&x(1)).unwrap_err();
        assert!(matches!(err, PlinyError::MalformedResponse { ref message } if message.contains("localhost:8108")));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn close_is_idempotent_and_notifies_once() {
        let connector = FakeConnector::replying(vec![handle_reply(9), ack()]);
        let mut session = open(&connector);

        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(
            *connector.calls.sent.lock().unwrap(),
            vec![FrameKind::UploadGraph, FrameKind::Shutdown]
        );
        assert_eq!(connector.calls.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_shutdown_notice_is_swallowed() {
        // no ack scripted: the notice fails with a lost connection
        let connector = FakeConnector::replying(vec![handle_reply(9)]);
        let mut session = open(&connector);
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(connector.calls.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_releases_the_transport() {
        let connector = FakeConnector::replying(vec![handle_reply(2), ack()]);
        drop(open(&connector));
        assert_eq!(connector.calls.closes.load(Ordering::SeqCst), 1);
        assert!(connector.calls.sent.lock().unwrap().contains(&FrameKind::Shutdown));
    }
}
