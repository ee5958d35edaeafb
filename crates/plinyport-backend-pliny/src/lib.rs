//! PlinyCompute backend: graphs are uploaded once and executed whole on a
//! remote engine.

use plinyport_core::{
    Backend, BackendCapabilities, Endpoint, ExecutionTarget, Graph, Inputs, Outputs, PlinyError,
};
use plinyport_runtime::{Connector, TcpConnector};
use tracing::{info, warn};

pub use plinyport_proto::EngineInfo;
pub use plinyport_runtime::{Session, SessionConfig, SessionState};

pub struct PlinyBackend<C: Connector = TcpConnector> {
    connector: C,
    config: SessionConfig,
}

impl PlinyBackend {
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        Self {
            connector: TcpConnector::new(config.max_frame_bytes),
            config,
        }
    }
}

impl Default for PlinyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connector> PlinyBackend<C> {
    /// Uses `connector` to reach engines instead of plain TCP.
    pub fn with_connector(connector: C, config: SessionConfig) -> Self {
        Self { connector, config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Prepares `graph`, runs it once and closes the session.
    pub fn run_model(
        &self,
        graph: &Graph,
        endpoint: &Endpoint,
        target: ExecutionTarget,
        inputs: &Inputs,
    ) -> Result<Outputs, PlinyError> {
        self.with_session(graph, endpoint, target, |session| session.run(inputs))
    }

    /// Runs `f` against a fresh session, which is closed however `f` returns.
    pub fn with_session<R, F>(
        &self,
        graph: &Graph,
        endpoint: &Endpoint,
        target: ExecutionTarget,
        f: F,
    ) -> Result<R, PlinyError>
    where
        F: FnOnce(&mut Session<C::Transport>) -> Result<R, PlinyError>,
    {
        let mut session = self.prepare(graph, endpoint, target)?;
        let result = f(&mut session);
        session.close();
        result
    }

    /// Asks the engine at `endpoint` to describe itself.
    pub fn probe(&self, endpoint: &Endpoint) -> Result<EngineInfo, PlinyError> {
        plinyport_runtime::probe(&self.connector, endpoint, &self.config)
    }
}

impl<C: Connector> Backend for PlinyBackend<C> {
    type Session = Session<C::Transport>;

    fn name(&self) -> &'static str {
        "pliny"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_dynamic_shapes: true,
            supports_single_node: false,
            enforces_execution_target: false,
        }
    }

    fn supports_target(&self, target: &ExecutionTarget) -> bool {
        matches!(target, ExecutionTarget::Cpu)
    }

    fn prepare(
        &self,
        graph: &Graph,
        endpoint: &Endpoint,
        target: ExecutionTarget,
    ) -> Result<Self::Session, PlinyError> {
        graph.validate()?;

        if !self.supports_target(&target) {
            warn!(%endpoint, %target, "execution target is advisory; the engine picks placement");
        }
        info!(
            %endpoint,
            graph = graph.name(),
            nodes = graph.nodes().len(),
            %target,
            "preparing graph"
        );

        Session::open(&self.connector, graph, endpoint.clone(), target, self.config.clone())
    }
}
