use bytes::Bytes;
use plinyport_core::{Endpoint, Phase, PlinyError};
use plinyport_proto::v1::{Envelope, FrameKind};
use plinyport_proto::{decode_engine_info, decode_envelope, encode_envelope, EngineInfo};
use tracing::{debug, warn};

use crate::session::transport_error;
use crate::{Connector, SessionConfig, Transport};

/// Pings an engine on a short-lived connection and returns its self-description.
pub fn probe<C: Connector>(
    connector: &C,
    endpoint: &Endpoint,
    config: &SessionConfig,
) -> Result<EngineInfo, PlinyError> {
    let mut transport = connector
        .connect(endpoint, config.connect_timeout)
        .map_err(|e| transport_error(endpoint, Phase::Connect, e))?;

    let result = ping(&mut transport, endpoint, config);
    if let Err(err) = transport.close() {
        warn!(%endpoint, error = %err, "transport close failed after probe");
    }
    result
}

fn ping<T: Transport>(
    transport: &mut T,
    endpoint: &Endpoint,
    config: &SessionConfig,
) -> Result<EngineInfo, PlinyError> {
    let request = encode_envelope(&Envelope::new(FrameKind::Ping, 0, Bytes::new()));
    transport
        .send(&request, config.request_timeout)
        .map_err(|e| transport_error(endpoint, Phase::Probe, e))?;
    let frame = transport
        .receive(config.request_timeout)
        .map_err(|e| transport_error(endpoint, Phase::Probe, e))?;
    let reply = decode_envelope(&frame).map_err(|e| e.in_phase(endpoint, Phase::Probe))?;

    match reply.kind() {
        FrameKind::Pong => {
            let info = decode_engine_info(&reply.payload).map_err(|e| e.in_phase(endpoint, Phase::Probe))?;
            debug!(%endpoint, engine = %info.name, version = %info.version, "engine answered ping");
            Ok(info)
        }
        other => Err(PlinyError::malformed(format!("expected Pong, got {other:?}")).in_phase(endpoint, Phase::Probe)),
    }
}
