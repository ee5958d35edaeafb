use std::time::Duration;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Timeouts and limits applied to one session.
///
/// `None` timeouts block until the engine answers or the connection drops.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub connect_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub shutdown_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            request_timeout: Some(Duration::from_secs(120)),
            shutdown_timeout: Duration::from_secs(2),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl SessionConfig {
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }
}
