use std::io;

use http::StatusCode;
use n0_error::{stack_error, AnyError};

/// Errors constructing an agent-side [`Listener`](crate::Listener).
///
/// The URL and id variants are configuration mistakes the caller can
/// fix; `Connect`/`Tls`/`Dial` mean the broker could not be reached and
/// the listener instance is dead.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ListenerError {
    #[error("invalid broker url {url:?}, expected https://host<:port>/<path>")]
    InvalidUrl { url: String },

    #[error("agent id must not be empty")]
    EmptyId,

    #[error("failed to reach broker")]
    Connect {
        #[error(source, std_err)]
        source: io::Error,
    },

    #[error("tls handshake with broker failed")]
    Tls {
        #[error(source, std_err)]
        source: io::Error,
    },

    /// The control stream could not be established (transport error or
    /// a non-200 answer from the broker).
    #[error("failed to open control stream")]
    Dial {
        #[error(source)]
        source: AnyError,
    },
}

impl ListenerError {
    /// True for errors the caller can fix by changing configuration.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            ListenerError::InvalidUrl { .. } | ListenerError::EmptyId { .. }
        )
    }
}

/// `accept` on a [`Listener`](crate::Listener) failed.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum AcceptError {
    /// The listener was closed.
    #[error("listener closed")]
    Closed,

    /// The listener shut down after its control stream failed.
    #[error("listener closed")]
    ControlFailed {
        #[error(source)]
        source: AnyError,
    },
}

/// `dial` on a broker-side [`Dialer`](crate::Dialer) failed.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum DialError {
    #[error("reverse dialer closed")]
    Closed,

    /// No reverse stream was parked within the dial window.
    #[error("no reverse stream became available in time")]
    Timeout,
}

/// Failure while forwarding a request through a reverse stream.
#[stack_error(add_meta, derive)]
pub struct ProxyError {
    response_status: Option<StatusCode>,
    #[error(source)]
    source: AnyError,
}

impl ProxyError {
    /// The HTTP status to surface to the external client, if any.
    pub fn response_status(&self) -> Option<StatusCode> {
        self.response_status
    }

    pub(crate) fn bad_gateway(source: impl Into<AnyError>) -> Self {
        Self::new(Some(StatusCode::BAD_GATEWAY), source.into())
    }

    pub(crate) fn internal(source: impl Into<AnyError>) -> Self {
        Self::new(Some(StatusCode::INTERNAL_SERVER_ERROR), source.into())
    }
}

impl From<DialError> for ProxyError {
    #[track_caller]
    fn from(err: DialError) -> Self {
        let status = match &err {
            // No stream and no agent coming back for this dialer.
            DialError::Closed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            // The agent exists but did not replenish in time.
            DialError::Timeout { .. } => StatusCode::BAD_GATEWAY,
        };
        Self::new(Some(status), err.into())
    }
}
