use std::fmt;

pub type GwResult<T> = Result<T, GatewayError>;

/// Gateway-side failures. Pre-pierce fetches swallow these (log and skip);
/// on-demand fragment routes surface them as 500s.
#[derive(Debug)]
pub enum GatewayError {
    /// The upstream fragment fetch failed.
    Upstream(String),
    /// The upstream answered with an empty body.
    EmptyBody(String),
    /// The shell provider or another internal hook failed.
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Upstream(msg) => write!(f, "upstream fragment error: {}", msg),
            GatewayError::EmptyBody(id) => write!(f, "empty fragment body from {}", id),
            GatewayError::Internal(msg) => write!(f, "gateway error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}
