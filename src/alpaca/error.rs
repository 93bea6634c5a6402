// =============================================================================
// Gateway error taxonomy
// =============================================================================
//
// Every broker failure is classified at this boundary. Callers dispatch on
// the class, never on raw HTTP details:
//   Transient    — network, 5xx, 429: retried (GETs) or reconciled (orders)
//   Adjustable   — insufficient funds / size violation: one adjusted retry
//   Fatal        — auth, invalid symbol: surfaced, never retried
//   WaitRequired — market closed or similar: the scheduler defers
// =============================================================================

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("transient broker error: {0}")]
    Transient(String),

    #[error("order needs adjustment: {0}")]
    Adjustable(String),

    #[error("fatal broker error: {0}")]
    Fatal(String),

    #[error("wait required: {0}")]
    WaitRequired(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classify an HTTP response status together with the broker's error body.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let msg = format!("{status}: {body}");
        if status.as_u16() == 429 {
            return Self::Transient(msg);
        }
        if status.is_server_error() {
            return Self::Transient(msg);
        }
        match status.as_u16() {
            401 => Self::Fatal(msg),
            403 => {
                // The broker reports insufficient buying power as 403; that
                // is adjustable, unlike an auth failure.
                let lower = body.to_ascii_lowercase();
                if lower.contains("insufficient") || lower.contains("buying power") {
                    Self::Adjustable(msg)
                } else {
                    Self::Fatal(msg)
                }
            }
            422 => Self::Adjustable(msg),
            _ => {
                let lower = body.to_ascii_lowercase();
                if lower.contains("market is closed") || lower.contains("market closed") {
                    Self::WaitRequired(msg)
                } else {
                    Self::Fatal(msg)
                }
            }
        }
    }

    /// Classify a reqwest transport error (connect, timeout, body decode).
    pub fn from_transport(err: reqwest::Error) -> Self {
        Self::Transient(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn server_errors_are_transient() {
        assert!(GatewayError::from_status(StatusCode::INTERNAL_SERVER_ERROR, "oops").is_transient());
        assert!(GatewayError::from_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(GatewayError::from_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
    }

    #[test]
    fn auth_failures_are_fatal() {
        assert!(matches!(
            GatewayError::from_status(StatusCode::UNAUTHORIZED, "unauthorized"),
            GatewayError::Fatal(_)
        ));
        assert!(matches!(
            GatewayError::from_status(StatusCode::FORBIDDEN, "forbidden"),
            GatewayError::Fatal(_)
        ));
    }

    #[test]
    fn insufficient_funds_is_adjustable() {
        assert!(matches!(
            GatewayError::from_status(StatusCode::FORBIDDEN, "insufficient buying power"),
            GatewayError::Adjustable(_)
        ));
        assert!(matches!(
            GatewayError::from_status(StatusCode::UNPROCESSABLE_ENTITY, "qty too small"),
            GatewayError::Adjustable(_)
        ));
    }

    #[test]
    fn market_closed_requires_waiting() {
        assert!(matches!(
            GatewayError::from_status(StatusCode::BAD_REQUEST, "market is closed"),
            GatewayError::WaitRequired(_)
        ));
    }
}
