use http::StatusCode;

/// The canonical error kinds of the server core.
///
/// The router raises only the first five; the pipeline may raise
/// `Cancelled`/`Timeout`; pools raise `Overloaded`; transport framing
/// violations raise `Protocol`; anything else is `Internal`.
#[derive(Clone, Debug)]
pub enum ServerError {
    NotFound(String),
    NotAuthenticated(String),
    NotAuthorized(String),
    NotAvailable(String),
    Validation(String),
    Cancelled(String),
    Timeout(String),
    Protocol(String),
    Overloaded(String),
    Internal(String),
}

impl ServerError {
    /// Stable short code used in wire payloads (`{"error": <kind>}`).
    pub fn kind(&self) -> &'static str {
        match self {
            ServerError::NotFound(_) => "not_found",
            ServerError::NotAuthenticated(_) => "not_authenticated",
            ServerError::NotAuthorized(_) => "not_authorized",
            ServerError::NotAvailable(_) => "not_available",
            ServerError::Validation(_) => "validation_error",
            ServerError::Cancelled(_) => "cancelled",
            ServerError::Timeout(_) => "timeout",
            ServerError::Protocol(_) => "protocol_error",
            ServerError::Overloaded(_) => "overloaded",
            ServerError::Internal(_) => "internal_error",
        }
    }

    /// HTTP status for the error-translation middleware.
    ///
    /// 499 is the de-facto "client closed request" status; it never reaches
    /// a client but keeps logs unambiguous.
    pub fn http_status(&self) -> StatusCode {
        match self {
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::NotAuthenticated(_) => StatusCode::UNAUTHORIZED,
            ServerError::NotAuthorized(_) => StatusCode::FORBIDDEN,
            ServerError::NotAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Validation(_) => StatusCode::BAD_REQUEST,
            ServerError::Cancelled(_) => StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            ServerError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            ServerError::Protocol(_) => StatusCode::BAD_REQUEST,
            ServerError::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The detail message carried by every variant.
    pub fn message(&self) -> &str {
        match self {
            ServerError::NotFound(m)
            | ServerError::NotAuthenticated(m)
            | ServerError::NotAuthorized(m)
            | ServerError::NotAvailable(m)
            | ServerError::Validation(m)
            | ServerError::Cancelled(m)
            | ServerError::Timeout(m)
            | ServerError::Protocol(m)
            | ServerError::Overloaded(m)
            | ServerError::Internal(m) => m,
        }
    }

    /// Error body for HTTP clients.
    ///
    /// Debug mode carries the detail message; otherwise the body is the
    /// short stable `{"error": <kind>}` form.
    pub fn body(&self, debug: bool) -> serde_json::Value {
        if debug {
            serde_json::json!({ "error": self.kind(), "message": self.message() })
        } else {
            serde_json::json!({ "error": self.kind() })
        }
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind(), self.message())
    }
}

impl std::error::Error for ServerError {}

impl From<portico_codec::CodecError> for ServerError {
    fn from(err: portico_codec::CodecError) -> Self {
        ServerError::Validation(err.to_string())
    }
}

impl From<portico_executor::ExecutorError> for ServerError {
    fn from(err: portico_executor::ExecutorError) -> Self {
        use portico_executor::ExecutorError;
        match err {
            ExecutorError::NotStarted(m) => ServerError::NotAvailable(m),
            ExecutorError::Overloaded(m) => ServerError::Overloaded(m),
            ExecutorError::Cancelled(m) => ServerError::Cancelled(m),
            ExecutorError::Timeout(m) => ServerError::Timeout(m),
            ExecutorError::Panicked(m) | ExecutorError::ShuttingDown(m) => {
                ServerError::Internal(m)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_table() {
        assert_eq!(ServerError::NotFound("x".into()).http_status(), 404);
        assert_eq!(ServerError::NotAuthenticated("x".into()).http_status(), 401);
        assert_eq!(ServerError::NotAuthorized("x".into()).http_status(), 403);
        assert_eq!(ServerError::NotAvailable("x".into()).http_status(), 503);
        assert_eq!(ServerError::Validation("x".into()).http_status(), 400);
        assert_eq!(ServerError::Cancelled("x".into()).http_status().as_u16(), 499);
        assert_eq!(ServerError::Timeout("x".into()).http_status(), 408);
        assert_eq!(ServerError::Internal("x".into()).http_status(), 500);
    }

    #[test]
    fn body_shape_depends_on_debug() {
        let err = ServerError::NotFound("no such node".into());
        assert_eq!(err.body(false), serde_json::json!({ "error": "not_found" }));
        let debug = err.body(true);
        assert_eq!(debug["message"], "no such node");
    }
}
