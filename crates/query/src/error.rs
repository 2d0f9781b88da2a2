use thiserror::Error;

/// Failures a RAG request can end with.
///
/// Collaborators report plain `anyhow` errors; [`QueryError::classify`] turns
/// those into one of these variants so callers get a stable wire code.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("{service} is unavailable")]
    UpstreamUnavailable { service: &'static str },

    #[error("{service} timed out")]
    UpstreamTimeout { service: &'static str },

    #[error("{service} error: {message}")]
    Upstream { service: &'static str, message: String },

    #[error("Malformed stream fragment: {0}")]
    MalformedFragment(String),
}

impl QueryError {
    /// Stable code carried by stream `error` events and HTTP error bodies
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::Validation(_) => "bad_request",
            QueryError::UpstreamUnavailable { .. } => "upstream_unavailable",
            QueryError::UpstreamTimeout { .. } => "timeout",
            QueryError::Upstream { .. } => "upstream_error",
            QueryError::MalformedFragment(_) => "stream_error",
        }
    }

    /// Map a collaborator failure onto the taxonomy by looking for a transport
    /// error anywhere in its cause chain.
    pub fn classify(service: &'static str, err: anyhow::Error) -> Self {
        if let Some(err) = err.downcast_ref::<QueryError>() {
            return match err {
                QueryError::MalformedFragment(msg) => QueryError::MalformedFragment(msg.clone()),
                QueryError::Upstream { service, message } => QueryError::Upstream {
                    service: *service,
                    message: message.clone(),
                },
                _ => QueryError::Upstream {
                    service,
                    message: err.to_string(),
                },
            };
        }

        for cause in err.chain() {
            if let Some(http) = cause.downcast_ref::<reqwest::Error>() {
                if http.is_timeout() {
                    return QueryError::UpstreamTimeout { service };
                }
                if http.is_connect() {
                    return QueryError::UpstreamUnavailable { service };
                }
            }
        }

        QueryError::Upstream {
            service,
            message: format!("{:#}", err),
        }
    }
}
