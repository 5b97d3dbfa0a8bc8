use std::fmt::{Display, Formatter};

/// Status code reported to external callers, modelled after RPC status codes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorCode {
    Internal,
    DeadlineExceeded,
    Cancelled,
    FailedPrecondition,
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::FailedPrecondition => "FAILED_PRECONDITION",
        };
        f.write_str(s)
    }
}

/// Failure of a correlated request, i.e. a request that waits for one or more responses of a
///  given tag.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// `subscribe_unique` found another subscription for the response tag: some other request
    ///  of the same kind is still waiting for its response
    #[error("an operation of this kind is already in progress")]
    AlreadyInProgress,

    #[error("no response within {0:?}")]
    DeadlineExceeded(std::time::Duration),

    #[error("request was cancelled by the caller")]
    Cancelled,

    /// The response queue was closed before a response arrived. This happens at shutdown when
    ///  the registry goes away underneath a waiting request.
    #[error("response channel closed before a response arrived")]
    ChannelClosed,

    #[error("failed to send request: {0}")]
    Send(#[source] anyhow::Error),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl RequestError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RequestError::AlreadyInProgress => ErrorCode::FailedPrecondition,
            RequestError::DeadlineExceeded(_) => ErrorCode::DeadlineExceeded,
            RequestError::Cancelled => ErrorCode::Cancelled,
            RequestError::ChannelClosed => ErrorCode::Internal,
            RequestError::Send(_) => ErrorCode::Internal,
            RequestError::UnexpectedResponse(_) => ErrorCode::Internal,
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::in_progress(RequestError::AlreadyInProgress, ErrorCode::FailedPrecondition)]
    #[case::deadline(RequestError::DeadlineExceeded(Duration::from_millis(50)), ErrorCode::DeadlineExceeded)]
    #[case::cancelled(RequestError::Cancelled, ErrorCode::Cancelled)]
    #[case::closed(RequestError::ChannelClosed, ErrorCode::Internal)]
    #[case::send(RequestError::Send(anyhow::anyhow!("broken pipe")), ErrorCode::Internal)]
    #[case::unexpected(RequestError::UnexpectedResponse("EndOfListAnimations".to_string()), ErrorCode::Internal)]
    fn test_error_code(#[case] error: RequestError, #[case] expected: ErrorCode) {
        assert_eq!(error.code(), expected);
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::DeadlineExceeded.to_string(), "DEADLINE_EXCEEDED");
    }
}
