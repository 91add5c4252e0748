use snafu::Snafu;

use parlor_gateway::GatewayError;
use parlor_store::StoreError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MessengerError {
    #[snafu(display("failed to fetch on `{stage}` ({operation}): {source}"))]
    Fetch {
        stage: &'static str,
        operation: &'static str,
        source: GatewayError,
    },
    #[snafu(display("`{operation}` did not answer within {timeout_ms}ms"))]
    FetchTimedOut {
        stage: &'static str,
        operation: &'static str,
        timeout_ms: u64,
    },
    #[snafu(display("failed to send message to conversation '{conversation_id}': {source}"))]
    Send {
        stage: &'static str,
        conversation_id: String,
        source: GatewayError,
    },
    #[snafu(display(
        "sending to conversation '{conversation_id}' did not complete within {timeout_ms}ms"
    ))]
    SendTimedOut {
        stage: &'static str,
        conversation_id: String,
        timeout_ms: u64,
    },
    #[snafu(display("message cache invariant violated on `{stage}`: {source}"))]
    InvalidState {
        stage: &'static str,
        source: StoreError,
    },
    #[snafu(display("conversation '{conversation_id}' is not part of this session"))]
    UnknownConversation {
        stage: &'static str,
        conversation_id: String,
    },
}

impl MessengerError {
    /// True for failures the user can recover from by retrying the same action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Fetch { .. }
                | Self::FetchTimedOut { .. }
                | Self::Send { .. }
                | Self::SendTimedOut { .. }
        )
    }
}

pub type MessengerResult<T> = Result<T, MessengerError>;
