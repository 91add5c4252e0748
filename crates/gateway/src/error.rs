use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum GatewayError {
    #[snafu(display("gateway unavailable during `{operation}`: {details}"))]
    Unavailable {
        stage: &'static str,
        operation: &'static str,
        details: String,
    },
    #[snafu(display("conversation '{conversation_id}' was not found"))]
    ConversationNotFound {
        stage: &'static str,
        conversation_id: String,
    },
    #[snafu(display("gateway rejected `{operation}`: {reason}"))]
    Rejected {
        stage: &'static str,
        operation: &'static str,
        reason: String,
    },
    #[snafu(display("failed to parse gateway fixture on `{stage}`: {source}"))]
    FixtureParse {
        stage: &'static str,
        source: serde_json::Error,
    },
}

pub type GatewayResult<T> = Result<T, GatewayError>;
