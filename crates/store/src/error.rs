use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display(
        "conversation '{conversation_id}' has no cached messages yet; fetch it before appending"
    ))]
    InvalidState {
        stage: &'static str,
        conversation_id: String,
    },
    #[snafu(display("message id '{raw}' is not a valid local placeholder id"))]
    InvalidMessageId {
        stage: &'static str,
        raw: String,
        source: uuid::Error,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;
