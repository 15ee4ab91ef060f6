use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("buffer too short")]
    TooShort,
    #[error("unknown control message type {0}")]
    UnknownType(u16),
    #[error("declared size {declared} smaller than fixed size {fixed} of message type {kind}")]
    UndersizedMessage {
        kind: u16,
        declared: usize,
        fixed: usize,
    },
    #[error("state data size {declared} exceeds packet payload of {available} bytes")]
    StateSizeMismatch { declared: usize, available: usize },
    #[error("state data size {0} exceeds limit")]
    StateTooLarge(usize),
    #[error("chat payload of {0} bytes exceeds limit")]
    ChatTooLong(usize),
    #[error("invalid enum value {value} for {field}")]
    InvalidValue { field: &'static str, value: u16 },
    #[error("postcard codec error: {0}")]
    Postcard(#[from] postcard::Error),
}
