use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("Empty identifier")]
    Empty,

    #[error("Home id {0} has no server part")]
    MissingServer(String),

    #[error("Home id {0} does not start with a sigil")]
    MissingSigil(String),

    #[error("Unknown remote message type: {0}")]
    UnknownMessageType(String),
}
