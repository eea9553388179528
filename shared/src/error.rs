use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors shared by the TWCC and SCTP association cores.
///
/// Per the component boundary rule, these never propagate out of a public
/// entry point as a thrown failure: callers get a `Result`, and internal
/// silent-drop cases (malformed feedback, duplicates, out-of-window seqnums)
/// are represented by `Ok(())`/`None`, not by constructing one of these.
#[derive(Error, Debug, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error("operation is not valid in the current state")]
    IllegalStateForOperation,

    #[error("feedback control information is malformed: {0}")]
    MalformedFeedback(String),

    #[error("sequence number is outside the tracked window")]
    SeqnumOutOfWindow,

    #[error("stream {0} is closing or already closed")]
    StreamClosing(u16),

    #[error("association is not connected")]
    NotConnected,

    #[error("socket is not installed on this association")]
    NoSocket,

    #[error("send buffer exceeds the negotiated max message size ({0} > {1})")]
    MessageTooLarge(usize, usize),
}
