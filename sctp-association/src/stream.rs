//! Per-stream bookkeeping, in particular the symmetric stream-reset
//! handshake: each direction of a reset is tracked independently so the core
//! can tell a locally initiated close apart from one the peer started, and
//! only notify upstream once both sides have completed.

/// State the association keeps per open `stream_id` between `send_data` and
/// the eventual removal once both halves of a reset complete.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct StreamState {
    /// We asked the engine to reset our outgoing side of this stream.
    pub(crate) closure_initiated: bool,
    /// The engine told us the peer reset its outgoing side (our incoming).
    pub(crate) incoming_reset_done: bool,
    /// The engine confirmed our outgoing reset completed.
    pub(crate) outgoing_reset_done: bool,
}

impl StreamState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// True once either side has started tearing the stream down; `send_data`
    /// rejects new sends against a stream in this state.
    pub(crate) fn is_closing(&self) -> bool {
        self.closure_initiated || self.incoming_reset_done || self.outgoing_reset_done
    }

    /// Both halves of the handshake are done: the stream can be forgotten and
    /// upstream notified.
    pub(crate) fn fully_reset(&self) -> bool {
        self.incoming_reset_done && self.outgoing_reset_done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_stream_is_not_closing() {
        let s = StreamState::new();
        assert!(!s.is_closing());
        assert!(!s.fully_reset());
    }

    #[test]
    fn fully_reset_requires_both_directions() {
        let mut s = StreamState::new();
        s.incoming_reset_done = true;
        assert!(s.is_closing());
        assert!(!s.fully_reset());
        s.outgoing_reset_done = true;
        assert!(s.fully_reset());
    }
}
