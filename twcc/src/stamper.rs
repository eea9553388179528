//! Send-side stamping: assigns `TwccSeq`s to outbound RTP buffers and writes
//! them into the transport-wide-CC header extension.
//!
//! Generalizes the teacher's `TwccSenderInterceptor` (one fixed extension id,
//! implicit per-stream binding via `bind_local_stream`) into a plain
//! allocator plus an explicit per-payload-type extension-id table, since this
//! crate isn't wired into the teacher's `Interceptor`/`Registry` pipeline.

use crate::seq::{SeqAllocator, TwccSeq};
use rtc_shared::marshal::Marshal;
use rtp::extension::transport_cc_extension::TransportCcExtension;
use shared::error::{Error, Result};
use std::collections::HashMap;

/// Result of stamping a packet: the allocated sequence number and the
/// marshaled extension payload to install at `ext_id`.
pub struct StampedExtension {
    pub twcc_seq: TwccSeq,
    pub ext_id: u8,
    pub payload: bytes::Bytes,
}

#[derive(Debug, Default)]
pub struct Stamper {
    alloc: SeqAllocator,
    /// TWCC-enabled payload types and the header-extension id to stamp them
    /// with. Absence of an entry means "not TWCC-enabled" (spec 4.D:
    /// stamping only applies to TWCC-enabled payload types).
    ext_ids: HashMap<u8, u8>,
}

impl Stamper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or overwrites) the extension id used to stamp `payload_type`.
    /// An id of 0 is invalid per RFC 8285 and is rejected.
    pub fn bind_payload_type(&mut self, payload_type: u8, ext_id: u8) -> Result<()> {
        if ext_id == 0 {
            return Err(Error::MalformedFeedback("extension id 0 is reserved".into()));
        }
        self.ext_ids.insert(payload_type, ext_id);
        Ok(())
    }

    pub fn unbind_payload_type(&mut self, payload_type: u8) {
        self.ext_ids.remove(&payload_type);
    }

    pub fn is_enabled(&self, payload_type: u8) -> bool {
        self.ext_ids.contains_key(&payload_type)
    }

    /// Allocates the next `TwccSeq` and marshals the extension payload for
    /// `payload_type`. Returns `None` if the payload type isn't TWCC-enabled
    /// (silent, per spec 4.D: "absence of the extension ... is silent but
    /// prevents stamping").
    pub fn stamp(&mut self, payload_type: u8) -> Option<StampedExtension> {
        let ext_id = *self.ext_ids.get(&payload_type)?;
        let twcc_seq = self.alloc.next_seq();
        let ext = TransportCcExtension {
            transport_sequence: twcc_seq.0,
        };
        let payload = ext.marshal().ok()?.freeze();
        Some(StampedExtension {
            twcc_seq,
            ext_id,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_payload_type_is_not_stamped() {
        let mut s = Stamper::new();
        assert!(s.stamp(96).is_none());
    }

    #[test]
    fn bound_payload_type_gets_increasing_sequence_numbers() {
        let mut s = Stamper::new();
        s.bind_payload_type(96, 3).unwrap();
        let a = s.stamp(96).unwrap();
        let b = s.stamp(96).unwrap();
        assert_eq!(a.twcc_seq, TwccSeq(0));
        assert_eq!(b.twcc_seq, TwccSeq(1));
        assert_eq!(a.ext_id, 3);
    }

    #[test]
    fn rejects_reserved_extension_id() {
        let mut s = Stamper::new();
        assert!(s.bind_payload_type(96, 0).is_err());
    }

    #[test]
    fn shared_allocator_across_payload_types() {
        let mut s = Stamper::new();
        s.bind_payload_type(96, 3).unwrap();
        s.bind_payload_type(97, 4).unwrap();
        let a = s.stamp(96).unwrap();
        let b = s.stamp(97).unwrap();
        assert_eq!(a.twcc_seq, TwccSeq(0));
        assert_eq!(b.twcc_seq, TwccSeq(1));
    }
}
