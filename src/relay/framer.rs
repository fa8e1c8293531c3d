//! Record framing
//!
//! Splits a drained region into broker-message-sized frames on record
//! boundaries. Framing is pure: each call walks one region from offset 0 and
//! returns sub-spans of it, so frames share the region's allocation.
//!
//! ## Record layout
//!
//! ```text
//! +-----------+---------------------------+
//! | clause id | payload (clause-specific) |
//! |  u32 (ne) |                           |
//! +-----------+---------------------------+
//! ```
//!
//! The record size (header included) comes from the clause descriptor table.
//! Clause id 0 marks filler that occupies the header bytes only.
//!
//! The text variant accumulates `{ ... }` delimited fragments into one frame
//! per message and never splits on MTU.

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use super::constants::{CLAUSE_ID_NONE, CLAUSE_ID_SIZE};

/// Maps a clause id to the size in bytes of its records
///
/// Returns 0 for clause ids it does not know.
pub trait RecordSizer {
    fn record_size(&self, clause: u32) -> usize;
}

impl<F> RecordSizer for F
where
    F: Fn(u32) -> usize,
{
    fn record_size(&self, clause: u32) -> usize {
        self(clause)
    }
}

/// Reasons framing of a region stops early
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    /// The clause id has no known record size
    UnknownRecordSize { clause: u32, offset: usize },
    /// The record (or its header) runs past the end of the region
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    /// A single record is larger than the MTU
    RecordExceedsMtu { clause: u32, size: usize, mtu: usize },
}

impl FramingError {
    /// Whether the error is a session configuration error rather than a
    /// per-region one
    pub fn is_fatal(&self) -> bool {
        matches!(self, FramingError::RecordExceedsMtu { .. })
    }
}

/// Output of framing one region
#[derive(Debug, Default)]
pub struct FramedRegion {
    /// Frames in record order
    pub frames: Vec<Bytes>,
    /// Bytes covered by `frames`
    pub consumed: usize,
    /// Why framing stopped before the end of the region, if it did
    pub error: Option<FramingError>,
}

impl FramedRegion {
    /// Bytes of the region dropped because framing stopped early
    pub fn dropped(&self, region_len: usize) -> usize {
        region_len - self.consumed
    }
}

/// Read the clause id at `offset`, if a whole header is present
fn clause_at(region: &[u8], offset: usize) -> Option<u32> {
    let header = region.get(offset..offset + CLAUSE_ID_SIZE)?;
    let mut id = [0u8; CLAUSE_ID_SIZE];
    id.copy_from_slice(header);
    Some(u32::from_ne_bytes(id))
}

/// Split `region` into frames no larger than `mtu`
///
/// Whole records are accumulated into the current frame; when the next record
/// would take the frame over the MTU the frame is closed and a new one starts
/// at that record. On an unknown clause, a truncated record or a record larger
/// than the MTU, the frames built so far are returned together with the error
/// and the remainder of the region is dropped.
pub fn frame_records(region: &Bytes, mtu: usize, sizer: &dyn RecordSizer) -> FramedRegion {
    let len = region.len();
    let mut out = FramedRegion::default();
    let mut frame_start = 0;
    let mut offset = 0;

    while offset < len {
        let clause = match clause_at(region, offset) {
            Some(clause) => clause,
            None => {
                out.error = Some(FramingError::Truncated {
                    offset,
                    needed: CLAUSE_ID_SIZE,
                    available: len - offset,
                });
                break;
            }
        };

        let size = if clause == CLAUSE_ID_NONE {
            CLAUSE_ID_SIZE
        } else {
            sizer.record_size(clause)
        };

        if size == 0 {
            out.error = Some(FramingError::UnknownRecordSize { clause, offset });
            break;
        }

        // Should have been rejected when the session was opened
        if size > mtu {
            out.error = Some(FramingError::RecordExceedsMtu { clause, size, mtu });
            break;
        }

        if size > len - offset {
            out.error = Some(FramingError::Truncated {
                offset,
                needed: size,
                available: len - offset,
            });
            break;
        }

        // size <= mtu, so an empty frame never overflows here
        if offset + size - frame_start > mtu {
            out.frames.push(region.slice(frame_start..offset));
            frame_start = offset;
        }

        offset += size;
    }

    if offset > frame_start {
        out.frames.push(region.slice(frame_start..offset));
    }
    out.consumed = offset;
    out
}

/// Accumulates text fragments into `{ ... }` delimited messages
///
/// A fragment beginning with `{` opens a message and a fragment beginning with
/// `}` closes it; the accumulated bytes, markers included, form one frame.
#[derive(Debug, Default)]
pub struct TextFramer {
    message: Option<BytesMut>,
    discarded: u64,
}

impl TextFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a message is currently being accumulated
    pub fn is_open(&self) -> bool {
        self.message.is_some()
    }

    /// Number of fragments and unterminated messages thrown away
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Feed one fragment; returns a frame when it closes a message
    pub fn push(&mut self, fragment: &str) -> Option<Bytes> {
        if fragment.starts_with('{') {
            debug!("Start of message");
            if self.message.is_some() {
                warn!("Message opened before the previous one closed; discarding it");
                self.discarded += 1;
            }
            self.message = Some(BytesMut::new());
        }

        let Some(message) = self.message.as_mut() else {
            debug!(len = fragment.len(), "Fragment outside a message ignored");
            self.discarded += 1;
            return None;
        };
        message.extend_from_slice(fragment.as_bytes());

        if fragment.starts_with('}') {
            debug!("End of message");
            return self.message.take().map(BytesMut::freeze);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::helpers::{record, region_of};

    fn sizes(clause: u32) -> usize {
        match clause {
            1 => 16,
            2 => 32,
            3 => 100,
            _ => 0,
        }
    }

    #[test]
    fn test_region_within_mtu_is_one_frame() {
        let region = region_of(&[record(1, 16), record(2, 32), record(1, 16)]);
        let framed = frame_records(&region, 1024, &sizes);

        assert!(framed.error.is_none());
        assert_eq!(framed.frames.len(), 1);
        assert_eq!(framed.frames[0], region);
        assert_eq!(framed.consumed, region.len());
    }

    #[test]
    fn test_mtu_sized_records_are_one_per_frame() {
        let region = region_of(&[record(3, 100), record(3, 100), record(3, 100)]);
        let framed = frame_records(&region, 100, &sizes);

        assert!(framed.error.is_none());
        assert_eq!(framed.frames.len(), 3);
        for frame in &framed.frames {
            assert_eq!(frame.len(), 100);
        }
    }

    #[test]
    fn test_frame_closes_before_overflowing_record() {
        // 16 + 32 = 48 fits in 50, the next 16 does not
        let region = region_of(&[record(1, 16), record(2, 32), record(1, 16)]);
        let framed = frame_records(&region, 50, &sizes);

        assert_eq!(framed.frames.len(), 2);
        assert_eq!(framed.frames[0].len(), 48);
        assert_eq!(framed.frames[1].len(), 16);
    }

    #[test]
    fn test_filler_is_skipped_by_header_size() {
        let mut parts = vec![record(1, 16)];
        parts.push(CLAUSE_ID_NONE.to_ne_bytes().to_vec());
        parts.push(record(1, 16));
        let region = region_of(&parts);

        let framed = frame_records(&region, 1024, &sizes);
        assert!(framed.error.is_none());
        assert_eq!(framed.consumed, 36);
    }

    #[test]
    fn test_unknown_clause_drops_remainder() {
        let region = region_of(&[record(1, 16), record(7, 16), record(1, 16)]);
        let framed = frame_records(&region, 1024, &sizes);

        assert_eq!(
            framed.error,
            Some(FramingError::UnknownRecordSize {
                clause: 7,
                offset: 16
            })
        );
        // Records before the unknown clause are still framed
        assert_eq!(framed.frames.len(), 1);
        assert_eq!(framed.frames[0].len(), 16);
        assert_eq!(framed.dropped(region.len()), 32);
    }

    #[test]
    fn test_record_larger_than_mtu_is_fatal() {
        let region = region_of(&[record(3, 100)]);
        let framed = frame_records(&region, 64, &sizes);

        let err = framed.error.expect("framing should fail");
        assert!(err.is_fatal());
        assert!(framed.frames.is_empty());
    }

    #[test]
    fn test_truncated_record() {
        let mut bytes = record(2, 32);
        bytes.truncate(20);
        let region = Bytes::from(bytes);

        let framed = frame_records(&region, 1024, &sizes);
        assert_eq!(
            framed.error,
            Some(FramingError::Truncated {
                offset: 0,
                needed: 32,
                available: 20
            })
        );
    }

    #[test]
    fn test_partial_header_is_truncated() {
        let region = region_of(&[record(1, 16), vec![1, 0]]);
        let framed = frame_records(&region, 1024, &sizes);

        assert!(matches!(
            framed.error,
            Some(FramingError::Truncated { offset: 16, .. })
        ));
        assert_eq!(framed.consumed, 16);
    }

    #[test]
    fn test_empty_region() {
        let framed = frame_records(&Bytes::new(), 1024, &sizes);
        assert!(framed.frames.is_empty());
        assert!(framed.error.is_none());
    }

    // ========== Text framing ==========

    #[test]
    fn test_text_message_between_markers() {
        let mut framer = TextFramer::new();
        assert!(framer.push("{").is_none());
        assert!(framer.is_open());
        assert!(framer.push("\"probe\": \"syscall\",").is_none());
        let frame = framer.push("}\n").expect("closing fragment emits a frame");

        assert_eq!(&frame[..], b"{\"probe\": \"syscall\",}\n");
        assert!(!framer.is_open());
    }

    #[test]
    fn test_text_fragment_outside_message_ignored() {
        let mut framer = TextFramer::new();
        assert!(framer.push("stray").is_none());
        assert!(framer.push("}").is_none());
        assert_eq!(framer.discarded(), 2);
    }

    #[test]
    fn test_text_reopen_discards_unterminated_message() {
        let mut framer = TextFramer::new();
        framer.push("{");
        framer.push("\"a\": 1");
        framer.push("{");
        let frame = framer.push("}").unwrap();

        assert_eq!(&frame[..], b"{}");
        assert_eq!(framer.discarded(), 1);
    }
}
