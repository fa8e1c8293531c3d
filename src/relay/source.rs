//! Frame sources
//!
//! Both faces of the relay feed the same publisher through [`FrameSource`]:
//! the [`Harvester`] swaps and frames binary regions itself, while
//! [`FragmentSource`] receives already-serialized text fragments from an
//! interpreter and frames them on `{`/`}` markers. Nothing downstream of
//! framing distinguishes the two.

use std::collections::VecDeque;

use bytes::Bytes;

use super::constants::TRACE_KEY;
use super::framer::TextFramer;
use super::harvester::Harvester;

/// A keyed payload ready for the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub key: &'static str,
    pub payload: Bytes,
}

impl Frame {
    /// A trace frame
    pub fn trace(payload: Bytes) -> Self {
        Frame {
            key: TRACE_KEY,
            payload,
        }
    }
}

/// Anything that yields frames in publish order
pub trait FrameSource {
    /// Take every frame available now
    fn drain_frames(&mut self) -> Vec<Frame>;
}

impl FrameSource for Harvester {
    fn drain_frames(&mut self) -> Vec<Frame> {
        self.harvest()
    }
}

/// Text-fragment source for the user-space face
#[derive(Debug, Default)]
pub struct FragmentSource {
    framer: TextFramer,
    ready: VecDeque<Frame>,
    fragments: u64,
}

impl FragmentSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment as delivered by the interpreter
    pub fn on_fragment(&mut self, fragment: &str) {
        self.fragments += 1;
        if let Some(payload) = self.framer.push(fragment) {
            self.ready.push_back(Frame::trace(payload));
        }
    }

    /// Frames completed but not yet drained
    pub fn pending(&self) -> usize {
        self.ready.len()
    }

    /// Fragments received so far
    pub fn fragments(&self) -> u64 {
        self.fragments
    }

    /// Fragments and unterminated messages thrown away
    pub fn discarded(&self) -> u64 {
        self.framer.discarded()
    }

    /// Whether a message is open and awaiting its closing fragment
    pub fn in_message(&self) -> bool {
        self.framer.is_open()
    }
}

impl FrameSource for FragmentSource {
    fn drain_frames(&mut self) -> Vec<Frame> {
        self.ready.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::relay::buffer::{BufferUnit, MemoryBufferPair};
    use crate::relay::liveness::Liveness;
    use crate::testing::helpers::{record, sample_catalog};

    #[test]
    fn test_fragment_source_emits_on_close() {
        let mut source = FragmentSource::new();
        source.on_fragment("{");
        source.on_fragment("\"cpu\": 0,");
        assert_eq!(source.pending(), 0);
        assert!(source.in_message());

        source.on_fragment("}");
        assert_eq!(source.pending(), 1);

        let frames = source.drain_frames();
        assert_eq!(frames, vec![Frame::trace(Bytes::from_static(b"{\"cpu\": 0,}"))]);
        assert!(source.drain_frames().is_empty());
        assert_eq!(source.fragments(), 3);
    }

    #[test]
    fn test_fragment_source_keeps_message_order() {
        let mut source = FragmentSource::new();
        for fragment in ["{", "1", "}", "{", "2", "}"] {
            source.on_fragment(fragment);
        }
        let frames = source.drain_frames();
        assert_eq!(&frames[0].payload[..], b"{1}");
        assert_eq!(&frames[1].payload[..], b"{2}");
    }

    #[test]
    fn test_both_sources_behind_one_capability() {
        let pair = MemoryBufferPair::new(0, 256);
        pair.writer().write(&record(1, 16));
        let harvester = Harvester::new(
            vec![Box::new(pair) as Box<dyn BufferUnit>],
            sample_catalog().snapshot().sizer(),
            1024,
            Arc::new(Liveness::new()),
        )
        .unwrap();

        let mut text = FragmentSource::new();
        text.on_fragment("{");
        text.on_fragment("}");

        let mut sources: Vec<Box<dyn FrameSource>> = vec![Box::new(harvester), Box::new(text)];
        for source in sources.iter_mut() {
            let frames = source.drain_frames();
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].key, TRACE_KEY);
        }
    }
}
