// Trace relay pipeline
//
// This module contains everything between a session's buffers and the broker:
// - Per-unit double buffers and the swap capability (buffer)
// - Swap + drain cycles with liveness heartbeats (harvester, liveness)
// - MTU-bounded record framing and text-fragment framing (framer, source)
// - Backpressure-aware publishing (publisher) over a broker client (broker)
// - Descriptor export under the global metadata lock (metadata)
// - Sessions and the bucketed session registry (session, registry)
//
// Data flow:
// ==========
//
//   BufferUnit ─swap─> Harvester ─> frame_records ─┐
//                                                  ├─> Publisher ─> BrokerClient
//   interpreter ─fragments─> FragmentSource ───────┘
//
// The harvester runs under the per-session lock; publishing never does, so a
// full broker queue cannot hold the lock that close() needs.

pub mod broker;
pub mod buffer;
pub mod constants;
pub mod context;
pub mod error;
pub mod framer;
pub mod harvester;
pub mod liveness;
pub mod metadata;
pub mod publisher;
pub mod registry;
pub mod session;
pub mod source;

// Re-export commonly used types for convenience
pub use broker::{BrokerClient, BrokerConfig, KafkaBroker, PublishStatus, Topic};
pub use buffer::{BufferPolicy, BufferUnit, DrainedRegion, MemoryBufferPair};
pub use context::RuntimeContext;
pub use error::{RelayError, RelayResult};
pub use framer::{frame_records, FramedRegion, FramingError, RecordSizer, TextFramer};
pub use harvester::{HarvestStats, Harvester};
pub use metadata::{MetadataCatalog, MetadataExporter};
pub use publisher::{Deadline, PublishOutcome, Publisher, StopSignal};
pub use registry::SessionRegistry;
pub use session::{LifecycleState, Session, SessionHandle, SessionReport, SessionResources};
pub use source::{FragmentSource, Frame, FrameSource};
