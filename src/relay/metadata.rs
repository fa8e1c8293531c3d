//! Descriptor catalog and metadata export
//!
//! The instrumentation subsystem keeps append-only tables of format strings
//! and clause descriptors, indexed from 1. Records in a drained region only
//! carry a clause id; a consumer needs these tables to decode them, so each
//! session publishes them once before its first harvest cycle.
//!
//! ## Locking
//!
//! [`MetadataCatalog`] is the global metadata lock. The exporter holds it only
//! while copying the tables into a [`CatalogSnapshot`]; publishing happens
//! after it is released, so a slow broker never blocks other sessions or the
//! subsystem appending new entries.
//!
//! ## Message kinds
//!
//! | Key      | Payload (JSON)                                          |
//! |----------|---------------------------------------------------------|
//! | `format` | `{"id", "format"}`                                      |
//! | `probe`  | `{"id", "provider", "module", "function", "name"}`      |
//! | `eprobe` | `{"clause", "probe", "user_arg", "size", "records"}`    |

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use super::constants::{EPROBE_KEY, FORMAT_KEY, PROBE_KEY};
use super::error::{RelayError, RelayResult};
use super::framer::RecordSizer;
use super::publisher::{PublishOutcome, Publisher, StopSignal};

/// Where a probe fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeDescription {
    pub id: u32,
    pub provider: String,
    pub module: String,
    pub function: String,
    pub name: String,
}

/// Layout of one action's data within a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecordDescriptor {
    pub action: u16,
    pub size: u32,
    pub offset: u32,
    pub alignment: u16,
    pub format: u16,
    pub arg: u64,
}

/// One action of a clause
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionDescriptor {
    pub record: RecordDescriptor,
    /// Aggregating actions do not write into trace records
    pub aggregating: bool,
    /// Actions building an aggregation key tuple
    pub in_tuple: bool,
}

impl ActionDescriptor {
    /// A plain action writing into the record
    pub fn record(record: RecordDescriptor) -> Self {
        Self {
            record,
            aggregating: false,
            in_tuple: false,
        }
    }

    pub fn aggregation(record: RecordDescriptor) -> Self {
        Self {
            aggregating: true,
            ..Self::record(record)
        }
    }

    pub fn tuple_member(record: RecordDescriptor) -> Self {
        Self {
            in_tuple: true,
            ..Self::record(record)
        }
    }

    fn is_exported(&self) -> bool {
        !self.aggregating && !self.in_tuple
    }
}

/// An enabled clause: its probe, record size and actions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClauseDescriptor {
    pub probe: Option<ProbeDescription>,
    pub user_arg: u64,
    /// Size in bytes of the clause's records, clause id included
    pub size: u32,
    pub actions: Vec<ActionDescriptor>,
}

/// Point-in-time copy of the descriptor tables
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    /// Format strings; format id `n` is at index `n - 1`
    pub formats: Vec<String>,
    /// Clause slots; clause id `n` is at index `n - 1`
    pub clauses: Vec<Option<ClauseDescriptor>>,
}

impl CatalogSnapshot {
    /// Clause descriptor for a 1-based clause id
    pub fn clause(&self, id: u32) -> Option<&ClauseDescriptor> {
        let index = (id as usize).checked_sub(1)?;
        self.clauses.get(index)?.as_ref()
    }

    fn enabled_clauses(&self) -> impl Iterator<Item = (u32, &ClauseDescriptor)> {
        self.clauses
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|c| (i as u32 + 1, c)))
    }

    /// Largest record size over the enabled clauses
    pub fn max_record_size(&self) -> usize {
        self.enabled_clauses()
            .map(|(_, c)| c.size as usize)
            .max()
            .unwrap_or(0)
    }

    /// Reject an MTU smaller than any enabled clause's record
    pub fn check_mtu(&self, mtu: usize) -> RelayResult<()> {
        match self.enabled_clauses().find(|(_, c)| c.size as usize > mtu) {
            Some((clause, c)) => Err(RelayError::RecordExceedsMtu {
                clause,
                size: c.size as usize,
                mtu,
            }),
            None => Ok(()),
        }
    }

    /// Record-size lookup for the framer
    pub fn sizer(&self) -> ClauseSizes {
        let mut sizes = vec![0; self.clauses.len() + 1];
        for (id, clause) in self.enabled_clauses() {
            sizes[id as usize] = clause.size as usize;
        }
        ClauseSizes(sizes)
    }
}

/// Clause id to record size, 0 for unknown ids
#[derive(Debug, Clone, Default)]
pub struct ClauseSizes(Vec<usize>);

impl RecordSizer for ClauseSizes {
    fn record_size(&self, clause: u32) -> usize {
        self.0.get(clause as usize).copied().unwrap_or(0)
    }
}

/// The instrumentation subsystem's descriptor tables behind the global
/// metadata lock
#[derive(Debug, Default)]
pub struct MetadataCatalog {
    tables: Mutex<CatalogSnapshot>,
}

impl MetadataCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a format string; returns its id
    pub fn add_format(&self, format: &str) -> u32 {
        let mut tables = self.tables.lock();
        tables.formats.push(format.to_string());
        tables.formats.len() as u32
    }

    /// Append a clause slot (empty for a disabled clause); returns its id
    pub fn add_clause(&self, clause: Option<ClauseDescriptor>) -> u32 {
        let mut tables = self.tables.lock();
        tables.clauses.push(clause);
        tables.clauses.len() as u32
    }

    /// Copy the tables under the lock
    pub fn snapshot(&self) -> CatalogSnapshot {
        self.tables.lock().clone()
    }
}

// ===== Export =====

#[derive(Serialize)]
struct FormatMessage<'a> {
    id: u32,
    format: &'a str,
}

#[derive(Serialize)]
struct EprobeMessage<'a> {
    clause: u32,
    probe: u32,
    user_arg: u64,
    size: u32,
    records: Vec<&'a RecordDescriptor>,
}

/// Counts of descriptor messages published by one export
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub formats: usize,
    pub probes: usize,
    pub eprobes: usize,
}

/// Publishes a session's descriptor tables
pub struct MetadataExporter;

impl MetadataExporter {
    /// Snapshot the catalog and publish one message per descriptor
    ///
    /// Empty clause slots and clauses without a probe are skipped. Aggregating
    /// and tuple-member actions are left out of the `eprobe` records.
    pub fn export(
        catalog: &MetadataCatalog,
        publisher: &mut Publisher,
        stop: &dyn StopSignal,
    ) -> RelayResult<ExportSummary> {
        let snapshot = catalog.snapshot();
        let mut summary = ExportSummary::default();

        for (i, format) in snapshot.formats.iter().enumerate() {
            let message = FormatMessage {
                id: i as u32 + 1,
                format,
            };
            Self::send(publisher, FORMAT_KEY, &serde_json::to_vec(&message)?, stop)?;
            summary.formats += 1;
        }

        for (id, clause) in snapshot.enabled_clauses() {
            let Some(probe) = clause.probe.as_ref() else {
                continue;
            };

            Self::send(publisher, PROBE_KEY, &serde_json::to_vec(probe)?, stop)?;
            summary.probes += 1;

            let message = EprobeMessage {
                clause: id,
                probe: probe.id,
                user_arg: clause.user_arg,
                size: clause.size,
                records: clause
                    .actions
                    .iter()
                    .filter(|a| a.is_exported())
                    .map(|a| &a.record)
                    .collect(),
            };
            Self::send(publisher, EPROBE_KEY, &serde_json::to_vec(&message)?, stop)?;
            summary.eprobes += 1;
        }

        debug!(
            formats = summary.formats,
            probes = summary.probes,
            eprobes = summary.eprobes,
            "Exported descriptor tables"
        );
        Ok(summary)
    }

    fn send(
        publisher: &mut Publisher,
        key: &str,
        payload: &[u8],
        stop: &dyn StopSignal,
    ) -> RelayResult<()> {
        match publisher.publish(Some(key.as_bytes()), payload, stop) {
            PublishOutcome::Enqueued { .. } => Ok(()),
            PublishOutcome::Retry => {
                publisher.abandon(1);
                Err(RelayError::MetadataExport(format!(
                    "stopped while the delivery queue was full ({} descriptor)",
                    key
                )))
            }
            PublishOutcome::Fatal(reason) => Err(RelayError::MetadataExport(format!(
                "{} descriptor rejected: {}",
                key, reason
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::relay::broker::{BrokerClient, Topic};
    use crate::relay::publisher::Never;
    use crate::testing::helpers::{clause, sample_catalog};
    use crate::testing::mocks::MockBroker;

    fn publisher(broker: &Arc<MockBroker>) -> Publisher {
        Publisher::new(
            Arc::clone(broker) as Arc<dyn BrokerClient>,
            Topic::new("meta").unwrap(),
            Duration::from_millis(1),
        )
    }

    #[test]
    fn test_snapshot_indexing() {
        let snapshot = sample_catalog().snapshot();
        assert!(snapshot.clause(0).is_none());
        assert_eq!(snapshot.clause(1).map(|c| c.size), Some(16));
        assert!(snapshot.clause(3).is_none());
        assert!(snapshot.clause(4).is_none());
        assert_eq!(snapshot.max_record_size(), 32);
    }

    #[test]
    fn test_sizer_from_snapshot() {
        let sizer = sample_catalog().snapshot().sizer();
        assert_eq!(sizer.record_size(1), 16);
        assert_eq!(sizer.record_size(2), 32);
        assert_eq!(sizer.record_size(3), 0);
        assert_eq!(sizer.record_size(99), 0);
    }

    #[test]
    fn test_check_mtu() {
        let snapshot = sample_catalog().snapshot();
        assert!(snapshot.check_mtu(32).is_ok());

        let err = snapshot.check_mtu(20).unwrap_err();
        assert!(matches!(
            err,
            RelayError::RecordExceedsMtu {
                clause: 2,
                size: 32,
                mtu: 20
            }
        ));
    }

    #[test]
    fn test_export_publishes_each_descriptor() {
        let broker = Arc::new(MockBroker::new());
        let mut publisher = publisher(&broker);

        let summary = MetadataExporter::export(&sample_catalog(), &mut publisher, &Never).unwrap();
        assert_eq!(
            summary,
            ExportSummary {
                formats: 2,
                probes: 2,
                eprobes: 2
            }
        );

        let formats = broker.published_with_key(FORMAT_KEY);
        let first: serde_json::Value = serde_json::from_slice(&formats[0].payload).unwrap();
        assert_eq!(first["id"], 1);
        assert_eq!(first["format"], "%d\n");

        let probes = broker.published_with_key(PROBE_KEY);
        let probe: serde_json::Value = serde_json::from_slice(&probes[1].payload).unwrap();
        assert_eq!(probe["function"], "write");
        assert_eq!(probe["provider"], "syscall");

        let eprobes = broker.published_with_key(EPROBE_KEY);
        let eprobe: serde_json::Value = serde_json::from_slice(&eprobes[1].payload).unwrap();
        assert_eq!(eprobe["clause"], 2);
        assert_eq!(eprobe["probe"], 11);
        assert_eq!(eprobe["size"], 32);
        assert_eq!(eprobe["records"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_export_skips_aggregations_and_unbound_clauses() {
        let catalog = MetadataCatalog::new();
        let mut with_agg = clause(20, "open", 12);
        let rec = with_agg.actions[0].record;
        with_agg.actions.push(ActionDescriptor::aggregation(rec));
        with_agg.actions.push(ActionDescriptor::tuple_member(rec));
        catalog.add_clause(Some(with_agg));

        let mut probeless = clause(21, "close", 12);
        probeless.probe = None;
        catalog.add_clause(Some(probeless));

        let broker = Arc::new(MockBroker::new());
        let mut publisher = publisher(&broker);
        let summary = MetadataExporter::export(&catalog, &mut publisher, &Never).unwrap();
        assert_eq!(summary.eprobes, 1);

        let eprobes = broker.published_with_key(EPROBE_KEY);
        let eprobe: serde_json::Value = serde_json::from_slice(&eprobes[0].payload).unwrap();
        assert_eq!(eprobe["records"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_export_fails_on_rejected_descriptor() {
        let broker = Arc::new(MockBroker::new());
        broker.fail_next("unknown topic");
        let mut publisher = publisher(&broker);

        let err = MetadataExporter::export(&sample_catalog(), &mut publisher, &Never).unwrap_err();
        assert!(matches!(err, RelayError::MetadataExport(_)));
    }

    #[test]
    fn test_appends_after_snapshot_are_not_seen() {
        let catalog = sample_catalog();
        let snapshot = catalog.snapshot();
        catalog.add_clause(Some(clause(12, "stat", 64)));
        assert_eq!(snapshot.clauses.len(), 3);
        assert_eq!(catalog.snapshot().clauses.len(), 4);
    }
}
