//! Test helper functions
//!
//! Fixtures for records, drained regions, descriptor catalogs and configs.

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::Config;
use crate::relay::constants::{CLAUSE_ID_SIZE, TEST_CLIENT_ID};
use crate::relay::metadata::{
    ActionDescriptor, ClauseDescriptor, MetadataCatalog, ProbeDescription, RecordDescriptor,
};

/// Build one record of `size` bytes tagged with `clause`
///
/// The payload after the clause id is filled with the low byte of the clause
/// so records are distinguishable in a region.
pub fn record(clause: u32, size: usize) -> Vec<u8> {
    assert!(size >= CLAUSE_ID_SIZE, "record must hold its clause id");
    let mut buf = BytesMut::with_capacity(size);
    buf.put_slice(&clause.to_ne_bytes());
    buf.put_bytes(clause as u8, size - CLAUSE_ID_SIZE);
    buf.to_vec()
}

/// Concatenate records into one region
pub fn region_of(records: &[Vec<u8>]) -> Bytes {
    let mut buf = BytesMut::new();
    for r in records {
        buf.put_slice(r);
    }
    buf.freeze()
}

/// Config with test defaults and a short poll period
pub fn mock_config() -> Config {
    let mut config = Config::default();
    config.poll_period_ms = 10;
    config.stop_timeout_ms = 5_000;
    config.final_flush_timeout_ms = 100;
    config.queue_full_pump_ms = 1;
    config.broker.client_id = TEST_CLIENT_ID.to_string();
    config
}

/// Descriptor for a probe named `syscall::<function>:entry`
pub fn probe(id: u32, function: &str) -> ProbeDescription {
    ProbeDescription {
        id,
        provider: "syscall".to_string(),
        module: String::new(),
        function: function.to_string(),
        name: "entry".to_string(),
    }
}

/// Clause descriptor with one plain trace action per 8 bytes of payload
pub fn clause(probe_id: u32, function: &str, size: u32) -> ClauseDescriptor {
    let actions = (0..(size - CLAUSE_ID_SIZE as u32) / 8)
        .map(|i| ActionDescriptor::record(RecordDescriptor {
            action: 1,
            size: 8,
            offset: CLAUSE_ID_SIZE as u32 + i * 8,
            alignment: 8,
            format: 0,
            arg: 0,
        }))
        .collect();

    ClauseDescriptor {
        probe: Some(probe(probe_id, function)),
        user_arg: 0,
        size,
        actions,
    }
}

/// Catalog with two formats and clauses 1 (16 bytes), 2 (32 bytes) and an
/// empty slot 3
pub fn sample_catalog() -> MetadataCatalog {
    let catalog = MetadataCatalog::new();
    catalog.add_format("%d\n");
    catalog.add_format("%s: %d\n");
    catalog.add_clause(Some(clause(10, "read", 16)));
    catalog.add_clause(Some(clause(11, "write", 32)));
    catalog.add_clause(None);
    catalog
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        let r = record(7, 12);
        assert_eq!(r.len(), 12);
        assert_eq!(&r[..4], &7u32.to_ne_bytes());
        assert!(r[4..].iter().all(|&b| b == 7));
    }

    #[test]
    fn test_region_of_concatenates() {
        let region = region_of(&[record(1, 8), record(2, 16)]);
        assert_eq!(region.len(), 24);
    }

    #[test]
    fn test_sample_catalog() {
        let snapshot = sample_catalog().snapshot();
        assert_eq!(snapshot.formats.len(), 2);
        assert_eq!(snapshot.clauses.len(), 3);
        assert_eq!(snapshot.clause(2).map(|c| c.size), Some(32));
    }
}
