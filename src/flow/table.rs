//! Per-worker sharded flow table: lookup, insertion, bidirectional
//! matching, and the idle-eviction sweep (§4.3–§4.5).

use std::collections::BTreeMap;

use super::{
    compute_hashval, shard_index, FlowEntry, FlowTuple, OrderedFlowKey, MAX_ACTIVE_FLOWS,
    MAX_IDLE_FLOWS,
};
use crate::decode::L3Type;

/// Outcome of a table lookup/insert for one packet.
pub struct Resolved<'a> {
    pub entry: &'a mut FlowEntry,
    pub is_new_flow: bool,
    pub direction_changed: bool,
}

/// Reason a flow could not be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    TableFull,
}

/// `max_active_flows` independent ordered containers, one per shard
/// (GLOSSARY "Shard"). Touched only by the worker that owns this table —
/// no locking anywhere in this module.
pub struct FlowTable {
    shards: Vec<BTreeMap<OrderedFlowKey, FlowEntry>>,
    cur_active_flows: usize,
    last_idle_scan_time: u64,
    idle_scratch: Vec<OrderedFlowKey>,
}

impl FlowTable {
    pub fn new() -> Self {
        FlowTable {
            shards: (0..MAX_ACTIVE_FLOWS).map(|_| BTreeMap::new()).collect(),
            cur_active_flows: 0,
            last_idle_scan_time: 0,
            idle_scratch: Vec::with_capacity(MAX_IDLE_FLOWS),
        }
    }

    pub fn active_flows(&self) -> usize {
        self.cur_active_flows
    }

    /// Find the flow for `tuple`, trying the reverse direction on a miss
    /// (§4.3 "Bidirectional lookup"). Does not insert.
    fn find(&mut self, tuple: &FlowTuple) -> Option<(usize, OrderedFlowKey, bool)> {
        let hashval = compute_hashval(tuple);
        let idx = shard_index(hashval);
        let key = OrderedFlowKey { hashval, tuple: *tuple };
        if self.shards[idx].contains_key(&key) {
            return Some((idx, key, false));
        }

        let reverse_tuple = tuple.swapped();
        let reverse_hash = compute_hashval(&reverse_tuple);
        let reverse_idx = shard_index(reverse_hash);
        let reverse_key = OrderedFlowKey {
            hashval: reverse_hash,
            tuple: reverse_tuple,
        };
        if self.shards[reverse_idx].contains_key(&reverse_key) {
            return Some((reverse_idx, reverse_key, true));
        }

        None
    }

    /// Resolve a packet to its flow entry, inserting a new one on a full
    /// miss (§4.3 "Insertion"). `flow_id` is supplied by the caller (the
    /// worker draws it from the global atomic counter) only when a new
    /// entry is actually created.
    pub fn find_or_insert(
        &mut self,
        l3_type: L3Type,
        tuple: FlowTuple,
        time_ms: u64,
        l4_len: u32,
        alloc_flow_id: impl FnOnce() -> u32,
    ) -> Result<Resolved<'_>, InsertError> {
        if let Some((idx, key, direction_changed)) = self.find(&tuple) {
            let entry = self.shards[idx].get_mut(&key).expect("just matched");
            return Ok(Resolved {
                entry,
                is_new_flow: false,
                direction_changed,
            });
        }

        if self.cur_active_flows >= MAX_ACTIVE_FLOWS {
            return Err(InsertError::TableFull);
        }

        let hashval = compute_hashval(&tuple);
        let idx = shard_index(hashval);
        let key = OrderedFlowKey { hashval, tuple };
        let flow_id = alloc_flow_id();
        let entry = FlowEntry::new(flow_id, l3_type, tuple, time_ms, l4_len);
        self.shards[idx].insert(key, entry);
        self.cur_active_flows += 1;

        let entry = self.shards[idx].get_mut(&key).expect("just inserted");
        Ok(Resolved {
            entry,
            is_new_flow: true,
            direction_changed: false,
        })
    }

    /// Idle sweep (§4.5): triggered by the caller when
    /// `last_time - last_idle_scan_time > IDLE_SCAN_PERIOD_MS`. The
    /// `MAX_IDLE_FLOWS` cap applies per shard, not to the sweep as a
    /// whole — each shard fills its own scratch buffer, drains it, and
    /// resets before the next shard is scanned, so a full table can still
    /// evict far more than `MAX_IDLE_FLOWS` flows in one sweep. Returns
    /// the evicted entries (LIFO per shard) so the worker can emit `idle`
    /// events for them before they are dropped.
    pub fn sweep_idle(&mut self, last_time: u64) -> Vec<FlowEntry> {
        let mut evicted = Vec::new();

        for idx in 0..self.shards.len() {
            self.idle_scratch.clear();
            for (key, entry) in self.shards[idx].iter() {
                if self.idle_scratch.len() >= MAX_IDLE_FLOWS {
                    break;
                }
                if entry.is_idle_candidate(last_time) {
                    self.idle_scratch.push(*key);
                }
            }

            for key in self.idle_scratch.drain(..).rev() {
                if let Some(entry) = self.shards[idx].remove(&key) {
                    self.cur_active_flows -= 1;
                    evicted.push(entry);
                }
            }
        }

        self.last_idle_scan_time = last_time;
        evicted
    }

    pub fn should_sweep(&self, last_time: u64, idle_scan_period_ms: u64) -> bool {
        last_time.saturating_sub(self.last_idle_scan_time) > idle_scan_period_ms
    }
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn tuple(src_port: u16, dst_port: u16) -> FlowTuple {
        FlowTuple {
            l4_protocol: 6,
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            src_port,
            dst_port,
        }
    }

    #[test]
    fn first_packet_creates_new_flow() {
        let mut table = FlowTable::new();
        let mut next_id = 1u32;
        let resolved = table
            .find_or_insert(L3Type::Ipv4, tuple(1111, 80), 1000, 64, || {
                let id = next_id;
                next_id += 1;
                id
            })
            .unwrap();
        assert!(resolved.is_new_flow);
        assert_eq!(table.active_flows(), 1);
    }

    #[test]
    fn reverse_direction_resolves_to_same_flow() {
        let mut table = FlowTable::new();
        let mut next_id = 1u32;
        let mut alloc = || {
            let id = next_id;
            next_id += 1;
            id
        };

        let first_id = table
            .find_or_insert(L3Type::Ipv4, tuple(1111, 80), 1000, 64, &mut alloc)
            .unwrap()
            .entry
            .flow_id;

        let reverse = tuple(1111, 80).swapped();
        let resolved = table
            .find_or_insert(L3Type::Ipv4, reverse, 1001, 40, &mut alloc)
            .unwrap();

        assert!(!resolved.is_new_flow);
        assert!(resolved.direction_changed);
        assert_eq!(resolved.entry.flow_id, first_id);
        assert_eq!(table.active_flows(), 1);
    }

    #[test]
    fn table_full_rejects_new_flows() {
        let mut table = FlowTable::new();
        let mut next_id = 1u32;
        for port in 0..MAX_ACTIVE_FLOWS as u16 {
            table
                .find_or_insert(L3Type::Ipv4, tuple(port, 80), 1000, 10, || {
                    let id = next_id;
                    next_id += 1;
                    id
                })
                .unwrap();
        }
        assert_eq!(table.active_flows(), MAX_ACTIVE_FLOWS);

        let err = table.find_or_insert(L3Type::Ipv4, tuple(60000, 80), 1000, 10, || {
            next_id += 1;
            next_id
        });
        assert_eq!(err.err(), Some(InsertError::TableFull));
    }

    #[test]
    fn idle_sweep_evicts_fin_ack_flows() {
        let mut table = FlowTable::new();
        let mut next_id = 1u32;
        let resolved = table
            .find_or_insert(L3Type::Ipv4, tuple(1111, 80), 1000, 64, || {
                next_id += 1;
                next_id
            })
            .unwrap();
        resolved.entry.flow_fin_ack_seen = true;
        resolved.entry.flow_ack_seen = true;

        let evicted = table.sweep_idle(2000);
        assert_eq!(evicted.len(), 1);
        assert_eq!(table.active_flows(), 0);
    }
}
