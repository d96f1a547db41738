//! Per-node input aggregation.
//!
//! One `PortAggregator` exists per node of a run. It keeps a buffer per
//! inbound edge and decides, according to each edge's `Mode`, whether the
//! node can fire and which values the firing receives:
//!
//! - plain edges hold only their latest unread value;
//! - `BUFFER` edges accumulate every emission and hand the whole batch over
//!   as an array once the source has completed;
//! - `MULTI` edges into the same slot are joined: the slot is ready only when
//!   every joined edge has a fresh contribution, and the slot value is the
//!   concatenation of all contributions in edge-declaration order;
//! - `ZIP` edges are paired by position across slots, one firing per tuple.

use std::collections::{BTreeMap, VecDeque};

use tracing::debug;

use weft_core::graph::{Edge, Mode, Node};
use weft_core::types::{InputSnapshot, Value};

/// How an upstream node finished, as seen by the edges it feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closure {
    /// The source retired after a successful last firing.
    Completed,
    /// The source retired after failing, or without ever firing.
    Failed,
}

#[derive(Debug)]
struct PortBuffer {
    edge_id: String,
    slot: String,
    mode: Mode,
    values: VecDeque<Value>,
    closed: Option<Closure>,
    /// A buffered batch is handed over once.
    batch_taken: bool,
    /// Arrival order of the most recent value.
    seq: u64,
}

impl PortBuffer {
    fn is_zip(&self) -> bool {
        self.mode.contains(Mode::ZIP)
    }

    fn is_buffered(&self) -> bool {
        !self.is_zip() && self.mode.contains(Mode::BUFFER)
    }

    fn is_multi(&self) -> bool {
        !self.is_zip() && self.mode.contains(Mode::MULTI)
    }

    /// Has a contribution ready for the next firing.
    fn is_fresh(&self) -> bool {
        if self.is_buffered() {
            self.closed == Some(Closure::Completed) && !self.batch_taken
        } else {
            !self.values.is_empty()
        }
    }

    /// A buffered edge that will never contribute again counts as satisfied in a join.
    fn is_settled(&self) -> bool {
        self.is_buffered() && self.closed.is_some() && !self.is_fresh()
    }

    fn take(&mut self) -> Vec<Value> {
        if self.is_buffered() {
            self.batch_taken = true;
        }
        self.values.drain(..).collect()
    }
}

/// What one firing draws from the buffers.
#[derive(Debug, Default)]
struct FirePlan {
    /// Slot fed by a single edge in isolation, with stale siblings to drop.
    singles: Vec<(usize, Vec<usize>)>,
    /// Slot fed by a MULTI join, contributing edges in declaration order.
    joins: Vec<(String, Vec<usize>)>,
    /// ZIP lanes to pop one value from each.
    zip: Vec<usize>,
}

/// Input side of one node.
#[derive(Debug)]
pub struct PortAggregator {
    node_id: String,
    ports: Vec<PortBuffer>,
    /// Wired input slots, in declaration order.
    slots: Vec<String>,
    last_known: BTreeMap<String, Value>,
    seq: u64,
}

impl PortAggregator {
    /// Build the aggregator for `node` from its inbound edges, in declaration order.
    /// Port indices follow the order of `inbound`.
    pub fn new<'a>(node: &Node, inbound: impl IntoIterator<Item = &'a Edge>) -> Self {
        let ports: Vec<PortBuffer> = inbound
            .into_iter()
            .map(|edge| PortBuffer {
                edge_id: edge.id.clone(),
                slot: edge.to.port.clone(),
                mode: edge.mode,
                values: VecDeque::new(),
                closed: None,
                batch_taken: false,
                seq: 0,
            })
            .collect();

        let slots = node
            .inputs
            .keys()
            .filter(|slot| ports.iter().any(|p| &p.slot == *slot && !p.is_zip()))
            .cloned()
            .collect();

        Self {
            node_id: node.id.clone(),
            ports,
            slots,
            last_known: BTreeMap::new(),
            seq: 0,
        }
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    /// No inbound edges: the node fires exactly once on its own.
    pub fn is_source(&self) -> bool {
        self.ports.is_empty()
    }

    /// Record a value emitted along inbound port `port`.
    ///
    /// Returns `false` when the port is already closed and the value was dropped.
    pub fn push(&mut self, port: usize, value: Value) -> bool {
        let Some(buffer) = self.ports.get_mut(port) else {
            return false;
        };
        if buffer.closed.is_some() {
            debug!(node_id = %self.node_id, edge = %buffer.edge_id, "Dropping value on closed edge");
            return false;
        }
        if !buffer.is_zip() && !buffer.is_buffered() {
            // Latest value wins
            buffer.values.clear();
        }
        buffer.values.push_back(value);
        self.seq += 1;
        buffer.seq = self.seq;
        true
    }

    /// Mark inbound port `port` as finished. A failed close discards unread values.
    pub fn close(&mut self, port: usize, closure: Closure) {
        if let Some(buffer) = self.ports.get_mut(port) {
            if buffer.closed.is_none() {
                buffer.closed = Some(closure);
                if closure == Closure::Failed {
                    buffer.values.clear();
                }
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.plan().is_some()
    }

    /// Every inbound edge is closed and nothing left can fire.
    pub fn is_exhausted(&self) -> bool {
        self.ports.iter().all(|p| p.closed.is_some()) && !self.is_ready()
    }

    /// Consume the inputs for one firing, if the node is ready.
    pub fn try_fire(&mut self) -> Option<InputSnapshot> {
        let plan = self.plan()?;

        for (port, stale) in plan.singles {
            for idx in stale {
                self.ports[idx].values.clear();
            }
            let buffer = &mut self.ports[port];
            let buffered = buffer.is_buffered();
            let slot = buffer.slot.clone();
            let mut values = buffer.take();
            let value = if buffered {
                Value::Array(values)
            } else {
                values.pop().unwrap_or(Value::Null)
            };
            self.last_known.insert(slot, value);
        }

        for (slot, ports) in plan.joins {
            let joined: Vec<Value> = ports
                .into_iter()
                .flat_map(|idx| self.ports[idx].take())
                .collect();
            self.last_known.insert(slot, Value::Array(joined));
        }

        for idx in plan.zip {
            let buffer = &mut self.ports[idx];
            if let Some(value) = buffer.values.pop_front() {
                let slot = buffer.slot.clone();
                self.last_known.insert(slot, value);
            }
        }

        Some(self.last_known.clone())
    }

    /// Work out what the next firing would consume, without consuming it.
    ///
    /// A streaming `MULTI` join (no `BUFFER`) needs a fresh value from every
    /// joined edge, and a closed edge never counts as contributing. Once one
    /// side of such a join completes, the join stops firing, so firings never
    /// exceed the smallest contribution count. Buffered joins instead treat a
    /// closed edge as settled.
    fn plan(&self) -> Option<FirePlan> {
        let lanes: Vec<usize> = (0..self.ports.len())
            .filter(|&i| self.ports[i].is_zip())
            .collect();
        let zipped = !lanes.is_empty();
        if zipped && lanes.iter().any(|&i| self.ports[i].values.is_empty()) {
            // An incomplete tuple waits
            return None;
        }

        let mut plan = FirePlan {
            zip: lanes,
            ..FirePlan::default()
        };
        let mut drawn = Vec::new();

        for slot in &self.slots {
            let feeding: Vec<usize> = (0..self.ports.len())
                .filter(|&i| &self.ports[i].slot == slot && !self.ports[i].is_zip())
                .collect();

            let joined: Vec<usize> = feeding
                .iter()
                .copied()
                .filter(|&i| self.ports[i].is_multi())
                .collect();
            if !joined.is_empty() {
                let fresh: Vec<usize> = joined
                    .iter()
                    .copied()
                    .filter(|&i| self.ports[i].is_fresh())
                    .collect();
                let complete = joined
                    .iter()
                    .all(|&i| self.ports[i].is_fresh() || self.ports[i].is_settled());
                if !fresh.is_empty() && complete {
                    plan.joins.push((slot.clone(), fresh));
                    drawn.push(slot.as_str());
                    continue;
                }
            }

            let isolated: Vec<usize> = feeding
                .iter()
                .copied()
                .filter(|&i| !self.ports[i].is_multi())
                .collect();
            let latest = isolated
                .iter()
                .copied()
                .filter(|&i| self.ports[i].is_fresh())
                .max_by_key(|&i| self.ports[i].seq);
            if let Some(port) = latest {
                // Older unread plain values on the same slot are overwritten
                let stale = isolated
                    .iter()
                    .copied()
                    .filter(|&i| {
                        i != port && !self.ports[i].is_buffered() && self.ports[i].is_fresh()
                    })
                    .collect();
                plan.singles.push((port, stale));
                drawn.push(slot.as_str());
            }
        }

        if !zipped && drawn.is_empty() {
            return None;
        }

        // Every wired slot needs a value, fresh or from an earlier firing
        let satisfied = self
            .slots
            .iter()
            .all(|s| drawn.contains(&s.as_str()) || self.last_known.contains_key(s));
        if !satisfied {
            return None;
        }

        Some(plan)
    }
}
