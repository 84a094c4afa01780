//! In-memory delivery state shared by the log engines.
//!
//! Both engines serve reads from this state; the file engine additionally
//! persists appends and consumer floors around it.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use forest_time::{Time, TimeProvider};
use forest_types::Slot;
use observability_deps::tracing::warn;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::core::{LogRecord, LogRetention, SequencedRecord};

/// Retained records plus per-name consumer positions.
#[derive(Debug)]
pub(crate) struct LogState {
    retention: LogRetention,
    time_provider: Arc<dyn TimeProvider>,
    records: Mutex<RecordsState>,
    consumers: Mutex<HashMap<String, Arc<ConsumerShared>>>,
    /// Woken on append and nak; consumers re-check after every wakeup.
    pub(crate) notify: Notify,
}

#[derive(Debug)]
struct RecordsState {
    /// Retained records, oldest first, contiguous slots.
    records: VecDeque<SequencedRecord>,
    /// Next slot to assign; starts at 1.
    next_slot: u64,
}

impl RecordsState {
    /// Apply retention, returning how many records were discarded.
    fn evict(&mut self, retention: &LogRetention, now: Time) -> usize {
        let before = self.records.len();
        if let Some(max_records) = retention.max_records {
            while self.records.len() > max_records {
                self.records.pop_front();
            }
        }
        if let Some(max_age) = retention.max_age {
            let horizon = now - max_age;
            while self
                .records
                .front()
                .map(|r| r.timestamp < horizon)
                .unwrap_or(false)
            {
                self.records.pop_front();
            }
        }
        before - self.records.len()
    }

    fn get(&self, slot: u64) -> Option<&SequencedRecord> {
        let front = self.records.front()?.slot.get();
        if slot < front {
            return None;
        }
        self.records.get((slot - front) as usize)
    }

    fn earliest_retained(&self) -> u64 {
        self.records
            .front()
            .map(|r| r.slot.get())
            .unwrap_or(self.next_slot)
    }
}

/// Position of one named consumer, shared by all its handles.
#[derive(Debug)]
pub(crate) struct ConsumerShared {
    name: String,
    state: Mutex<ConsumerState>,
}

#[derive(Debug)]
struct ConsumerState {
    /// Next slot this consumer name has never been handed.
    next_slot: u64,
    /// Delivered but unsettled slots.
    pending: BTreeMap<u64, PendingState>,
}

#[derive(Debug, Clone, Copy)]
struct PendingState {
    delivery_count: u32,
    redeliver: bool,
}

impl LogState {
    /// Build state over pre-existing records (file recovery) or an empty
    /// queue.
    pub(crate) fn new(
        retention: LogRetention,
        time_provider: Arc<dyn TimeProvider>,
        records: VecDeque<SequencedRecord>,
        next_slot: u64,
    ) -> Self {
        Self {
            retention,
            time_provider,
            records: Mutex::new(RecordsState { records, next_slot }),
            consumers: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    /// Assign the next slot to `record` and retain it. Returns the slot and
    /// the number of records evicted by retention.
    ///
    /// Used by the memory engine; the file engine sequences under its own IO
    /// lock and calls [`LogState::publish_sequenced`].
    pub(crate) fn sequence_and_publish(&self, record: LogRecord) -> (Slot, usize) {
        let mut records = self.records.lock();
        let slot = Slot::new(records.next_slot);
        records.next_slot += 1;
        records.records.push_back(SequencedRecord {
            slot,
            subject: record.subject,
            payload: record.payload,
            timestamp: record.timestamp,
        });
        let evicted = records.evict(&self.retention, self.time_provider.now());
        (slot, evicted)
    }

    /// Retain an already-sequenced record. The caller guarantees slots arrive
    /// in order. Returns the number of records evicted by retention.
    pub(crate) fn publish_sequenced(&self, record: SequencedRecord) -> usize {
        let mut records = self.records.lock();
        debug_assert_eq!(record.slot.get(), records.next_slot);
        records.next_slot = record.slot.get() + 1;
        records.records.push_back(record);
        records.evict(&self.retention, self.time_provider.now())
    }

    pub(crate) fn watermark(&self) -> u64 {
        self.records.lock().next_slot
    }

    /// Copy of the currently retained records, oldest first.
    pub(crate) fn snapshot_records(&self) -> Vec<SequencedRecord> {
        self.records.lock().records.iter().cloned().collect()
    }

    pub(crate) fn earliest_retained(&self) -> u64 {
        self.records.lock().earliest_retained()
    }

    /// Look up the named consumer, creating it positioned at `start` (bounded
    /// below by the retention horizon) if absent.
    pub(crate) fn get_or_create_consumer(
        &self,
        name: &str,
        start: Option<u64>,
    ) -> Arc<ConsumerShared> {
        let mut consumers = self.consumers.lock();
        Arc::clone(consumers.entry(name.to_string()).or_insert_with(|| {
            let earliest = self.records.lock().earliest_retained();
            let next_slot = start.unwrap_or(earliest).max(earliest);
            Arc::new(ConsumerShared {
                name: name.to_string(),
                state: Mutex::new(ConsumerState {
                    next_slot,
                    pending: BTreeMap::new(),
                }),
            })
        }))
    }

    /// Hand out the next deliverable record for `consumer`, if any:
    /// redelivery-due records first (earliest slot wins), then the next
    /// unseen slot. Returns the record and its delivery count.
    pub(crate) fn try_next(&self, consumer: &ConsumerShared) -> Option<(SequencedRecord, u32)> {
        let mut records = self.records.lock();
        records.evict(&self.retention, self.time_provider.now());

        let mut state = consumer.state.lock();

        let redeliver_due: Vec<u64> = state
            .pending
            .iter()
            .filter(|(_, p)| p.redeliver)
            .map(|(slot, _)| *slot)
            .collect();
        for slot in redeliver_due {
            match records.get(slot) {
                Some(record) => {
                    let pending = state.pending.get_mut(&slot).expect("slot is pending");
                    pending.redeliver = false;
                    pending.delivery_count += 1;
                    return Some((record.clone(), pending.delivery_count));
                }
                None => {
                    warn!(
                        consumer = %consumer.name,
                        slot,
                        "record evicted before redelivery"
                    );
                    state.pending.remove(&slot);
                }
            }
        }

        if state.next_slot < records.next_slot {
            let earliest = records.earliest_retained();
            if state.next_slot < earliest {
                warn!(
                    consumer = %consumer.name,
                    from = state.next_slot,
                    to = earliest,
                    "consumer position behind retention horizon, skipping forward"
                );
                state.next_slot = earliest;
            }
            if let Some(record) = records.get(state.next_slot) {
                let slot = record.slot.get();
                state.pending.insert(
                    slot,
                    PendingState {
                        delivery_count: 1,
                        redeliver: false,
                    },
                );
                state.next_slot = slot + 1;
                return Some((record.clone(), 1));
            }
        }

        None
    }

    /// Settle `slot` as consumed.
    pub(crate) fn ack(&self, consumer: &ConsumerShared, slot: Slot) {
        consumer.state.lock().pending.remove(&slot.get());
    }

    /// Schedule `slot` for redelivery and wake waiting handles.
    pub(crate) fn nak(&self, consumer: &ConsumerShared, slot: Slot) {
        {
            let mut state = consumer.state.lock();
            if let Some(pending) = state.pending.get_mut(&slot.get()) {
                pending.redeliver = true;
            }
        }
        self.notify.notify_waiters();
    }

    /// Lowest unsettled slot of `consumer`: everything below is consumed.
    /// This is what the file engine persists.
    pub(crate) fn floor(&self, consumer: &ConsumerShared) -> u64 {
        let state = consumer.state.lock();
        state
            .pending
            .keys()
            .next()
            .copied()
            .unwrap_or(state.next_slot)
    }
}
