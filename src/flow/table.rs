use log::{debug, error, info, warn};
use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use crate::entity::packet::Packet;
use crate::error::{ExportError, RecordError, TableError};
use crate::flow::mqtt::{ClientIds, ControlType};
use crate::flow::{FlowRecord, RecordBuilder, RecordId};
use crate::ipfix::message::FieldValue;
use crate::ipfix::template::MqttIpfix;
use crate::stats::{Counter, Stats};

/// What happens to a new flow when the table is full.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    Reject,
    EvictOldest,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        OverflowPolicy::EvictOldest
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reject" => Ok(OverflowPolicy::Reject),
            "evict-oldest" => Ok(OverflowPolicy::EvictOldest),
            _ => Err(format!("unknown overflow policy {}, expected reject or evict-oldest", s)),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum FlowState {
    Active,
    Updated,
}

/// Receives every flow the table admits.
pub trait FlowExporter: Send + Sync {
    fn export(&self, flow: &ExportedFlow) -> Result<(), ExportError>;
}

/// A packet admitted into the table, with the state of its flow at that time.
#[derive(Debug, Clone)]
pub struct ExportedFlow {
    pub record: FlowRecord,
    pub record_id: RecordId,
    pub flow_start_ns: u64,
    pub flow_end_ns: u64,
    pub packets: u64,
    pub state: FlowState,
}

impl ExportedFlow {
    /// Record fields of the packet with the start and end times of the whole flow.
    pub fn ipfix_representation(&self) -> (HashMap<&'static str, FieldValue>, MqttIpfix) {
        let mut ipfix = self.record.ipfix_record();
        ipfix.flow_start_nanoseconds = Some(self.flow_start_ns);
        ipfix.flow_end_nanoseconds = Some(self.flow_end_ns);
        ipfix.flow_duration_microseconds = Some(self.flow_end_ns.saturating_sub(self.flow_start_ns) / 1_000);

        (ipfix.named_values(), ipfix)
    }
}

impl fmt::Display for ExportedFlow {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?} flow [{}] packets: {} - {}", self.state, self.record_id, self.packets, self.record)
    }
}

/// Longest flow whose duration still fits flowDurationMicroseconds (unsigned32).
const MAX_FLOW_DURATION_NS: u64 = u32::MAX as u64 * 1_000;

#[derive(Debug)]
struct FlowEntry {
    first_seen_ns: u64,
    last_seen_ns: u64,
    packets: u64,
    state: FlowState,
    touched: u64, // table clock of the last packet
}

impl FlowEntry {
    fn new(timestamp_ns: u64, clock: u64) -> Self {
        FlowEntry { first_seen_ns: timestamp_ns, last_seen_ns: timestamp_ns, packets: 1, state: FlowState::Active, touched: clock }
    }

    /// Adds a packet. A flow that would outgrow [`MAX_FLOW_DURATION_NS`] starts over from this packet.
    fn merge(&mut self, timestamp_ns: u64, clock: u64) {
        let first_seen_ns = self.first_seen_ns.min(timestamp_ns);
        let last_seen_ns = self.last_seen_ns.max(timestamp_ns);

        if last_seen_ns - first_seen_ns > MAX_FLOW_DURATION_NS {
            debug!("Flow open for {} s, starting a new one", (last_seen_ns - first_seen_ns) / 1_000_000_000);
            *self = FlowEntry::new(timestamp_ns, clock);
            return;
        }

        self.first_seen_ns = first_seen_ns;
        self.last_seen_ns = last_seen_ns;
        self.packets += 1;
        self.state = FlowState::Updated;
        self.touched = clock;
    }
}

/// (publisher, receiver, packet id) of a QoS 1 or 2 PUBLISH waiting for its acknowledgements.
type PendingKey = (SocketAddr, SocketAddr, u16);

#[derive(Debug, Default)]
struct TableState {
    flows: HashMap<RecordId, FlowEntry>,
    pending: HashMap<PendingKey, (RecordId, u64)>, // flow and table clock of the PUBLISH
    clock: u64,
}

impl TableState {
    /// The PUBLISH flow an acknowledgement belongs to, if that exchange is still pending.
    fn paired_flow(&mut self, record: &FlowRecord) -> Option<RecordId> {
        let FlowRecord::Mqtt(mqtt) = record;
        let control_type = mqtt.fixed_header.control_type;
        let packet_id = mqtt.variable_header.packet_id?;
        let l34 = &mqtt.layer3_and_4;

        let key = if control_type.is_publish_ack() {
            (l34.destination(), l34.source(), packet_id)
        } else if control_type == ControlType::Pubrel {
            (l34.source(), l34.destination(), packet_id)
        } else {
            return None;
        };

        let id = if control_type.completes_publish() { self.pending.remove(&key)?.0 } else { self.pending.get(&key)?.0.clone() };
        if self.flows.contains_key(&id) {
            Some(id)
        } else {
            None
        }
    }

    fn evict_oldest(&mut self) -> Option<RecordId> {
        let oldest = self.flows.iter().min_by_key(|(_, entry)| entry.touched).map(|(id, _)| id.clone())?;
        self.flows.remove(&oldest);
        self.pending.retain(|_, (id, _)| *id != oldest);
        Some(oldest)
    }

    /// Remembers a PUBLISH awaiting acknowledgement, forgetting the oldest
    /// exchange once `max_pending` are open.
    fn track_publish(&mut self, key: PendingKey, id: RecordId, max_pending: usize) {
        if !self.pending.contains_key(&key) && self.pending.len() >= max_pending {
            let oldest = self.pending.iter().min_by_key(|(_, (_, clock))| *clock).map(|(key, _)| *key);
            if let Some(oldest) = oldest {
                self.pending.remove(&oldest);
                debug!("Dropped unacknowledged publish {} -> {} id {}", oldest.0, oldest.1, oldest.2);
            }
        }
        self.pending.insert(key, (id, self.clock));
    }
}

fn pending_key(record: &FlowRecord) -> Option<PendingKey> {
    let FlowRecord::Mqtt(mqtt) = record;
    if mqtt.fixed_header.control_type != ControlType::Publish || mqtt.fixed_header.qos == 0 {
        return None;
    }
    let l34 = &mqtt.layer3_and_4;
    mqtt.variable_header.packet_id.map(|id| (l34.source(), l34.destination(), id))
}

/// Live flows by record id, bounded by a maximum number of entries.
pub struct FlowTable {
    builder: RecordBuilder,
    state: Mutex<TableState>,
    max_flows: Option<usize>,
    policy: OverflowPolicy,
    exporter: Arc<dyn FlowExporter>,
    stats: Arc<Stats>,
    benchmark: bool,
}

impl FlowTable {
    /// `max_flows` overrides the capacity the record variant asks for.
    pub fn new(builder: RecordBuilder, max_flows: Option<usize>, policy: OverflowPolicy, exporter: Arc<dyn FlowExporter>, stats: Arc<Stats>) -> Self {
        FlowTable { builder, state: Mutex::new(TableState::default()), max_flows, policy, exporter, stats, benchmark: false }
    }

    /// Logs the typed record of every exported flow and tracks export latency.
    pub fn with_benchmark(mut self, benchmark: bool) -> Self {
        self.benchmark = benchmark;
        self
    }

    pub fn builder(&self) -> &RecordBuilder {
        &self.builder
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).flows.contains_key(id)
    }

    /// Tracks client sessions, then processes the packet. Callers must
    /// follow capture order; see [`FlowTable::process_tracked`] otherwise.
    pub fn process_flow(&self, packet: &Packet) -> Option<ExportedFlow> {
        let clients = self.builder.track_sessions(packet);
        self.process_tracked(packet, clients)
    }

    /// Builds the record of one packet, admits it and exports its flow.
    /// `clients` come from [`RecordBuilder::track_sessions`] on the same packet.
    /// Returns the exported flow, or `None` when the packet was dropped.
    pub fn process_tracked(&self, packet: &Packet, clients: ClientIds) -> Option<ExportedFlow> {
        let start = Instant::now();

        let record = match self.builder.build(packet, clients) {
            Ok(record) => record,
            Err(RecordError::NotThisProtocol(_)) | Err(RecordError::Filtered(_)) => {
                self.stats.incr(Counter::Dropped);
                return None;
            }
            Err(e) => {
                warn!("Skipping packet ({}): {}", packet, e);
                self.stats.incr(Counter::Skipped);
                return None;
            }
        };

        let flow = match self.admit(record) {
            Ok(flow) => flow,
            Err(e) => {
                warn!("Flow not created: {}", e);
                self.stats.incr(Counter::Rejected);
                return None;
            }
        };
        debug!("{}", flow);

        match self.exporter.export(&flow) {
            Ok(()) => {
                self.stats.incr(Counter::Exported);
                if self.benchmark {
                    self.stats.record_latency(start.elapsed());
                    info!("Exported {}", flow.ipfix_representation().1);
                }
            }
            Err(e) => {
                error!("Failed to export {} flow: {}", flow.record.kind(), e);
                self.stats.incr(Counter::ExportErrors);
            }
        }

        Some(flow)
    }

    /// Inserts or merges the record under the table lock. Open QoS 1 and 2
    /// exchanges are bounded by the table capacity as well.
    pub fn admit(&self, record: FlowRecord) -> Result<ExportedFlow, TableError> {
        let max_flows = self.max_flows.unwrap_or_else(|| record.max_flows());
        let timestamp_ns = record.layer3_and_4().timestamp_ns;
        let publish = pending_key(&record);

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.clock += 1;
        let clock = state.clock;

        let record_id = match state.paired_flow(&record) {
            Some(id) => id,
            None => record.record_id(),
        };

        if !state.flows.contains_key(&record_id) && state.flows.len() >= max_flows {
            match self.policy {
                OverflowPolicy::Reject => return Err(TableError::CapacityExceeded { max_flows }),
                OverflowPolicy::EvictOldest => match state.evict_oldest() {
                    Some(evicted) => {
                        debug!("Evicted flow [{}]", evicted);
                        self.stats.incr(Counter::Evicted);
                    }
                    None => return Err(TableError::CapacityExceeded { max_flows }),
                },
            }
        }

        let entry = state.flows.entry(record_id.clone()).and_modify(|entry| entry.merge(timestamp_ns, clock)).or_insert_with(|| FlowEntry::new(timestamp_ns, clock));

        let flow = ExportedFlow {
            record,
            record_id: record_id.clone(),
            flow_start_ns: entry.first_seen_ns,
            flow_end_ns: entry.last_seen_ns,
            packets: entry.packets,
            state: entry.state,
        };

        if let Some(key) = publish {
            state.track_publish(key, record_id, max_flows);
        }

        Ok(flow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::testing::{self, BROKER};
    use crate::flow::Protocol;
    use pretty_assertions::assert_eq;
    use std::thread;

    #[derive(Default)]
    struct Recorder {
        flows: Mutex<Vec<ExportedFlow>>,
    }

    impl FlowExporter for Recorder {
        fn export(&self, flow: &ExportedFlow) -> Result<(), ExportError> {
            self.flows.lock().unwrap().push(flow.clone());
            Ok(())
        }
    }

    struct Failing;

    impl FlowExporter for Failing {
        fn export(&self, _flow: &ExportedFlow) -> Result<(), ExportError> {
            Err(ExportError::TemplateNotRegistered)
        }
    }

    fn table(max_flows: usize, policy: OverflowPolicy) -> (FlowTable, Arc<Recorder>, Arc<Stats>) {
        let recorder = Arc::new(Recorder::default());
        let stats = Arc::new(Stats::new());
        let table = FlowTable::new(RecordBuilder::new(Protocol::Mqtt, false), Some(max_flows), policy, recorder.clone(), stats.clone());
        (table, recorder, stats)
    }

    fn client(n: usize) -> String {
        format!("192.168.1.{}:5{:04}", n, n)
    }

    #[test]
    fn parse_policy() {
        assert_eq!("reject".parse::<OverflowPolicy>(), Ok(OverflowPolicy::Reject));
        assert_eq!("evict-oldest".parse::<OverflowPolicy>(), Ok(OverflowPolicy::EvictOldest));
        assert!("drop".parse::<OverflowPolicy>().is_err());
        assert_eq!(OverflowPolicy::default(), OverflowPolicy::EvictOldest);
    }

    #[test]
    fn connect_is_exported() {
        let (table, recorder, _) = table(16, OverflowPolicy::Reject);
        let packet = testing::connect(1_000, "192.168.1.10:51000", BROKER, "sensor-1");
        let flow = table.process_flow(&packet).unwrap();
        assert_eq!(flow.state, FlowState::Active);
        assert!(table.contains(&flow.record_id));

        let exported = recorder.flows.lock().unwrap();
        assert_eq!(exported.len(), 1);
        let (values, ipfix) = exported[0].ipfix_representation();
        assert_eq!(values["mqttControlType"], FieldValue::U16(1));
        assert_eq!(values["mqttSrcClientId"], FieldValue::Dyn(b"sensor-1".to_vec()));
        assert_eq!(ipfix.flow_duration_microseconds, Some(0));
    }

    #[test]
    fn publish_correlation_is_exported() {
        let (table, recorder, _) = table(16, OverflowPolicy::Reject);
        table.process_flow(&testing::publish(0, "192.168.1.10:51000", BROKER, "temp/room1", 1, 7, Some(b"20240101"))).unwrap();

        let (values, _) = recorder.flows.lock().unwrap()[0].ipfix_representation();
        assert_eq!(values["mqttCorrelationData"], FieldValue::Dyn(b"20240101".to_vec()));
    }

    #[test]
    fn other_protocols_are_ignored() {
        let (table, recorder, stats) = table(16, OverflowPolicy::Reject);
        assert!(table.process_flow(&testing::plain_tcp(0, "192.168.1.10:51000", BROKER)).is_none());
        assert!(table.is_empty());
        assert!(recorder.flows.lock().unwrap().is_empty());
        assert_eq!(stats.get(Counter::Dropped), 1);
    }

    #[test]
    fn merge_same_flow() {
        let (table, recorder, _) = table(16, OverflowPolicy::Reject);
        let src = "192.168.1.10:51000";
        table.process_flow(&testing::publish(1_000_000, src, BROKER, "temp/room1", 0, 0, None)).unwrap();
        let flow = table.process_flow(&testing::publish(5_000_000, src, BROKER, "temp/room1", 0, 0, None)).unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(flow.state, FlowState::Updated);
        assert_eq!(flow.packets, 2);
        assert_eq!((flow.flow_start_ns, flow.flow_end_ns), (1_000_000, 5_000_000));
        assert_eq!(flow.ipfix_representation().1.flow_duration_microseconds, Some(4_000));
        assert_eq!(recorder.flows.lock().unwrap().len(), 2);
    }

    #[test]
    fn reject_at_capacity() {
        let (table, recorder, stats) = table(2, OverflowPolicy::Reject);
        for n in 1..=2 {
            table.process_flow(&testing::publish(n as u64, &client(n), BROKER, "t", 0, 0, None)).unwrap();
        }

        // an existing flow still merges at the boundary
        assert!(table.process_flow(&testing::publish(10, &client(1), BROKER, "t", 0, 0, None)).is_some());
        assert!(table.process_flow(&testing::publish(11, &client(3), BROKER, "t", 0, 0, None)).is_none());

        assert_eq!(table.len(), 2);
        assert_eq!(stats.get(Counter::Rejected), 1);
        assert_eq!(recorder.flows.lock().unwrap().len(), 3);
    }

    #[test]
    fn evict_least_recently_seen() {
        let (table, _, stats) = table(2, OverflowPolicy::EvictOldest);
        let first = table.process_flow(&testing::publish(1, &client(1), BROKER, "t", 0, 0, None)).unwrap();
        let second = table.process_flow(&testing::publish(2, &client(2), BROKER, "t", 0, 0, None)).unwrap();
        table.process_flow(&testing::publish(3, &client(1), BROKER, "t", 0, 0, None)).unwrap();

        let third = table.process_flow(&testing::publish(4, &client(3), BROKER, "t", 0, 0, None)).unwrap();
        assert_eq!(table.len(), 2);
        assert!(table.contains(&first.record_id));
        assert!(!table.contains(&second.record_id));
        assert!(table.contains(&third.record_id));
        assert_eq!(stats.get(Counter::Evicted), 1);
    }

    #[test]
    fn empty_table_without_capacity() {
        for policy in [OverflowPolicy::Reject, OverflowPolicy::EvictOldest] {
            let (table, recorder, stats) = table(0, policy);
            assert!(table.process_flow(&testing::publish(1, &client(1), BROKER, "t", 0, 0, None)).is_none());
            assert!(table.is_empty());
            assert!(recorder.flows.lock().unwrap().is_empty());
            assert_eq!(stats.get(Counter::Rejected), 1);
            assert_eq!(stats.get(Counter::Evicted), 0);
        }
    }

    #[test]
    fn long_flow_starts_over() {
        let (table, recorder, _) = table(16, OverflowPolicy::Reject);
        let src = "192.168.1.10:51000";
        let minute = 60 * 1_000_000_000;

        let mut last = None;
        for n in 0..81 {
            last = table.process_flow(&testing::publish(n * minute, src, BROKER, "temp/room1", 0, 0, None));
        }

        let exported = recorder.flows.lock().unwrap();
        assert_eq!(exported.len(), 81);
        for flow in exported.iter() {
            let duration = flow.ipfix_representation().1.flow_duration_microseconds.unwrap();
            assert!(duration <= u32::MAX as u64);
        }

        // 4294.97 s fit in a flow: minutes 0 to 71, then 72 to 80
        let last = last.unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(last.packets, 9);
        assert_eq!((last.flow_start_ns, last.flow_end_ns), (72 * minute, 80 * minute));
        assert_eq!(exported[72].state, FlowState::Active);
        assert_eq!(exported[72].packets, 1);
        assert_eq!(exported[71].packets, 72);
    }

    #[test]
    fn unacknowledged_publishes_are_bounded() {
        let (table, _, _) = table(2, OverflowPolicy::EvictOldest);

        // one flow, reconnecting from new ports, never acknowledged
        for port in 0..50u16 {
            let src = format!("192.168.1.10:{}", 50_000 + port);
            for id in 1..=100 {
                table.process_flow(&testing::publish(port as u64, &src, BROKER, "temp/room1", 1, id, None)).unwrap();
            }
        }
        assert_eq!(table.len(), 1);
        assert_eq!(table.state.lock().unwrap().pending.len(), 2);

        // the latest exchange is still paired, an old one is not
        let publish = table.process_flow(&testing::publish(100, "192.168.1.10:50049", BROKER, "temp/room1", 1, 100, None)).unwrap();
        let latest = table.process_flow(&testing::ack(101, BROKER, "192.168.1.10:50049", 4, 100)).unwrap();
        assert_eq!(latest.record_id, publish.record_id);
        let forgotten = table.process_flow(&testing::ack(102, BROKER, "192.168.1.10:50000", 4, 1)).unwrap();
        assert_ne!(forgotten.record_id, publish.record_id);
    }

    #[test]
    fn pair_acknowledgements_with_publish() {
        let (table, _, _) = table(16, OverflowPolicy::Reject);
        let sensor = "192.168.1.10:51000";

        let publish = table.process_flow(&testing::publish(1_000, sensor, BROKER, "temp/room1", 2, 9, None)).unwrap();
        let pubrec = table.process_flow(&testing::ack(2_000, BROKER, sensor, 5, 9)).unwrap();
        let pubrel = table.process_flow(&testing::ack(3_000, sensor, BROKER, 6, 9)).unwrap();
        let pubcomp = table.process_flow(&testing::ack(4_000, BROKER, sensor, 7, 9)).unwrap();

        for flow in [&pubrec, &pubrel, &pubcomp] {
            assert_eq!(flow.record_id, publish.record_id);
            assert_eq!(flow.state, FlowState::Updated);
        }
        assert_eq!(pubcomp.packets, 4);
        assert_eq!((pubcomp.flow_start_ns, pubcomp.flow_end_ns), (1_000, 4_000));
        assert_eq!(table.len(), 1);

        // the exchange is closed, a late duplicate opens its own flow
        let late = table.process_flow(&testing::ack(5_000, BROKER, sensor, 7, 9)).unwrap();
        assert_ne!(late.record_id, publish.record_id);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn unrelated_ack_is_its_own_flow() {
        let (table, _, _) = table(16, OverflowPolicy::Reject);
        let sensor = "192.168.1.10:51000";
        let publish = table.process_flow(&testing::publish(1_000, sensor, BROKER, "temp/room1", 1, 3, None)).unwrap();

        // wrong direction and wrong packet id
        let same_direction = table.process_flow(&testing::ack(2_000, sensor, BROKER, 4, 3)).unwrap();
        let other_id = table.process_flow(&testing::ack(2_000, BROKER, sensor, 4, 4)).unwrap();
        assert_ne!(same_direction.record_id, publish.record_id);
        assert_ne!(other_id.record_id, publish.record_id);

        let puback = table.process_flow(&testing::ack(3_000, BROKER, sensor, 4, 3)).unwrap();
        assert_eq!(puback.record_id, publish.record_id);
    }

    #[test]
    fn export_failure_keeps_flow() {
        let stats = Arc::new(Stats::new());
        let table = FlowTable::new(RecordBuilder::new(Protocol::Mqtt, false), None, OverflowPolicy::Reject, Arc::new(Failing), stats.clone());

        assert!(table.process_flow(&testing::publish(0, "192.168.1.10:51000", BROKER, "t", 0, 0, None)).is_some());
        assert_eq!(table.len(), 1);
        assert_eq!(stats.get(Counter::ExportErrors), 1);
        assert_eq!(stats.get(Counter::Exported), 0);
    }

    #[test]
    fn concurrent_publishers() {
        let (table, recorder, _) = table(1024, OverflowPolicy::Reject);
        let table = Arc::new(table);

        let handles: Vec<_> = (1..=8)
            .map(|n| {
                let table = table.clone();
                thread::spawn(move || {
                    for i in 0..50u64 {
                        let topic = format!("sensors/{}", n);
                        table.process_flow(&testing::publish(i, &client(n), BROKER, &topic, 0, 0, None)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(table.len(), 8);
        let exported = recorder.flows.lock().unwrap();
        assert_eq!(exported.len(), 400);
        assert_eq!(exported.iter().filter(|flow| flow.packets == 50).count(), 8);
    }
}
