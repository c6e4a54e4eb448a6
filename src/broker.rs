//! The metric-delivery transport boundary. The transport itself (AMQP, a
//! Unix socket bridge, whatever a deployment wires up) is an external
//! collaborator; this module only defines the trait it must satisfy and the
//! wire formats it carries, plus an in-memory adapter used by tests.

use serde::Deserialize;

use crate::error::ProtocolError;
use crate::metrics::MetricSample;
use crate::workload::WorkloadKind;

/// One event off the broker: either a new workload announcing itself, or a
/// metric sample for a workload that already has.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// Raw body of a creation-channel message, not yet parsed.
    Creation(String),
    /// `channel` is the per-workload queue name (`"<name>(<pid>)"`);
    /// `payload` is the raw JSON body, not yet parsed.
    Metric { channel: String, payload: String },
}

/// What the polling thread needs from a transport: a single blocking
/// receive that interleaves creation and metric events. `None` signals the
/// transport is closed — the polling thread exits cleanly.
pub trait MetricBroker: Send {
    fn recv(&self) -> Option<BrokerEvent>;
}

/// A parsed creation-channel message.
#[derive(Debug, Clone)]
pub struct Creation {
    pub identifier: String,
    pub kind: WorkloadKind,
    pub pid: i32,
    pub perf_pid: i32,
    pub interval_ms: u64,
}

/// Parse `"<wl_identifier>,<kind>,<pid>,<perf_pid>,<interval_ms>"`.
pub fn parse_creation(msg: &str) -> Result<Creation, ProtocolError> {
    let fields: Vec<&str> = msg.trim().split(',').collect();
    if fields.len() != 5 {
        return Err(ProtocolError::MalformedCreation(fields.len()));
    }

    let identifier = fields[0].to_string();
    if identifier.is_empty() || !identifier.contains('_') {
        return Err(ProtocolError::MalformedIdentifier(identifier));
    }

    let kind = match fields[1] {
        "fg" => WorkloadKind::Foreground,
        "bg" => WorkloadKind::Background,
        other => return Err(ProtocolError::UnknownKind(other.to_string())),
    };

    let pid: i32 = fields[2]
        .parse()
        .map_err(|_| ProtocolError::NonIntegerField(fields[2].to_string()))?;
    let perf_pid: i32 = fields[3]
        .parse()
        .map_err(|_| ProtocolError::NonIntegerField(fields[3].to_string()))?;
    let interval_ms: u64 = fields[4]
        .parse()
        .map_err(|_| ProtocolError::NonIntegerField(fields[4].to_string()))?;

    Ok(Creation {
        identifier,
        kind,
        pid,
        perf_pid,
        interval_ms,
    })
}

/// The JSON schema as it appears on the wire, field names verbatim.
#[derive(Debug, Deserialize)]
struct WireMetricSample {
    l2miss: u64,
    l3miss: u64,
    instructions: u64,
    cycles: u64,
    stall_cycles: u64,
    wall_cycles: u64,
    intra_coh: u64,
    inter_coh: u64,
    llc_size: u64,
    local_mem: u64,
    remote_mem: u64,
}

/// Parse one per-workload JSON metric payload. `interval_ms` comes from the
/// workload's own creation record, not the wire body.
pub fn parse_metric_sample(json: &str, interval_ms: u64) -> Result<MetricSample, ProtocolError> {
    let wire: WireMetricSample = serde_json::from_str(json)?;
    Ok(MetricSample {
        l2_miss: wire.l2miss,
        l3_miss: wire.l3miss,
        instructions: wire.instructions,
        cycles: wire.cycles,
        stall_cycles: wire.stall_cycles,
        wall_cycles: wire.wall_cycles,
        intra_coh: wire.intra_coh,
        inter_coh: wire.inter_coh,
        llc_occupancy: wire.llc_size,
        local_mem_bytes: wire.local_mem,
        remote_mem_bytes: wire.remote_mem,
        interval_ms,
    })
}

/// In-memory, channel-backed [`MetricBroker`]: a reference adapter and the
/// one the test suite drives directly, in place of a real AMQP/socket
/// transport.
pub struct ChannelBroker {
    creation_rx: crossbeam_channel::Receiver<String>,
    metric_rx: crossbeam_channel::Receiver<(String, String)>,
}

/// The producer side: held by whatever feeds the broker (a test, or a real
/// transport's receive loop translating wire events into these calls).
#[derive(Clone)]
pub struct ChannelBrokerHandle {
    creation_tx: crossbeam_channel::Sender<String>,
    metric_tx: crossbeam_channel::Sender<(String, String)>,
}

impl ChannelBrokerHandle {
    pub fn send_creation(&self, msg: impl Into<String>) {
        let _ = self.creation_tx.send(msg.into());
    }

    pub fn send_metric(&self, channel: impl Into<String>, payload: impl Into<String>) {
        let _ = self.metric_tx.send((channel.into(), payload.into()));
    }
}

impl ChannelBroker {
    pub fn new() -> (ChannelBroker, ChannelBrokerHandle) {
        let (creation_tx, creation_rx) = crossbeam_channel::unbounded();
        let (metric_tx, metric_rx) = crossbeam_channel::unbounded();
        (
            ChannelBroker { creation_rx, metric_rx },
            ChannelBrokerHandle { creation_tx, metric_tx },
        )
    }
}

impl Default for ChannelBroker {
    fn default() -> Self {
        Self::new().0
    }
}

impl MetricBroker for ChannelBroker {
    fn recv(&self) -> Option<BrokerEvent> {
        let mut sel = crossbeam_channel::Select::new();
        let creation_idx = sel.recv(&self.creation_rx);
        let metric_idx = sel.recv(&self.metric_rx);
        let oper = sel.select();
        match oper.index() {
            i if i == creation_idx => oper.recv(&self.creation_rx).ok().map(BrokerEvent::Creation),
            i if i == metric_idx => oper
                .recv(&self.metric_rx)
                .ok()
                .map(|(channel, payload)| BrokerEvent::Metric { channel, payload }),
            _ => unreachable!("select only ever registers these two operations"),
        }
    }
}
