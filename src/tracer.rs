//! Collect observability records from the simulated objects and summarize them at the end of the
//! run

use crate::config::{Config, LogType};
use crate::simulator::*;

use fnv::FnvHashMap;
use histogram::Histogram;
use log::{trace, warn};
use serde::Serialize;

use std::cell::RefCell;

/// One 'row' of a trace. Multiple objects can log simultaneously: the tracer uses interior
/// mutability to enable this
#[derive(Clone, Debug)]
pub enum TraceElem {
    /// A client issued request number `seq` of `size` bytes
    ClientTx { seq: u64, size: u64 },
    /// A server reassembled a full payload sent by `from`
    ServerRx { from: Endpoint, size: u64 },
    /// A server sent a payload onward to `to`
    ServerTx { to: Endpoint, size: u64 },
    /// A server sampled this service time for a job
    ServiceTime(Time),
    /// Backlog length of a server after it changed
    QueueDepth(usize),
    /// A receiver got the response to request `seq`
    Response { seq: u64, latency: Time },
    /// A payload was discarded
    Dropped(DropReason),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum DropReason {
    /// The server was not running when the payload arrived
    Inactive,
    /// The server was torn down with this job in its backlog
    Teardown,
    /// The payload could not be decoded
    Malformed,
    /// The outbound connection was refused earlier
    ConnectionFailed,
}

/// Counters kept for every object. These are always collected, independent of `LogType`
#[derive(Clone, Debug, Default, Serialize)]
pub struct ObjStats {
    pub requests_sent: u64,
    pub payloads_received: u64,
    pub payloads_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub responses: u64,
    pub dropped: u64,
    pub max_queue_depth: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct ObjSummary {
    pub id: NetObjId,
    pub label: String,
    #[serde(flatten)]
    pub stats: ObjStats,
}

/// Summary of a distribution, in microseconds
#[derive(Clone, Debug, Serialize)]
pub struct DistSummary {
    pub count: u64,
    pub mean: u64,
    pub min: u64,
    pub p50: u64,
    pub p99: u64,
    pub max: u64,
}

impl DistSummary {
    fn from_histogram(hist: &Histogram) -> Option<Self> {
        if hist.entries() == 0 {
            return None;
        }
        Some(Self {
            count: hist.entries(),
            mean: hist.mean().ok()?,
            min: hist.minimum().ok()?,
            p50: hist.percentile(50.).ok()?,
            p99: hist.percentile(99.).ok()?,
            max: hist.maximum().ok()?,
        })
    }
}

/// What the run produced
#[derive(Clone, Debug, Serialize)]
pub struct Summary {
    pub end_time: Time,
    pub requests_sent: u64,
    pub responses: u64,
    pub dropped: u64,
    pub latency: Option<DistSummary>,
    pub service_time: Option<DistSummary>,
    pub objects: Vec<ObjSummary>,
}

pub struct Tracer<'c> {
    config: &'c Config,
    /// Human readable names of the objects
    labels: RefCell<FnvHashMap<NetObjId, String>>,
    stats: RefCell<FnvHashMap<NetObjId, ObjStats>>,
    latency: RefCell<Histogram>,
    service_time: RefCell<Histogram>,
}

impl<'c> Tracer<'c> {
    pub fn new(config: &'c Config) -> Self {
        Self {
            config,
            labels: Default::default(),
            stats: Default::default(),
            latency: RefCell::new(Histogram::new()),
            service_time: RefCell::new(Histogram::new()),
        }
    }

    pub fn set_label(&self, obj: NetObjId, label: String) {
        self.labels.borrow_mut().insert(obj, label);
    }

    fn label(&self, obj: NetObjId) -> String {
        self.labels
            .borrow()
            .get(&obj)
            .cloned()
            .unwrap_or_else(|| format!("obj{}", obj))
    }

    /// Log this record. What happens to it depends on the `LogType` configured for its kind
    pub fn log(&self, from: NetObjId, now: Time, elem: TraceElem) {
        let log_type = self.log_type(&elem);
        if log_type.trace() {
            trace!("{} {} {:?}", now, self.label(from), elem);
        }

        let mut stats = self.stats.borrow_mut();
        let stats = stats.entry(from).or_insert_with(Default::default);
        match elem {
            TraceElem::ClientTx { size, .. } => {
                stats.requests_sent += 1;
                stats.bytes_sent += size;
            }
            TraceElem::ServerRx { size, .. } => {
                stats.payloads_received += 1;
                stats.bytes_received += size;
            }
            TraceElem::ServerTx { size, .. } => {
                stats.payloads_sent += 1;
                stats.bytes_sent += size;
            }
            TraceElem::ServiceTime(t) => {
                if log_type.summarize() {
                    record(&self.service_time, t, "service time");
                }
            }
            TraceElem::QueueDepth(depth) => {
                if log_type.summarize() {
                    stats.max_queue_depth = stats.max_queue_depth.max(depth);
                }
            }
            TraceElem::Response { latency, .. } => {
                stats.responses += 1;
                if log_type.summarize() {
                    record(&self.latency, latency, "latency");
                }
            }
            TraceElem::Dropped(_) => stats.dropped += 1,
        }
    }

    fn log_type(&self, elem: &TraceElem) -> LogType {
        let log = &self.config.log;
        match elem {
            TraceElem::ClientTx { .. }
            | TraceElem::ServerRx { .. }
            | TraceElem::ServerTx { .. }
            | TraceElem::Dropped(_) => log.hops,
            TraceElem::ServiceTime(_) => log.service_time,
            TraceElem::QueueDepth(_) => log.queue_depth,
            TraceElem::Response { .. } => log.latency,
        }
    }

    /// Counters of one object so far
    #[allow(dead_code)]
    pub fn stats(&self, obj: NetObjId) -> ObjStats {
        self.stats.borrow().get(&obj).cloned().unwrap_or_default()
    }

    /// Should be called at end of simulation to produce the summary
    pub fn finalize(&self, end_time: Time) -> Summary {
        let stats = self.stats.borrow();
        let mut objects: Vec<ObjSummary> = stats
            .iter()
            .map(|(&id, stats)| ObjSummary {
                id,
                label: self.label(id),
                stats: stats.clone(),
            })
            .collect();
        objects.sort_by_key(|o| o.id);

        Summary {
            end_time,
            requests_sent: objects.iter().map(|o| o.stats.requests_sent).sum(),
            responses: objects.iter().map(|o| o.stats.responses).sum(),
            dropped: objects.iter().map(|o| o.stats.dropped).sum(),
            latency: DistSummary::from_histogram(&self.latency.borrow()),
            service_time: DistSummary::from_histogram(&self.service_time.borrow()),
            objects,
        }
    }
}

fn record(hist: &RefCell<Histogram>, value: Time, what: &str) {
    if let Err(e) = hist.borrow_mut().increment(value.micros()) {
        warn!("Could not record {} of {}: {}", what, value, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    #[test]
    fn counters_are_always_kept() {
        let mut config = config::example();
        config.log.latency = LogType::Ignore;
        let tracer = Tracer::new(&config);
        tracer.log(3, Time::ZERO, TraceElem::ClientTx { seq: 0, size: 100 });
        tracer.log(3, Time::ZERO, TraceElem::ClientTx { seq: 1, size: 100 });
        tracer.log(
            4,
            Time::from_millis(5),
            TraceElem::Response {
                seq: 0,
                latency: Time::from_millis(5),
            },
        );
        tracer.log(5, Time::ZERO, TraceElem::Dropped(DropReason::Teardown));

        assert_eq!(tracer.stats(3).bytes_sent, 200);
        let summary = tracer.finalize(Time::from_secs(1));
        assert_eq!(summary.requests_sent, 2);
        assert_eq!(summary.responses, 1);
        assert_eq!(summary.dropped, 1);
        // Latency is ignored, so it is not aggregated
        assert!(summary.latency.is_none());
        assert_eq!(summary.objects.len(), 3);
        assert_eq!(summary.objects[0].label, "obj3");
    }

    #[test]
    fn distributions_and_queue_depth() {
        let config = config::example();
        let tracer = Tracer::new(&config);
        tracer.set_label(1, "server".to_string());
        for t in &[100, 200, 300] {
            tracer.log(1, Time::ZERO, TraceElem::ServiceTime(Time::from_micros(*t)));
        }
        tracer.log(1, Time::ZERO, TraceElem::QueueDepth(4));
        tracer.log(1, Time::ZERO, TraceElem::QueueDepth(2));

        let summary = tracer.finalize(Time::ZERO);
        let service = summary.service_time.as_ref().unwrap();
        assert_eq!(service.count, 3);
        assert_eq!(service.min, 100);
        assert_eq!(service.max, 300);
        assert_eq!(summary.objects[0].label, "server");
        assert_eq!(summary.objects[0].stats.max_queue_depth, 4);
        // The summary is what main prints
        assert!(serde_json::to_string(&summary).is_ok());
    }
}
