//! A single-threaded server running one stage of the chain on one node. It serves one payload at
//! a time, queues the rest in FIFO order and forwards every served payload unchanged, either to
//! the next stage or, at the end of the chain, to the actuator named in the payload.

use crate::config::Config;
use crate::orchestrator::{StageId, StageInstance};
use crate::payload::Request;
use crate::random::RandomStream;
use crate::simulator::*;
use crate::tracer::{DropReason, TraceElem, Tracer};
use crate::transport::{segment, ConnectionCache, Reassembler};
use crate::tree::NodeId;

use failure::Error;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::rc::Rc;

const EVENT_START: u64 = 0;
const EVENT_STOP: u64 = 1;
/// Completion events carry tokens from here on
const FIRST_TOKEN: u64 = 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServerState {
    Idle,
    Busy,
}

/// A payload waiting for (or in) service, with the connection it came in on
#[derive(Debug)]
struct Job {
    payload: Vec<u8>,
    conn: ConnId,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ServerCounters {
    pub bytes_received: u64,
    pub jobs_served: u64,
    pub jobs_dropped: u64,
}

pub struct QueueingServer<'a> {
    /// Forwarding table and service time; never changes once built
    instance: StageInstance,
    /// Where packets are sent
    network: NetObjId,
    service: RandomStream,
    state: ServerState,
    backlog: VecDeque<Job>,
    in_service: Option<Job>,
    /// Token of the one completion that is allowed to fire. Anything else is stale
    pending: Option<u64>,
    next_token: u64,
    inbound: Reassembler,
    outbound: ConnectionCache,
    /// Accepts work in [start, stop)
    start: Time,
    stop: Time,
    running: bool,
    counters: ServerCounters,
    tracer: &'a Tracer<'a>,
    config: &'a Config,
}

impl<'a> QueueingServer<'a> {
    /// `local` is the address outbound connections originate from and `service` samples service
    /// times in microseconds
    pub fn new(
        instance: StageInstance,
        local: Addr,
        network: NetObjId,
        service: RandomStream,
        tracer: &'a Tracer<'a>,
        config: &'a Config,
    ) -> Self {
        Self {
            instance,
            network,
            service,
            state: ServerState::Idle,
            backlog: VecDeque::new(),
            in_service: None,
            pending: None,
            next_token: FIRST_TOKEN,
            inbound: Reassembler::new(config.pkt_size),
            outbound: ConnectionCache::new(local),
            start: config.chain.start,
            stop: config.chain.stop,
            running: false,
            counters: Default::default(),
            tracer,
            config,
        }
    }

    #[allow(dead_code)]
    pub fn stage(&self) -> StageId {
        self.instance.stage
    }

    #[allow(dead_code)]
    pub fn node(&self) -> NodeId {
        self.instance.node
    }

    #[allow(dead_code)]
    pub fn state(&self) -> ServerState {
        self.state
    }

    #[allow(dead_code)]
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    #[allow(dead_code)]
    pub fn counters(&self) -> ServerCounters {
        self.counters
    }

    fn drop_job(&mut self, obj_id: NetObjId, now: Time, reason: DropReason) {
        self.counters.jobs_dropped += 1;
        self.tracer.log(obj_id, now, TraceElem::Dropped(reason));
    }

    /// A full payload arrived
    fn arrival(&mut self, obj_id: NetObjId, now: Time, job: Job) -> Vec<(Time, NetObjId, Action)> {
        if self.state == ServerState::Idle {
            assert!(self.backlog.is_empty());
            vec![self.start_service(obj_id, now, job)]
        } else {
            debug!(
                "{} stage {} on node {} busy, queueing payload from {}",
                now, self.instance.stage, self.instance.node, job.conn.src
            );
            self.backlog.push_back(job);
            self.tracer
                .log(obj_id, now, TraceElem::QueueDepth(self.backlog.len()));
            Vec::new()
        }
    }

    /// Take `job` into service and schedule its completion
    fn start_service(&mut self, obj_id: NetObjId, now: Time, job: Job) -> (Time, NetObjId, Action) {
        assert!(self.in_service.is_none() && self.pending.is_none());
        let duration = Time::from_micros_f64(self.service.sample());
        let token = self.next_token;
        self.next_token += 1;
        self.pending = Some(token);
        self.in_service = Some(job);
        self.state = ServerState::Busy;
        self.tracer.log(obj_id, now, TraceElem::ServiceTime(duration));
        (now + duration, obj_id, Action::Event(token))
    }

    /// The job in service is done: send it on and pick up the next one
    fn complete(&mut self, obj_id: NetObjId, now: Time) -> Vec<(Time, NetObjId, Action)> {
        self.pending = None;
        let job = self
            .in_service
            .take()
            .expect("a pending completion always has a job in service");
        self.counters.jobs_served += 1;
        let mut res = self.forward(obj_id, now, job.payload);

        if let Some(job) = self.backlog.pop_front() {
            self.tracer
                .log(obj_id, now, TraceElem::QueueDepth(self.backlog.len()));
            res.push(self.start_service(obj_id, now, job));
        } else {
            self.state = ServerState::Idle;
        }
        res
    }

    /// Send a served payload to the next stage if we have an entry for its source, else to its
    /// actuator
    fn forward(
        &mut self,
        obj_id: NetObjId,
        now: Time,
        payload: Vec<u8>,
    ) -> Vec<(Time, NetObjId, Action)> {
        let req = match Request::decode(&payload) {
            Ok(req) => req,
            Err(e) => {
                warn!(
                    "Stage {} on node {} cannot decode a payload: {}",
                    self.instance.stage, self.instance.node, e
                );
                self.drop_job(obj_id, now, DropReason::Malformed);
                return Vec::new();
            }
        };
        let dest = match self.instance.forwarding.lookup(&req.node_id) {
            Some(next_hop) => next_hop,
            None => {
                if !self.instance.is_terminal() {
                    warn!(
                        "Stage {} on node {} has no forwarding entry for {}, responding directly",
                        self.instance.stage, self.instance.node, req.node_id
                    );
                }
                req.actuator_id
            }
        };

        let conn = match self.outbound.connect(dest) {
            Some(conn) => conn,
            None => {
                debug!("Connection to {} failed earlier, dropping request {}", dest, req.seq);
                self.drop_job(obj_id, now, DropReason::ConnectionFailed);
                return Vec::new();
            }
        };
        debug!(
            "{} stage {} on node {} sends request {} of {} to {}",
            now, self.instance.stage, self.instance.node, req.seq, req.node_id, dest
        );
        self.tracer.log(
            obj_id,
            now,
            TraceElem::ServerTx {
                to: dest,
                size: payload.len() as u64,
            },
        );
        segment(conn.src, conn.dest, now, &payload, self.config.mss)
            .into_iter()
            .map(|pkt| (now, self.network, Action::Push(Rc::new(pkt))))
            .collect()
    }

    /// Tear down: cancel the pending completion and discard everything queued
    fn shutdown(&mut self, obj_id: NetObjId, now: Time) {
        self.running = false;
        self.pending = None;
        let mut dropped = self.backlog.len();
        self.backlog.clear();
        if self.in_service.take().is_some() {
            dropped += 1;
        }
        for _ in 0..dropped {
            self.drop_job(obj_id, now, DropReason::Teardown);
        }
        self.inbound.clear();
        self.state = ServerState::Idle;
        info!(
            "{} stage {} on node {} stopped: {} bytes received, {} jobs served, {} jobs dropped \
             ({} at teardown), {} outbound connections",
            now,
            self.instance.stage,
            self.instance.node,
            self.counters.bytes_received,
            self.counters.jobs_served,
            self.counters.jobs_dropped,
            dropped,
            self.outbound.len()
        );
    }
}

impl<'a> NetObj for QueueingServer<'a> {
    fn init(
        &mut self,
        obj_id: NetObjId,
        now: Time,
    ) -> Result<Vec<(Time, NetObjId, Action)>, Error> {
        let start = self.start.max(now);
        Ok(vec![
            (start, obj_id, Action::Event(EVENT_START)),
            (self.stop.max(start), obj_id, Action::Event(EVENT_STOP)),
        ])
    }

    fn push(
        &mut self,
        obj_id: NetObjId,
        _from: NetObjId,
        now: Time,
        pkt: Rc<Packet>,
    ) -> Result<Vec<(Time, NetObjId, Action)>, Error> {
        let bytes = match &pkt.ptype {
            PacketType::Data(bytes) => bytes,
            PacketType::Refused => {
                warn!(
                    "Stage {} on node {} could not connect to {}",
                    self.instance.stage, self.instance.node, pkt.src
                );
                self.outbound.mark_failed(pkt.src);
                return Ok(Vec::new());
            }
        };
        assert_eq!(pkt.dest.addr.node, self.instance.node);

        let conn = pkt.conn();
        let mut res = Vec::new();
        for payload in self.inbound.push(conn, bytes) {
            if !self.running {
                debug!(
                    "{} stage {} not running, dropping payload from {}",
                    now, self.instance.stage, conn.src
                );
                self.drop_job(obj_id, now, DropReason::Inactive);
                continue;
            }
            self.counters.bytes_received += payload.len() as u64;
            self.tracer.log(
                obj_id,
                now,
                TraceElem::ServerRx {
                    from: conn.src,
                    size: payload.len() as u64,
                },
            );
            res.append(&mut self.arrival(obj_id, now, Job { payload, conn }));
        }
        Ok(res)
    }

    fn event(
        &mut self,
        obj_id: NetObjId,
        from: NetObjId,
        now: Time,
        uid: u64,
    ) -> Result<Vec<(Time, NetObjId, Action)>, Error> {
        assert_eq!(obj_id, from);
        match uid {
            EVENT_START => {
                if now < self.stop {
                    self.running = true;
                    info!(
                        "{} stage {} on node {} (tier {}) listening on port {}, {} routes",
                        now,
                        self.instance.stage,
                        self.instance.node,
                        self.instance.tier,
                        self.instance.port,
                        self.instance.forwarding.len()
                    );
                }
                Ok(Vec::new())
            }
            EVENT_STOP => {
                self.shutdown(obj_id, now);
                Ok(Vec::new())
            }
            token if Some(token) == self.pending => Ok(self.complete(obj_id, now)),
            token => {
                debug!("{} ignoring cancelled completion {}", now, token);
                Ok(Vec::new())
            }
        }
    }
}
