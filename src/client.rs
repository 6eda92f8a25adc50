//! Traffic on the leaves: a client that sends requests into the chain after random think times,
//! and a receiver that collects the responses

use crate::config::Config;
use crate::payload::Request;
use crate::random::RandomStream;
use crate::simulator::*;
use crate::tracer::{DropReason, TraceElem, Tracer};
use crate::transport::{segment, ConnectionCache, Reassembler};
use crate::tree::NodeId;

use failure::Error;
use log::{debug, info, warn};
use std::rc::Rc;

const EVENT_START: u64 = 0;
const EVENT_SEND: u64 = 1;

/// Sends one request to the entry of the chain, waits an off time, and repeats
pub struct Client<'a> {
    /// Source identity put into every request
    local: Addr,
    /// Entry stage instance serving this leaf
    remote: Endpoint,
    /// Where responses should go
    actuator: Endpoint,
    network: NetObjId,
    off_time: RandomStream,
    conns: ConnectionCache,
    start: Time,
    stop: Time,
    /// Stop once this many bytes were sent. No limit if `None`
    max_bytes: Option<u64>,
    bytes_sent: u64,
    next_seq: u64,
    tracer: &'a Tracer<'a>,
    config: &'a Config,
}

impl<'a> Client<'a> {
    pub fn new(
        local: Addr,
        remote: Endpoint,
        network: NetObjId,
        off_time: RandomStream,
        tracer: &'a Tracer<'a>,
        config: &'a Config,
    ) -> Self {
        Self {
            local,
            remote,
            actuator: Endpoint::new(local, config.sink_port),
            network,
            off_time,
            conns: ConnectionCache::new(local),
            start: config.client.start,
            stop: config.client.stop,
            max_bytes: config.client.max_bytes,
            bytes_sent: 0,
            next_seq: 0,
            tracer,
            config,
        }
    }

    #[allow(dead_code)]
    pub fn requests_sent(&self) -> u64 {
        self.next_seq
    }

    fn budget_left(&self) -> bool {
        match self.max_bytes {
            Some(max) => self.bytes_sent + self.config.pkt_size <= max,
            None => true,
        }
    }

    /// Schedule the next send after an off time, if it still falls before `stop`
    fn schedule_send(&mut self, obj_id: NetObjId, now: Time) -> Vec<(Time, NetObjId, Action)> {
        // At least a microsecond, so that time moves on
        let off = Time::from_micros_f64(self.off_time.sample()).max(Time::from_micros(1));
        let when = now + off;
        if when < self.stop && self.budget_left() {
            vec![(when, obj_id, Action::Event(EVENT_SEND))]
        } else {
            Vec::new()
        }
    }

    fn send(
        &mut self,
        obj_id: NetObjId,
        now: Time,
    ) -> Result<Vec<(Time, NetObjId, Action)>, Error> {
        let conn = match self.conns.connect(self.remote) {
            Some(conn) => conn,
            None => {
                debug!("{} client on {} gives up, {} refused", now, self.local, self.remote);
                return Ok(Vec::new());
            }
        };
        let req = Request {
            node_id: self.local,
            actuator_id: self.actuator,
            sent_at: now,
            seq: self.next_seq,
        };
        let payload = req.encode(self.config.pkt_size)?;
        self.next_seq += 1;
        self.bytes_sent += payload.len() as u64;
        self.tracer.log(
            obj_id,
            now,
            TraceElem::ClientTx {
                seq: req.seq,
                size: payload.len() as u64,
            },
        );

        let network = self.network;
        let mut res: Vec<_> = segment(conn.src, conn.dest, now, &payload, self.config.mss)
            .into_iter()
            .map(|pkt| (now, network, Action::Push(Rc::new(pkt))))
            .collect();
        res.append(&mut self.schedule_send(obj_id, now));
        Ok(res)
    }
}

impl<'a> NetObj for Client<'a> {
    fn init(
        &mut self,
        obj_id: NetObjId,
        now: Time,
    ) -> Result<Vec<(Time, NetObjId, Action)>, Error> {
        Ok(vec![(self.start.max(now), obj_id, Action::Event(EVENT_START))])
    }

    fn push(
        &mut self,
        _obj_id: NetObjId,
        _from: NetObjId,
        now: Time,
        pkt: Rc<Packet>,
    ) -> Result<Vec<(Time, NetObjId, Action)>, Error> {
        match pkt.ptype {
            PacketType::Refused => {
                warn!("{} client on {} could not connect to {}", now, self.local, pkt.src);
                self.conns.mark_failed(pkt.src);
            }
            PacketType::Data(_) => {
                debug!("{} client on {} ignores data from {}", now, self.local, pkt.src)
            }
        }
        Ok(Vec::new())
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
                if now >= self.stop {
                    return Ok(Vec::new());
                }
                self.conns.connect(self.remote);
                info!("{} client on {} sending to {}", now, self.local, self.remote);
                Ok(self.schedule_send(obj_id, now))
            }
            EVENT_SEND => {
                if now >= self.stop || !self.budget_left() {
                    return Ok(Vec::new());
                }
                self.send(obj_id, now)
            }
            _ => unreachable!(),
        }
    }
}

/// Listens on the sink port of a leaf and records when responses come back
pub struct Receiver<'a> {
    node: NodeId,
    inbound: Reassembler,
    received: u64,
    tracer: &'a Tracer<'a>,
}

impl<'a> Receiver<'a> {
    pub fn new(node: NodeId, tracer: &'a Tracer<'a>, config: &'a Config) -> Self {
        Self {
            node,
            inbound: Reassembler::new(config.pkt_size),
            received: 0,
            tracer,
        }
    }

    #[allow(dead_code)]
    pub fn received(&self) -> u64 {
        self.received
    }
}

impl<'a> NetObj for Receiver<'a> {
    fn init(&mut self, _: NetObjId, _: Time) -> Result<Vec<(Time, NetObjId, Action)>, Error> {
        Ok(Vec::new())
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
            PacketType::Refused => return Ok(Vec::new()),
        };
        for payload in self.inbound.push(pkt.conn(), bytes) {
            let req = match Request::decode(&payload) {
                Ok(req) => req,
                Err(e) => {
                    warn!("Receiver on node {} got an undecodable payload: {}", self.node, e);
                    self.tracer
                        .log(obj_id, now, TraceElem::Dropped(DropReason::Malformed));
                    continue;
                }
            };
            if req.actuator_id.addr.node != self.node {
                warn!(
                    "Receiver on node {} got the response meant for {}",
                    self.node, req.actuator_id
                );
            }
            self.received += 1;
            self.tracer.log(
                obj_id,
                now,
                TraceElem::Response {
                    seq: req.seq,
                    latency: now - req.sent_at,
                },
            );
        }
        Ok(Vec::new())
    }

    fn event(
        &mut self,
        _: NetObjId,
        _: NetObjId,
        _: Time,
        _: u64,
    ) -> Result<Vec<(Time, NetObjId, Action)>, Error> {
        unreachable!()
    }
}
