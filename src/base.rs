use crate::config::LinkParams;
use crate::simulator::*;
use crate::tree::{NodeId, TreeIndex};

use failure::{bail, format_err, Error};
use fnv::{FnvHashMap, FnvHashSet};
use log::{debug, warn};
use std::rc::Rc;

/// Carries packets between any two tree nodes. Every link of the tree is modelled by its
/// propagation delay and transmission rate only; there is no queueing or loss on links
pub struct Network<'a> {
    tree: &'a TreeIndex,
    /// Parameters of the links between tier `t` and `t + 1`, indexed by `t`
    links: Vec<LinkParams>,
    /// Which object listens on which port of which node
    listeners: FnvHashMap<(NodeId, u16), NetObjId>,
    /// When the last segment of every connection arrives, so a connection never reorders
    last_arrival: FnvHashMap<ConnId, Time>,
    /// Connections whose sender has already been told that nobody listens
    refused: FnvHashSet<ConnId>,
}

impl<'a> Network<'a> {
    pub fn new(tree: &'a TreeIndex, links: Vec<LinkParams>) -> Result<Self, Error> {
        if links.len() + 1 != tree.n_tiers() {
            bail!(
                "A tree with {} tiers needs {} link parameters, got {}",
                tree.n_tiers(),
                tree.n_tiers() - 1,
                links.len()
            );
        }
        Ok(Self {
            tree,
            links,
            listeners: Default::default(),
            last_arrival: Default::default(),
            refused: Default::default(),
        })
    }

    /// Deliver everything sent to `port` on any address of `node` to `obj`
    pub fn listen(&mut self, node: NodeId, port: u16, obj: NetObjId) -> Result<(), Error> {
        if node >= self.tree.n_nodes() {
            bail!("Cannot listen on node {}, the tree has {} nodes", node, self.tree.n_nodes());
        }
        if let Some(other) = self.listeners.insert((node, port), obj) {
            bail!(
                "Port {} on node {} is already bound by object {}, cannot bind it for object {}",
                port,
                node,
                other,
                obj
            );
        }
        Ok(())
    }

    /// Time it takes `bytes` bytes to travel from node `a` to node `b`
    pub fn latency(&self, a: NodeId, b: NodeId, bytes: u64) -> Time {
        let micros: f64 = self
            .tree
            .path_link_tiers(a, b)
            .into_iter()
            .map(|t| {
                let link = &self.links[t];
                link.delay.micros() as f64 + 1e6 * bytes as f64 * 8. / link.rate
            })
            .sum();
        Time::from_micros_f64(micros)
    }
}

impl<'a> NetObj for Network<'a> {
    fn init(&mut self, _: NetObjId, _: Time) -> Result<Vec<(Time, NetObjId, Action)>, Error> {
        Ok(Vec::new())
    }

    fn push(
        &mut self,
        _obj_id: NetObjId,
        from: NetObjId,
        now: Time,
        pkt: Rc<Packet>,
    ) -> Result<Vec<(Time, NetObjId, Action)>, Error> {
        let (src, dest) = (pkt.src.addr.node, pkt.dest.addr.node);
        if src >= self.tree.n_nodes() || dest >= self.tree.n_nodes() {
            return Err(format_err!(
                "Packet {} -> {} refers to a node outside the tree",
                pkt.src,
                pkt.dest
            ));
        }

        if let Some(&to) = self.listeners.get(&(dest, pkt.dest.port)) {
            let conn = pkt.conn();
            let mut arrival = now + self.latency(src, dest, pkt.size());
            if let Some(&last) = self.last_arrival.get(&conn) {
                arrival = arrival.max(last);
            }
            self.last_arrival.insert(conn, arrival);
            Ok(vec![(arrival, to, Action::Push(pkt))])
        } else if let PacketType::Refused = pkt.ptype {
            debug!("Dropping refusal for {} since nobody listens", pkt.dest);
            Ok(Vec::new())
        } else if self.refused.insert(pkt.conn()) {
            warn!("Connection {} -> {} refused: nobody listens", pkt.src, pkt.dest);
            let refusal = Packet {
                sent_time: now,
                src: pkt.dest,
                dest: pkt.src,
                ptype: PacketType::Refused,
            };
            Ok(vec![(
                now + self.latency(dest, src, 0),
                from,
                Action::Push(Rc::new(refusal)),
            )])
        } else {
            debug!("Dropping segment on refused connection {} -> {}", pkt.src, pkt.dest);
            Ok(Vec::new())
        }
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
