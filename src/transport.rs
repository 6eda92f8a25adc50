//! Just enough of a stream transport to carry fixed-size payloads: segmentation, per-connection
//! reassembly and a cache of outbound connections.

use crate::simulator::*;

use fnv::FnvHashMap;
use log::debug;

/// First port handed out to outbound connections
pub const EPHEMERAL_PORT_START: u16 = 49153;

/// Cut `payload` into packets of at most `mss` bytes, in stream order
pub fn segment(src: Endpoint, dest: Endpoint, now: Time, payload: &[u8], mss: u64) -> Vec<Packet> {
    assert!(mss > 0);
    payload
        .chunks(mss as usize)
        .map(|chunk| Packet {
            sent_time: now,
            src,
            dest,
            ptype: PacketType::Data(chunk.to_vec()),
        })
        .collect()
}

/// Buffers the byte stream of every inbound connection and cuts it into payloads of `pkt_size`
/// bytes. Streams may deliver a payload in arbitrary pieces
pub struct Reassembler {
    pkt_size: usize,
    buffers: FnvHashMap<ConnId, Vec<u8>>,
}

impl Reassembler {
    pub fn new(pkt_size: u64) -> Self {
        assert!(pkt_size > 0);
        Self {
            pkt_size: pkt_size as usize,
            buffers: Default::default(),
        }
    }

    /// Append `data` to the stream of `conn` and return every payload that is now complete
    pub fn push(&mut self, conn: ConnId, data: &[u8]) -> Vec<Vec<u8>> {
        let buf = self.buffers.entry(conn).or_insert_with(Vec::new);
        buf.extend_from_slice(data);
        let mut res = Vec::new();
        while buf.len() >= self.pkt_size {
            let rest = buf.split_off(self.pkt_size);
            res.push(std::mem::replace(buf, rest));
        }
        res
    }

    /// Bytes held back for `conn` while waiting for the rest of a payload
    #[allow(dead_code)]
    pub fn pending(&self, conn: &ConnId) -> usize {
        self.buffers.get(conn).map_or(0, |b| b.len())
    }

    /// Forget all partial payloads
    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}

#[derive(Clone, Copy, Debug)]
struct Connection {
    id: ConnId,
    /// Set once the peer refused us. Nothing is sent on a failed connection
    failed: bool,
}

/// Outbound connections of one node, created lazily and at most once per destination
pub struct ConnectionCache {
    local: Addr,
    next_port: u16,
    conns: FnvHashMap<Endpoint, Connection>,
}

impl ConnectionCache {
    pub fn new(local: Addr) -> Self {
        Self {
            local,
            next_port: EPHEMERAL_PORT_START,
            conns: Default::default(),
        }
    }

    /// The connection to `dest`, opening it if this is the first time we talk to `dest`. Returns
    /// `None` if the connection was refused earlier
    pub fn connect(&mut self, dest: Endpoint) -> Option<ConnId> {
        let local = self.local;
        let next_port = &mut self.next_port;
        let conn = self.conns.entry(dest).or_insert_with(|| {
            let src = Endpoint::new(local, *next_port);
            *next_port = next_port
                .checked_add(1)
                .unwrap_or(EPHEMERAL_PORT_START);
            debug!("Opening connection {} -> {}", src, dest);
            Connection {
                id: ConnId { src, dest },
                failed: false,
            }
        });
        if conn.failed {
            None
        } else {
            Some(conn.id)
        }
    }

    /// Mark the connection to `dest` as failed. Returns false if we never connected to `dest`
    pub fn mark_failed(&mut self, dest: Endpoint) -> bool {
        match self.conns.get_mut(&dest) {
            Some(conn) => {
                conn.failed = true;
                true
            }
            None => false,
        }
    }

    /// Number of connections ever opened
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(node: usize, port: u16) -> Endpoint {
        Endpoint::new(Addr { node, iface: 1 }, port)
    }

    #[test]
    fn segments_respect_mss() {
        let payload = vec![7u8; 5096];
        let pkts = segment(ep(1, 50000), ep(2, 9000), Time::ZERO, &payload, 1440);
        let sizes: Vec<u64> = pkts.iter().map(|p| p.size()).collect();
        assert_eq!(sizes, vec![1440, 1440, 1440, 776]);
        assert!(pkts.iter().all(|p| p.dest == ep(2, 9000)));
    }

    #[test]
    fn reassembly_across_arbitrary_pieces() {
        let conn = ConnId {
            src: ep(1, 50000),
            dest: ep(2, 9000),
        };
        let other = ConnId {
            src: ep(3, 50000),
            dest: ep(2, 9000),
        };
        let mut r = Reassembler::new(10);
        assert!(r.push(conn, &[1; 4]).is_empty());
        assert!(r.push(other, &[9; 6]).is_empty());
        assert_eq!(r.pending(&conn), 4);
        // Completes the first payload and starts a second one
        let done = r.push(conn, &[2; 8]);
        assert_eq!(done.len(), 1);
        assert_eq!(&done[0][..4], &[1; 4]);
        assert_eq!(&done[0][4..], &[2; 6]);
        assert_eq!(r.pending(&conn), 2);
        // Buffers are kept apart per connection
        assert_eq!(r.pending(&other), 6);
        // Two payloads at once
        assert_eq!(r.push(conn, &[3; 18]).len(), 2);
        assert_eq!(r.pending(&conn), 0);
    }

    #[test]
    fn connections_are_reused() {
        let mut cache = ConnectionCache::new(Addr { node: 5, iface: 1 });
        let a = cache.connect(ep(1, 9000)).unwrap();
        let b = cache.connect(ep(2, 9000)).unwrap();
        assert_eq!(cache.connect(ep(1, 9000)), Some(a));
        assert_eq!(cache.len(), 2);
        assert_eq!(a.src.port, EPHEMERAL_PORT_START);
        assert_eq!(b.src.port, EPHEMERAL_PORT_START + 1);
        assert_eq!(a.src.addr, Addr { node: 5, iface: 1 });
    }

    #[test]
    fn failed_connections_are_not_retried() {
        let mut cache = ConnectionCache::new(Addr { node: 5, iface: 1 });
        cache.connect(ep(1, 9000)).unwrap();
        assert!(cache.mark_failed(ep(1, 9000)));
        assert!(!cache.mark_failed(ep(3, 9000)));
        assert_eq!(cache.connect(ep(1, 9000)), None);
        assert_eq!(cache.len(), 1);
    }
}
