//! The self-describing request carried through the chain. It is JSON, zero padded to a fixed size
//! so that every hop can cut the stream into payloads without a length header.

use crate::simulator::{Addr, Endpoint, Time};

use failure::{bail, Error};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Primary address of the leaf that issued the request. Forwarding tables are keyed on this
    pub node_id: Addr,
    /// Where the terminal stage sends the response
    pub actuator_id: Endpoint,
    /// When the client sent the request
    pub sent_at: Time,
    /// Per-client sequence number
    pub seq: u64,
}

impl Request {
    /// Serialize into exactly `size` bytes
    pub fn encode(&self, size: u64) -> Result<Vec<u8>, Error> {
        let mut buf = serde_json::to_vec(self)?;
        if buf.len() as u64 > size {
            bail!(
                "Request {:?} needs {} bytes but payloads are only {} bytes",
                self,
                buf.len(),
                size
            );
        }
        buf.resize(size as usize, 0);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let end = buf.iter().position(|&b| b == 0).unwrap_or_else(|| buf.len());
        Ok(serde_json::from_slice(&buf[..end])?)
    }
}
