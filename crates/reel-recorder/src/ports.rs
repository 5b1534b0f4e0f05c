//! Loopback UDP port discovery for the muxer's RTP/RTCP listeners.

use std::collections::HashSet;
use std::net::UdpSocket;
use std::ops::Range;
use std::sync::Mutex;

use rand::Rng;

use crate::config::RecorderConfig;
use crate::error::{RecorderError, Result};

/// Hands out UDP port pairs on 127.0.0.1 such that both `P` (RTP) and `P+1`
/// (RTCP) are free at allocation time.
///
/// Allocated pairs stay reserved until [`release_pair`](Self::release_pair),
/// so two concurrent recordings can never be pointed at the same peer port
/// even though the probe sockets are closed before the muxer binds.
pub struct PortAllocator {
    range: Range<u16>,
    attempts: usize,
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(range: Range<u16>, attempts: usize) -> Self {
        Self {
            range,
            attempts,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_config(config: &RecorderConfig) -> Self {
        Self::new(config.port_range.clone(), config.port_attempts)
    }

    /// Find a free RTP/RTCP pair and reserve it. Returns the RTP port.
    pub fn allocate_pair(&self) -> Result<u16> {
        // A pair needs two ports inside the range; a narrower range would
        // make the candidate sampling below panic on an empty interval.
        if self.range.end.saturating_sub(self.range.start) < 2 {
            tracing::warn!(
                start = self.range.start,
                end = self.range.end,
                "port range cannot hold an RTP/RTCP pair"
            );
            return Err(RecorderError::ResourceExhaustion(0));
        }

        let mut rng = rand::thread_rng();
        // Leave room for the RTCP port above the sampled candidate.
        let upper = self.range.end - 1;

        for _ in 0..self.attempts {
            let port = rng.gen_range(self.range.start..upper);

            {
                let reserved = self.reserved.lock().unwrap();
                if reserved.contains(&port) || reserved.contains(&(port + 1)) {
                    continue;
                }
            }

            if bind_probe(port).is_err() || bind_probe(port + 1).is_err() {
                continue;
            }

            let mut reserved = self.reserved.lock().unwrap();
            if reserved.contains(&port) || reserved.contains(&(port + 1)) {
                continue;
            }
            reserved.insert(port);
            reserved.insert(port + 1);
            tracing::debug!(port, "allocated loopback RTP/RTCP port pair");
            return Ok(port);
        }

        Err(RecorderError::ResourceExhaustion(self.attempts))
    }

    /// Return a pair previously handed out by [`allocate_pair`](Self::allocate_pair).
    pub fn release_pair(&self, port: u16) {
        let mut reserved = self.reserved.lock().unwrap();
        reserved.remove(&port);
        reserved.remove(&(port + 1));
    }

    #[cfg(test)]
    fn reserved_count(&self) -> usize {
        self.reserved.lock().unwrap().len()
    }
}

fn bind_probe(port: u16) -> std::io::Result<()> {
    // The probe socket is dropped immediately; the reservation set covers
    // the window until the muxer binds the port itself.
    UdpSocket::bind(("127.0.0.1", port)).map(drop)
}
