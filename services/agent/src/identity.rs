//! Who this agent is.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use rand::Rng;

/// Identity minted once per process start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    /// `agent-<hostname>-<8 hex>`.
    pub agent_id: String,
    pub hostname: String,
    pub local_ip: String,
}

impl AgentIdentity {
    pub fn detect() -> Self {
        Self::with_host(hostname(), local_ip())
    }

    pub fn with_host(hostname: String, local_ip: IpAddr) -> Self {
        let suffix: u32 = rand::rng().random();
        Self {
            agent_id: format!("agent-{hostname}-{suffix:08x}"),
            hostname,
            local_ip: local_ip.to_string(),
        }
    }
}

/// The kernel hostname, or `$HOSTNAME`, or `localhost`.
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for `buf.len()` bytes.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        if let Ok(name) = std::str::from_utf8(&buf[..end]) {
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }

    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// The address of the interface holding the default route.
///
/// Connecting a UDP socket sends nothing; it only selects a source address.
pub fn local_ip() -> IpAddr {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(10, 255, 255, 255), 9))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .ok()
        .filter(|ip| !ip.is_unspecified())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
