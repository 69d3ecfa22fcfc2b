use crate::config::TunnelProto;
use serde::Serialize;

/// One active forwarding endpoint reported by a running agent process.
///
/// `process_key` is a non-owning back-reference to the agent that owns this
/// tunnel; the tunnel is only valid while that process is tracked in the
/// registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tunnel {
    pub name: String,
    pub public_url: String,
    pub proto: TunnelProto,
    pub local_addr: String,
    pub process_key: String,
}

impl Tunnel {
    /// Whether this tunnel forwards to the given local port
    pub fn forwards_port(&self, port: u16) -> bool {
        self.local_addr
            .rsplit(':')
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            == Some(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tunnel(addr: &str) -> Tunnel {
        Tunnel {
            name: "t1".into(),
            public_url: "https://abc.ngrok.io".into(),
            proto: TunnelProto::Http,
            local_addr: addr.into(),
            process_key: "/tmp/tunwarden.yml".into(),
        }
    }

    #[test]
    fn test_forwards_port() {
        assert!(tunnel("localhost:8080").forwards_port(8080));
        assert!(tunnel("127.0.0.1:8080").forwards_port(8080));
        assert!(!tunnel("localhost:8080").forwards_port(80));
        assert!(!tunnel("localhost").forwards_port(8080));
    }
}
