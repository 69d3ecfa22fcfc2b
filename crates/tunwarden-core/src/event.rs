use serde::Deserialize;

/// One structured event parsed from the agent's log stream.
///
/// The wire contract is one JSON object per line with at least a `msg`
/// field naming the event. Lines that are not JSON, or that carry an
/// unrecognized `msg`, are ignored rather than treated as fatal.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Agent has begun initializing
    Starting,
    /// Agent is fully initialized and serving
    Ready,
    /// Agent reports a new forwarding endpoint
    TunnelEstablished {
        name: String,
        url: String,
        addr: String,
    },
    /// Agent reports an error; fatal when observed before `Ready`
    Error { code: i64, message: String },
}

#[derive(Debug, Deserialize)]
struct RawLogLine {
    msg: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    addr: Option<String>,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default, alias = "err")]
    message: Option<String>,
}

/// Parse one log line into an event. Returns `None` for anything that is
/// not a well-formed, recognized event record.
pub fn parse_log_line(line: &str) -> Option<AgentEvent> {
    let raw: RawLogLine = serde_json::from_str(line.trim()).ok()?;
    match raw.msg.as_str() {
        "starting" => Some(AgentEvent::Starting),
        "ready" => Some(AgentEvent::Ready),
        "tunnel_established" => Some(AgentEvent::TunnelEstablished {
            name: raw.name?,
            url: raw.url?,
            addr: raw.addr?,
        }),
        "error" => Some(AgentEvent::Error {
            code: raw.code.unwrap_or(1),
            message: raw.message.unwrap_or_default(),
        }),
        _ => None,
    }
}
