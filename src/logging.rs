//! Wrapper functions for structured logging. Each function corresponds to a
//! kind of event the TCP engine records.

use crate::{tcp::Control, utility::Endpoints};
use tracing::{event, Level};
use tracing_subscriber::FmtSubscriber;

/// Installs a global subscriber writing to stdout, as JSON if `json` is set.
/// Should be called once, before the stack starts.
pub fn init_events(
    level: Level,
    json: bool,
) -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let builder = FmtSubscriber::builder().with_max_level(level);
    if json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    }
}

/// Segment event handler.
/// Records every segment handed to IP. Captures the following data:
/// local, remote, seq, ack, flags, len, rexmit
pub fn segment_event(
    endpoints: Endpoints,
    seq: u32,
    ack: u32,
    ctl: Control,
    len: usize,
    rexmit: bool,
) {
    event!(
        target: "SEGMENT",
        Level::DEBUG,
        local = format!("{}:{}", endpoints.local.address, endpoints.local.port),
        remote = format!("{}:{}", endpoints.remote.address, endpoints.remote.port),
        seq,
        ack,
        flags = format!("{ctl:?}"),
        len,
        rexmit,
    );
}
