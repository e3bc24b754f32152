/**
 * events.rs
 *
 * Host event-bus contract. The dispatch framework itself lives outside
 * this crate; it hands us a group id with each request and takes typed
 * response events back through an injected sink.
 */

use anyhow::Result;

/// Response to a location query event.
///
/// `success` reports whether at least one location fix has been
/// received since the session started; the fields are zeroed until
/// then.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationResponse {
    /// Destination identifier of the originating request event.
    pub group_id: u32,

    pub success: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
    pub facing: f64,
}

/// Sink for response events, owned by the host framework.
///
/// Submitting may fail (the host storage can reject events); callers
/// log the failure and move on, they never retry.
pub trait EventSink: Send + Sync {
    fn submit(&self, response: LocationResponse) -> Result<()>;
}
