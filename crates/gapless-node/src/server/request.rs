use gapless::{SequenceRequest, SequenceResponse};
use tokio::sync::oneshot;

/// A unit of work executed by a pool worker.
///
/// Each variant carries the channel its outcome is sent back on.
#[derive(Debug)]
pub enum WorkRequest {
    Allocate {
        request: SequenceRequest,
        response: oneshot::Sender<gapless::Result<SequenceResponse>>,
    },
    Release {
        number: u64,
        site_id: String,
        partition_id: String,
        reason: String,
        response: oneshot::Sender<gapless::Result<()>>,
    },
    Shutdown {
        response: oneshot::Sender<()>,
    },
}
