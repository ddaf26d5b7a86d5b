//! Timing constants and async timeout helpers shared by the pipeline and dispatcher.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;

/// Deadline applied to each chunk the writer pushes to the transport.
/// Bounds send-buffer growth when a peer stops reading.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(3);

/// Interval at which the scheduler forces a writer wake-up.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Run `fut` under `deadline`, mapping expiry to [`ProtocolError::Timeout`].
pub async fn with_timeout<F, T>(deadline: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
