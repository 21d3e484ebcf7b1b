//! The two observable roles.
//!
//! - [`ClientSession`]: one session against one host, over either channel
//!   shape.
//! - [`HostHandle`]: a registered host answering any number of clients over
//!   one multiplexed channel.
//!
//! Both run their sessions on background tasks and surface the outcome as
//! an explicit [`Result`](crate::Result) from `join`.

pub mod client;
pub mod host;

pub use client::ClientSession;
pub use host::HostHandle;

use tokio::task::JoinHandle;

use crate::error::{Result, SignalError};

async fn join_task(task: JoinHandle<Result<()>>) -> Result<()> {
    match task.await {
        Ok(result) => result,
        Err(e) => Err(SignalError::ChannelUnavailable(format!(
            "signaling task ended abnormally: {e}"
        ))),
    }
}
