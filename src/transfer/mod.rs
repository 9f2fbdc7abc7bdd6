//! Background file transfers.

pub mod job;
pub mod queue;
pub mod transport;

pub use job::{TransferJob, TransferStatus};
pub use queue::{QueueStats, TransferQueue};
pub use transport::{CopyTool, RsyncTransport, TransferOutcome, Transport, parse_rsync_stats};
