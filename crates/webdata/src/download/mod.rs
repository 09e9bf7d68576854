//! # Download
//!
//! Scheduling, coalescing and cancellation of network fetches. The network
//! itself sits behind the [`Transport`] trait.

mod events;
mod http;
mod operation;
mod options;
mod scheduler;
mod transport;

pub use events::DownloadEvent;
pub use http::HttpTransport;
pub use operation::{
    CompletionCallback, DownloadObserver, DownloadOperation, DownloadOutcome, DownloadProgress,
    OperationState, ProgressCallback,
};
pub use options::{DownloadOptions, DownloadOrder, QueuePriority};
pub use scheduler::{DownloadTicket, Downloader, ObserverHandle};
pub use transport::{
    ProgressReporter, Transport, TransportRequest, TransportResponse, TransportSignal,
};
