//! Retrieval of tile data from local producers and the network.
//!
//! Retrievals run on a [`RetrievalService`], a bounded pool of prioritized
//! tasks on a tokio runtime. A [`Retriever`] produces the payload and a
//! [`RetrievalPostProcessor`] decides what to keep.

mod network;
mod retriever;
mod service;

pub use network::{DEFAULT_HOST_ATTEMPTS, DEFAULT_HOST_RETRY_INTERVAL, NetworkStatus};
pub use retriever::{
    LocalRetrievalRequest, RetrievalPostProcessor, RetrieveFuture, RetrievedContent, Retriever,
    RetrieverFactory, UrlRetriever,
};
pub use service::{DEFAULT_MAX_ACTIVE, DEFAULT_QUEUE_CAPACITY, RetrievalService, Task, TaskFuture};
