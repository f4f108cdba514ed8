//! Periodic retrieval of a layer's auxiliary resources.
//!
//! A [`ResourceInitializer`] runs a task on its own thread at a fixed rate,
//! starting immediately, until the task reports success. A failed or
//! panicking task stops the schedule.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::layer::{LayerCore, LayerEvent};
use crate::retrieve::{Retriever, UrlRetriever};

/// Default interval between resource retrieval attempts.
pub const DEFAULT_RESOURCE_RETRIEVAL_PERIOD: Duration = Duration::from_secs(600);

/// Outcome of one resource retrieval attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalState {
    Successful,
    Error,
    Unknown,
}

/// Future type for resource tasks.
pub type ResourceFuture = Pin<Box<dyn Future<Output = Result<RetrievalState>> + Send + 'static>>;

/// A task run on every tick.
pub type ResourceTask = Arc<dyn Fn() -> ResourceFuture + Send + Sync + 'static>;

/// Handle to a running resource schedule.
#[derive(Debug)]
pub struct ResourceInitializer {
    name: String,
    stop: CancellationToken,
    interrupt: CancellationToken,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ResourceInitializer {
    /// Start a schedule on a dedicated thread driving `runtime`.
    pub fn start(
        name: impl Into<String>,
        runtime: Handle,
        period: Duration,
        task: ResourceTask,
    ) -> Result<Self> {
        let name = name.into();
        let stop = CancellationToken::new();
        let interrupt = CancellationToken::new();
        let running = Arc::new(AtomicBool::new(true));

        let thread = std::thread::Builder::new()
            .name(format!("{name} resources"))
            .spawn({
                let name = name.clone();
                let stop = stop.clone();
                let interrupt = interrupt.clone();
                let running = Arc::clone(&running);
                move || {
                    runtime.block_on(run_schedule(&name, period, task, stop, interrupt));
                    running.store(false, Ordering::SeqCst);
                }
            })
            .map_err(|e| Error::Unavailable {
                what: format!("resource thread for {name}: {e}"),
            })?;

        Ok(Self {
            name,
            stop,
            interrupt,
            running,
            thread: Some(thread),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Cancel future ticks; a task already running is allowed to finish.
    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    /// Cancel future ticks and interrupt a running task.
    pub fn shutdown_now(&self) {
        self.stop.cancel();
        self.interrupt.cancel();
    }

    /// Wait for the schedule's thread to exit.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::error!(name = %self.name, "resource thread panicked");
        }
    }
}

impl Drop for ResourceInitializer {
    fn drop(&mut self) {
        self.shutdown_now();
    }
}

async fn run_schedule(
    name: &str,
    period: Duration,
    task: ResourceTask,
    stop: CancellationToken,
    interrupt: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let mut attempt = tokio::spawn(task());
        let outcome = tokio::select! {
            () = interrupt.cancelled() => {
                attempt.abort();
                tracing::debug!(name, "resource retrieval interrupted");
                break;
            }
            outcome = &mut attempt => outcome,
        };

        match outcome {
            Ok(Ok(RetrievalState::Successful)) => {
                tracing::info!(name, "resources retrieved");
                break;
            }
            Ok(Ok(state)) => tracing::debug!(name, ?state, "resources not yet retrieved"),
            Ok(Err(e)) => {
                tracing::error!(name, error = %e, "resource retrieval failed, stopping");
                break;
            }
            Err(e) => {
                tracing::error!(name, error = %e, "resource retrieval panicked, stopping");
                break;
            }
        }
    }
}

impl LayerCore {
    /// One attempt at retrieving the layer's capabilities document.
    pub(crate) async fn retrieve_resources(self: Arc<Self>) -> Result<RetrievalState> {
        if !self.properties().enabled {
            return Ok(RetrievalState::Unknown);
        }
        if !self.params.retrieve_properties_from_service.unwrap_or(false) {
            return Ok(RetrievalState::Successful);
        }
        let Some(url) = self.params.capabilities_url() else {
            return Err(Error::Config {
                key: "GetCapabilitiesUrl",
                detail: "no capabilities location configured".to_string(),
            });
        };
        if self.resource_absent.is_resource_absent(&url) {
            return Ok(RetrievalState::Error);
        }

        match self.fetch_capabilities(&url).await {
            Ok(document) => {
                *self.capabilities.write().unwrap_or_else(PoisonError::into_inner) = Some(document);
                self.resource_absent.unmark_resource_absent(&url);
                self.emit(LayerEvent::ResourcesRetrieved);
                Ok(RetrievalState::Successful)
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "capabilities retrieval failed");
                self.resource_absent.mark_resource_absent(url);
                Ok(RetrievalState::Error)
            }
        }
    }

    async fn fetch_capabilities(&self, url: &str) -> Result<String> {
        let parsed = reqwest::Url::parse(url).map_err(|e| Error::MalformedUrl {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        let network = self.env.network_status();
        if network.is_offline_mode() || !network.is_url_available(&parsed) {
            return Err(Error::Unavailable { what: url.to_string() });
        }

        let millis = |ms: Option<u64>| ms.map(Duration::from_millis);
        let retriever = UrlRetriever::new(self.env.http().clone(), parsed, Arc::clone(network))
            .with_connect_timeout(millis(self.params.url_connect_timeout))
            .with_read_timeout(millis(self.params.url_read_timeout));
        let content = retriever.retrieve().await?;
        if content.data.is_empty() {
            return Err(Error::EmptyContent {
                source_name: url.to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&content.data).into_owned())
    }
}
