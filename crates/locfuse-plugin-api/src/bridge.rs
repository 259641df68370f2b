//! Async Plugin Bridge
//!
//! Wraps one bound plugin in a dedicated worker thread. Every call becomes a
//! job on the worker's channel and its result travels back through a oneshot,
//! so calls to one plugin are serialized while different plugins run in
//! parallel.
//!
//! ```text
//!   async caller ──job──► flume channel ──► worker thread ──► plugin
//!        ▲                                        │
//!        └──────────── oneshot reply ◄────────────┘
//! ```
//!
//! Every wait is bounded by the call timeout. A worker that dies mid-call
//! (the plugin panicked or its process went away) drops the reply sender and
//! the caller sees [`PluginError::Disconnected`].

use crate::error::{PluginError, PluginResult};
use crate::plugin::{GeocoderPlugin, LocationPlugin, Plugin, PluginDescriptor, PositionReporter};
use locfuse_core::types::{Address, GeocodeRequest, Position, ReverseGeocodeRequest};
use parking_lot::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

type Job<P> = Box<dyn FnOnce(&mut P) + Send>;

/// Bridge to a bound location plugin.
pub type LocationBridge = PluginBridge<dyn LocationPlugin>;

/// Bridge to a bound geocoder plugin.
pub type GeocoderBridge = PluginBridge<dyn GeocoderPlugin>;

/// Serializing async front-end for one plugin instance.
pub struct PluginBridge<P: ?Sized + Plugin + 'static> {
    name: String,
    jobs: Mutex<Option<flume::Sender<Job<P>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    opened: tokio::sync::Mutex<bool>,
    call_timeout: Duration,
}

impl<P: ?Sized + Plugin + 'static> PluginBridge<P> {
    /// Moves `plugin` onto a new worker thread named after `name` and `role`.
    pub fn spawn(
        name: impl Into<String>,
        role: &str,
        plugin: Box<P>,
        call_timeout: Duration,
    ) -> PluginResult<Self> {
        let name = name.into();
        let (tx, rx) = flume::unbounded::<Job<P>>();
        let thread_name = format!("{}-{}", name, role);
        let worker_name = name.clone();

        let handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let mut plugin = plugin;
                while let Ok(job) = rx.recv() {
                    job(&mut *plugin);
                }
                debug!(plugin = %worker_name, "Plugin worker stopped");
            })
            .map_err(|e| PluginError::ThreadSpawn(e.to_string()))?;

        Ok(Self {
            name,
            jobs: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
            opened: tokio::sync::Mutex::new(false),
            call_timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true while the worker accepts calls.
    pub fn is_running(&self) -> bool {
        self.jobs.lock().is_some()
    }

    pub async fn is_open(&self) -> bool {
        *self.opened.lock().await
    }

    /// Runs `f` on the worker thread and waits for its result.
    pub async fn call<T, F>(&self, operation: &'static str, f: F) -> PluginResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut P) -> PluginResult<T> + Send + 'static,
    {
        let sender = self
            .jobs
            .lock()
            .clone()
            .ok_or_else(|| PluginError::Closed(self.name.clone()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job<P> = Box::new(move |plugin: &mut P| {
            let _ = reply_tx.send(f(plugin));
        });
        sender
            .send(job)
            .map_err(|_| PluginError::Disconnected(self.name.clone()))?;

        trace!(plugin = %self.name, operation, "Plugin call dispatched");

        match tokio::time::timeout(self.call_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PluginError::Disconnected(self.name.clone())),
            Err(_) => Err(PluginError::Timeout {
                plugin: self.name.clone(),
                operation: operation.to_string(),
                timeout_ms: self.call_timeout.as_millis() as u64,
            }),
        }
    }

    /// Runs `open` once; later calls while open are no-ops.
    async fn open_with<F>(&self, open: F) -> PluginResult<()>
    where
        F: FnOnce(&mut P) -> PluginResult<()> + Send + 'static,
    {
        let mut opened = self.opened.lock().await;
        if *opened {
            return Ok(());
        }
        self.call("open", open).await?;
        *opened = true;
        Ok(())
    }

    pub async fn descriptor(&self) -> PluginResult<PluginDescriptor> {
        self.call("describe", |plugin: &mut P| Ok(plugin.descriptor())).await
    }

    /// Closes the plugin if it was opened, then stops the worker.
    pub async fn close(&self) -> PluginResult<()> {
        let was_open = {
            let mut opened = self.opened.lock().await;
            std::mem::replace(&mut *opened, false)
        };
        let result = if was_open {
            self.call("close", |plugin: &mut P| plugin.close()).await
        } else {
            Ok(())
        };
        self.shutdown();
        result
    }

    /// Stops accepting calls. Queued jobs still run; the worker exits after
    /// the last one. A hung call is not waited for.
    pub fn shutdown(&self) {
        if self.jobs.lock().take().is_some() {
            debug!(plugin = %self.name, "Plugin bridge shut down");
        }
        self.worker.lock().take();
    }
}

impl<P: ?Sized + Plugin + 'static> Drop for PluginBridge<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PluginBridge<dyn LocationPlugin> {
    pub async fn open(&self, reporter: PositionReporter) -> PluginResult<()> {
        self.open_with(move |plugin| plugin.open(reporter)).await
    }

    pub async fn update(&self) -> PluginResult<Option<Position>> {
        self.call("update", |plugin| plugin.update()).await
    }
}

impl PluginBridge<dyn GeocoderPlugin> {
    pub async fn open(&self) -> PluginResult<()> {
        self.open_with(|plugin| plugin.open()).await
    }

    pub async fn forward(&self, request: GeocodeRequest) -> PluginResult<Vec<Address>> {
        self.call("forward", move |plugin| plugin.forward(&request)).await
    }

    pub async fn reverse(&self, request: ReverseGeocodeRequest) -> PluginResult<Vec<Address>> {
        self.call("reverse", move |plugin| plugin.reverse(&request)).await
    }
}
