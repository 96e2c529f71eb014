//! Bridge host: one guest script running in one context on a dedicated
//! thread.
//!
//! Guest values are confined to the context thread. Native callers talk to
//! the host through a job queue; each job runs on the context thread with
//! access to the [`BridgeContext`], and blocking helpers such as
//! [`Host::call`] wait for the reply on a one-shot channel. The context
//! thread alternates between serving jobs and draining the reactor, so
//! promise settlements, timer fires and stream signals are delivered
//! between jobs.

use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use serde_json::Value as Json;
use tonbridge_core::{GuestValue, ScriptContext, ScriptVm};
use tracing::{error, info};

use crate::apis::crypto;
use crate::apis::fetch::{self, FetchClient};
use crate::apis::secrets::{self, MemorySecretStore, SecretStore};
use crate::apis::sse::{self, SseClient};
use crate::apis::timers::{self, Timers};
use crate::call_bridge::{CallArg, CallBridge};
use crate::config::RuntimeConfig;
use crate::error::{HostError, HostResult};
use crate::event_bridge::{BridgeEvent, BridgeEventKind, EventBridge, ListenerGuard};
use crate::marshal;
use crate::reactor::{NativeEvent, Reactor};

/// Everything a job running on the context thread can reach.
pub struct BridgeContext {
    script: Rc<dyn ScriptContext>,
    calls: CallBridge,
    events: Rc<EventBridge>,
    timers: Rc<Timers>,
    sse: Rc<SseClient>,
    fetch: Rc<FetchClient>,
    reactor: Rc<Reactor>,
}

impl BridgeContext {
    pub fn context(&self) -> &Rc<dyn ScriptContext> {
        &self.script
    }

    pub fn calls(&self) -> &CallBridge {
        &self.calls
    }

    pub fn events(&self) -> &EventBridge {
        &self.events
    }

    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    pub fn sse(&self) -> &SseClient {
        &self.sse
    }

    pub fn fetch(&self) -> &FetchClient {
        &self.fetch
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }
}

type SetupFn = Box<dyn FnOnce(&BridgeContext) -> HostResult<()> + Send>;

enum Job {
    Run(Box<dyn FnOnce(&BridgeContext) + Send>),
    Shutdown,
}

/// Configures and spawns a [`Host`].
pub struct HostBuilder {
    config: RuntimeConfig,
    script: String,
    script_url: String,
    store: Arc<dyn SecretStore>,
    setup: Vec<SetupFn>,
}

impl HostBuilder {
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            script: String::new(),
            script_url: "<main>".to_string(),
            store: Arc::new(MemorySecretStore::new()),
            setup: Vec::new(),
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// The guest script evaluated once at startup.
    pub fn script(mut self, source: impl Into<String>) -> Self {
        self.script = source.into();
        self
    }

    pub fn script_url(mut self, url: impl Into<String>) -> Self {
        self.script_url = url.into();
        self
    }

    pub fn secret_store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.store = store;
        self
    }

    /// Run on the context thread after the polyfills are installed and
    /// before the script is evaluated. Use this to expose host functions to
    /// the guest.
    pub fn setup(
        mut self,
        f: impl FnOnce(&BridgeContext) -> HostResult<()> + Send + 'static,
    ) -> Self {
        self.setup.push(Box::new(f));
        self
    }

    /// Spawn the context thread and wait for the script to finish its
    /// top-level evaluation.
    pub fn spawn(self, vm: Arc<dyn ScriptVm>) -> HostResult<Host> {
        self.config.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .thread_name("tonbridge-io")
            .build()
            .map_err(|e| HostError::internal(format!("runtime start failed: {e}")))?;

        let (job_tx, job_rx) = bounded(self.config.job_queue_depth);
        let (ready_tx, ready_rx) = bounded(1);

        let config = self.config.clone();
        let handle = runtime.handle().clone();
        let worker = std::thread::Builder::new()
            .name("tonbridge-guest".to_string())
            .spawn(move || {
                run_context_thread(
                    vm,
                    self.config,
                    self.script,
                    self.script_url,
                    self.store,
                    self.setup,
                    handle,
                    job_rx,
                    ready_tx,
                );
            })
            .map_err(|e| HostError::internal(format!("thread spawn failed: {e}")))?;

        let host = Host {
            jobs: job_tx,
            worker: Some(worker),
            config,
            _runtime: runtime,
        };
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(host),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(HostError::internal("context thread died during startup")),
        }
    }
}

impl Default for HostBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a running bridge host. Cheap to use from any thread; dropping
/// it stops the context thread.
pub struct Host {
    jobs: Sender<Job>,
    worker: Option<JoinHandle<()>>,
    config: RuntimeConfig,
    _runtime: tokio::runtime::Runtime,
}

impl Host {
    pub fn builder() -> HostBuilder {
        HostBuilder::new()
    }

    /// Run a closure on the context thread and wait for its result.
    pub fn with_context<R, F>(&self, f: F) -> HostResult<R>
    where
        F: FnOnce(&BridgeContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = bounded(1);
        self.submit(Job::Run(Box::new(move |bridge| {
            let _ = tx.send(f(bridge));
        })))?;
        rx.recv_timeout(self.config.call_timeout)
            .map_err(|_| HostError::Timeout(self.config.call_timeout.as_millis() as u64))
    }

    /// Call a guest function by dotted path and wait for its settlement.
    ///
    /// Resolution values come back as JSON; a resolution of `undefined`
    /// becomes JSON null.
    pub fn call(&self, path: &str, args: Vec<CallArg>) -> HostResult<Json> {
        let (tx, rx) = bounded(1);
        let path = path.to_string();
        self.submit(Job::Run(Box::new(move |bridge| {
            bridge.calls.invoke(
                &path,
                &args,
                Box::new(move |result| {
                    let _ = tx.send(result.and_then(settlement_json));
                }),
            );
        })))?;
        rx.recv_timeout(self.config.call_timeout)
            .map_err(|_| HostError::Timeout(self.config.call_timeout.as_millis() as u64))?
    }

    /// Register a native listener for guest-announced events.
    ///
    /// The handler runs on the context thread with the payload marshalled to
    /// JSON (`undefined` becomes JSON null). The listener stays registered
    /// until the returned guard is dropped.
    pub fn subscribe_events(
        &self,
        handler: impl Fn(BridgeEventKind, Json) -> HostResult<()> + Send + Sync + 'static,
    ) -> HostResult<ListenerGuard> {
        self.with_context(move |bridge| {
            bridge.events.subscribe(Rc::new(move |event: &BridgeEvent| {
                let payload = settlement_json(event.payload.clone())?;
                handler(event.kind, payload)
            }))
        })
    }

    fn submit(&self, job: Job) -> HostResult<()> {
        self.jobs
            .send(job)
            .map_err(|_| HostError::internal("context thread is gone"))
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        let _ = self.jobs.send(Job::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("context thread panicked");
            }
        }
    }
}

fn settlement_json(value: GuestValue) -> HostResult<Json> {
    if value.is_undefined() {
        return Ok(Json::Null);
    }
    Ok(marshal::guest_to_json(&value)?)
}

#[allow(clippy::too_many_arguments)]
fn run_context_thread(
    vm: Arc<dyn ScriptVm>,
    config: RuntimeConfig,
    script: String,
    script_url: String,
    store: Arc<dyn SecretStore>,
    setup: Vec<SetupFn>,
    handle: tokio::runtime::Handle,
    jobs: Receiver<Job>,
    ready: Sender<HostResult<()>>,
) {
    let bridge = match build_bridge(&*vm, &config, store, handle) {
        Ok(bridge) => bridge,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };

    for step in setup {
        if let Err(err) = step(&bridge) {
            let _ = ready.send(Err(err));
            return;
        }
    }
    if let Err(err) = bridge.script.eval(&script, &script_url) {
        let _ = ready.send(Err(err.into()));
        return;
    }
    let _ = ready.send(Ok(()));
    info!(script = %script_url, "guest script running");

    loop {
        for event in bridge.reactor.drain() {
            match event {
                NativeEvent::TimerFired { id } => bridge.timers.fire(id),
                NativeEvent::Sse { session, signal } => bridge.sse.handle(session, signal),
                NativeEvent::PromiseSettled { .. } => {}
            }
        }
        match jobs.recv_timeout(config.drain_interval) {
            Ok(Job::Run(job)) => job(&bridge),
            Ok(Job::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    bridge.timers.clear_all();
    bridge.sse.close_all();
    bridge.reactor.reject_all("context shut down");
    info!("context thread stopped");
}

fn build_bridge(
    vm: &dyn ScriptVm,
    config: &RuntimeConfig,
    store: Arc<dyn SecretStore>,
    handle: tokio::runtime::Handle,
) -> HostResult<BridgeContext> {
    let script = vm.create_context()?;
    let reactor = Rc::new(Reactor::new(script.clone(), handle.clone()));
    let http = config.http_client()?;

    let timers = Timers::new(reactor.sender(), handle.clone());
    timers::install(&script, timers.clone());

    let fetch = FetchClient::new(http.clone(), config.http_max_response_bytes);
    fetch::install(&script, reactor.clone(), fetch.clone());

    let sse = SseClient::new(script.clone(), http, reactor.sender(), handle);
    sse::install(&script, sse.clone());

    crypto::install(&script);
    secrets::install(&script, store);

    let events = Rc::new(EventBridge::new());
    crate::event_bridge::install(&script, events.clone());

    Ok(BridgeContext {
        calls: CallBridge::new(script.clone()),
        script,
        events,
        timers,
        sse,
        fetch,
        reactor,
    })
}
