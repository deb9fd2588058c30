//! Host-side proxy for the isolated worker.
//!
//! `WorkerProxy` owns one channel generation at a time. It correlates
//! responses with calls, feeds streams, serves reverse calls, times calls
//! out and restarts the worker after a crash within the configured budget.
//!
//! All bookkeeping lives behind one mutex. The dispatcher runs synchronously
//! per inbound message and never calls user code while holding the lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::config::{AbandonPolicy, ProxyConfig};
use crate::diagnostics::Diagnostic;
use crate::error::{Error, Result};
use crate::ipc::{
    Channel, ChannelEvent, EventReceiver, Inbound, Launcher, Message, Progress, STREAM_COMPLETE,
    Transport,
};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::rpc::tables::{CorrelationTables, Pending, PendingStream, PendingUnary, ProgressObserver};
use crate::rpc::{CallCategory, Operation, ResponseStream, ReverseCallBridge};

/// Builder for a [`WorkerProxy`].
pub struct ProxyBuilder {
    launcher: Box<dyn Launcher>,
    config: ProxyConfig,
    bridge: ReverseCallBridge,
    diagnostics: Option<mpsc::UnboundedSender<Diagnostic>>,
}

impl ProxyBuilder {
    pub fn config(mut self, config: ProxyConfig) -> Self {
        self.config = config;
        self
    }

    /// Handlers for calls initiated by the worker.
    pub fn bridge(mut self, bridge: ReverseCallBridge) -> Self {
        self.bridge = bridge;
        self
    }

    /// Receive every message the dispatcher could not route.
    pub fn diagnostics(mut self, tx: mpsc::UnboundedSender<Diagnostic>) -> Self {
        self.diagnostics = Some(tx);
        self
    }

    /// Create the proxy and schedule the first worker launch.
    ///
    /// Returns immediately; use [`WorkerProxy::wait_for_initialization`] to
    /// wait for readiness. Must be called inside a tokio runtime.
    pub fn spawn(self) -> WorkerProxy {
        let inner = Arc::new(Inner {
            launcher: self.launcher,
            config: self.config,
            bridge: self.bridge,
            diagnostics: self.diagnostics,
            next_id: AtomicU64::new(1),
            lifecycle: Lifecycle::new(),
            core: Mutex::new(Core::default()),
        });

        let weak = Arc::downgrade(&inner);
        let startup = tokio::spawn(async move {
            if let Some(inner) = weak.upgrade() {
                inner.bring_up();
            }
        });
        inner.core().tasks.push(startup.abort_handle());

        WorkerProxy { inner }
    }
}

/// Handle to the worker. Cheap to clone; all clones share one worker.
#[derive(Clone)]
pub struct WorkerProxy {
    inner: Arc<Inner>,
}

impl WorkerProxy {
    pub fn builder(launcher: impl Launcher) -> ProxyBuilder {
        ProxyBuilder {
            launcher: Box::new(launcher),
            config: ProxyConfig::default(),
            bridge: ReverseCallBridge::default(),
            diagnostics: None,
        }
    }

    /// Proxy with default configuration and no reverse-call handlers.
    pub fn spawn(launcher: impl Launcher) -> Self {
        Self::builder(launcher).spawn()
    }

    /// Issue a unary call and wait for its result.
    ///
    /// Waits for readiness first unless `op` is `init`.
    pub async fn call(&self, op: Operation, payload: Option<Value>) -> Result<Value> {
        self.unary(op, payload, None).await
    }

    /// Issue a unary call and decode its result.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        op: Operation,
        payload: Option<Value>,
    ) -> Result<T> {
        let value = self.call(op, payload).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Issue a unary call, forwarding its progress notifications to `observer`.
    pub async fn call_with_progress<F>(
        &self,
        op: Operation,
        payload: Option<Value>,
        observer: F,
    ) -> Result<Value>
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.unary(op, payload, Some(Arc::new(observer))).await
    }

    /// Issue a streaming call.
    ///
    /// The returned stream yields chunks in arrival order and ends when the
    /// worker signals completion.
    pub async fn call_streaming(
        &self,
        op: Operation,
        payload: Option<Value>,
    ) -> Result<ResponseStream> {
        loop {
            self.gate(op).await?;
            if let Some(stream) = self.inner.start_stream(op, &payload)? {
                return Ok(stream);
            }
        }
    }

    /// Wait until the worker is ready.
    ///
    /// Fails with `ChannelUnavailable` if the proxy was terminated or gave up
    /// restarting, and with `InitializationTimeout` after `init_timeout`.
    pub async fn wait_for_initialization(&self) -> Result<()> {
        let mut rx = self.inner.lifecycle.subscribe();
        let limit = self.inner.config.init_timeout;

        let state = match tokio::time::timeout(limit, rx.wait_for(|s| s.is_settled())).await {
            Err(_) => return Err(Error::InitializationTimeout(limit)),
            Ok(Err(_)) => return Err(Error::ChannelUnavailable("worker proxy dropped".to_string())),
            Ok(Ok(state)) => *state,
        };

        match state {
            LifecycleState::Ready => Ok(()),
            LifecycleState::Terminated => Err(Error::ChannelUnavailable(
                "worker proxy terminated".to_string(),
            )),
            _ => Err(Error::ChannelUnavailable(
                "worker restart budget exhausted".to_string(),
            )),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.current()
    }

    /// Calls currently awaiting a response, streams included.
    pub fn pending_requests(&self) -> usize {
        self.inner.core().tables.len()
    }

    /// Restarts performed so far.
    pub fn restarts(&self) -> u32 {
        self.inner.core().restarts_used
    }

    /// Ask the worker to clean up, then terminate.
    pub async fn shutdown(&self) {
        if self.state() == LifecycleState::Ready {
            if let Err(e) = self.call(Operation::Cleanup, None).await {
                tracing::warn!("worker cleanup failed: {}", e);
            }
        }
        self.terminate();
    }

    /// Close the channel and fail every pending call.
    ///
    /// Idempotent: later calls do nothing, even if the first close failed.
    pub fn terminate(&self) {
        self.inner.terminate();
    }

    async fn gate(&self, op: Operation) -> Result<()> {
        if op == Operation::Init {
            Ok(())
        } else {
            self.wait_for_initialization().await
        }
    }

    async fn unary(
        &self,
        op: Operation,
        payload: Option<Value>,
        progress: Option<ProgressObserver>,
    ) -> Result<Value> {
        let (id, rx) = loop {
            self.gate(op).await?;
            if let Some(started) = self.inner.start_unary(op, &payload, progress.clone())? {
                break started;
            }
        };

        let mut guard = EvictOnDrop {
            inner: &self.inner,
            id: Some(id),
        };
        let result = rx.await.unwrap_or_else(|_| {
            Err(Error::ChannelUnavailable("call dropped without a result".to_string()))
        });
        guard.id = None;
        result
    }
}

impl std::fmt::Debug for WorkerProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProxy")
            .field("state", &self.state())
            .field("pending", &self.pending_requests())
            .finish()
    }
}

/// Evicts a unary call whose caller stopped waiting.
struct EvictOnDrop<'a> {
    inner: &'a Arc<Inner>,
    id: Option<String>,
}

impl Drop for EvictOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            let entry = self.inner.core().tables.take(&id);
            if let Some(entry) = entry {
                tracing::debug!(%id, call_type = entry.call_type(), "caller abandoned call");
                entry.fail(Error::ChannelUnavailable("caller abandoned call".to_string()));
            }
        }
    }
}

#[derive(Default)]
struct Core {
    tables: CorrelationTables,
    transport: Option<Box<dyn Transport>>,
    /// Incremented per launch and on terminate; stale events are ignored.
    generation: u64,
    restarts_used: u32,
    /// Pump, init watcher and restart timer of the current generation.
    tasks: Vec<AbortHandle>,
}

impl Core {
    fn stop_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

struct Inner {
    launcher: Box<dyn Launcher>,
    config: ProxyConfig,
    bridge: ReverseCallBridge,
    diagnostics: Option<mpsc::UnboundedSender<Diagnostic>>,
    next_id: AtomicU64,
    lifecycle: Lifecycle,
    core: Mutex<Core>,
}

/// Work the dispatcher defers until the lock is released.
enum Deferred {
    Nothing,
    Progress(ProgressObserver, Progress),
    Serve(String, String, Option<Value>),
    Diagnose(Diagnostic),
}

impl Inner {
    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Launch a new channel generation and send `init`.
    fn bring_up(self: &Arc<Self>) {
        let generation = {
            let mut core = self.core();
            if self.lifecycle.current() == LifecycleState::Terminated {
                return;
            }
            core.tasks.clear();
            if self.lifecycle.transition(LifecycleState::Initializing).is_err() {
                return;
            }
            core.generation += 1;
            core.generation
        };

        tracing::info!(generation, "starting worker");
        if let Err(e) = self.connect(generation) {
            self.handle_crash(generation, format!("failed to start worker: {}", e));
        }
    }

    fn connect(self: &Arc<Self>, generation: u64) -> Result<()> {
        let Channel { transport, events } = self.launcher.launch()?;

        let mut core = self.core();
        if core.generation != generation {
            return Ok(());
        }
        core.transport = Some(transport);

        let pump = tokio::spawn(pump(Arc::downgrade(self), generation, events));
        core.tasks.push(pump.abort_handle());

        let (id, rx) = self.register_unary(&mut core, Operation::Init, &None, None)?;
        tracing::debug!(%id, "sent init");

        let weak = Arc::downgrade(self);
        let watcher = tokio::spawn(async move {
            let outcome = rx.await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match outcome {
                Ok(Ok(_)) => inner.mark_ready(generation),
                Ok(Err(e)) => inner.handle_crash(generation, format!("initialization failed: {}", e)),
                // Evicted by terminate.
                Err(_) => {}
            }
        });
        core.tasks.push(watcher.abort_handle());

        Ok(())
    }

    fn mark_ready(&self, generation: u64) {
        let core = self.core();
        if core.generation == generation
            && self.lifecycle.current() == LifecycleState::Initializing
            && self.lifecycle.transition(LifecycleState::Ready).is_ok()
        {
            tracing::info!(generation, "worker ready");
        }
    }

    /// Fail everything pending and restart if the budget allows.
    fn handle_crash(self: &Arc<Self>, generation: u64, cause: String) {
        let mut core = self.core();
        if core.generation != generation
            || !matches!(
                self.lifecycle.current(),
                LifecycleState::Initializing | LifecycleState::Ready
            )
        {
            tracing::debug!(generation, %cause, "ignoring stale channel failure");
            return;
        }

        let failed = core.tables.fail_all(|| Error::ChannelCrash(cause.clone()));
        if let Some(mut transport) = core.transport.take() {
            if let Err(e) = transport.close() {
                tracing::debug!("closing crashed channel: {}", e);
            }
        }
        core.stop_tasks();

        let restart = &self.config.restart;
        let restarting = core.restarts_used < restart.max_attempts;
        if self
            .lifecycle
            .transition(LifecycleState::Crashed { restarting })
            .is_err()
        {
            return;
        }

        if !restarting {
            tracing::warn!(
                %cause,
                failed,
                "worker crashed; restart budget of {} exhausted",
                restart.max_attempts
            );
            return;
        }

        let attempt = core.restarts_used;
        core.restarts_used += 1;
        let delay = restart.delay_for(attempt);
        tracing::warn!(
            %cause,
            failed,
            attempt = attempt + 1,
            ?delay,
            "worker crashed; restarting"
        );

        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.bring_up();
            }
        });
        core.tasks.push(task.abort_handle());
    }

    fn terminate(&self) {
        let mut core = self.core();
        if self.lifecycle.current() == LifecycleState::Terminated {
            tracing::debug!("worker proxy already terminated");
            return;
        }

        core.stop_tasks();
        if let Some(mut transport) = core.transport.take() {
            if let Err(e) = transport.close() {
                tracing::warn!("failed to close worker channel: {}", e);
            }
        }
        let failed = core
            .tables
            .fail_all(|| Error::ChannelUnavailable("worker proxy terminated".to_string()));
        core.generation += 1;

        if self.lifecycle.transition(LifecycleState::Terminated).is_ok() {
            tracing::info!(failed, "worker proxy terminated");
        }
    }

    /// Register and send a unary call. `None` if the worker is not ready.
    fn start_unary(
        self: &Arc<Self>,
        op: Operation,
        payload: &Option<Value>,
        progress: Option<ProgressObserver>,
    ) -> Result<Option<(String, oneshot::Receiver<Result<Value>>)>> {
        let mut core = self.core();
        if !self.accepts(op) {
            return Ok(None);
        }
        self.register_unary(&mut core, op, payload, progress).map(Some)
    }

    fn register_unary(
        self: &Arc<Self>,
        core: &mut Core,
        op: Operation,
        payload: &Option<Value>,
        progress: Option<ProgressObserver>,
    ) -> Result<(String, oneshot::Receiver<Result<Value>>)> {
        let id = self.allocate_id();
        let (tx, rx) = oneshot::channel();
        let timer = self.arm_timer(id.clone(), op);
        core.tables
            .insert_unary(id.clone(), PendingUnary::new(op.as_str(), tx, timer, progress))?;
        self.send_registered(core, &id, op, payload)?;
        Ok((id, rx))
    }

    /// Register and send a streaming call. `None` if the worker is not ready.
    fn start_stream(
        self: &Arc<Self>,
        op: Operation,
        payload: &Option<Value>,
    ) -> Result<Option<ResponseStream>> {
        let mut core = self.core();
        if !self.accepts(op) {
            return Ok(None);
        }

        let id = self.allocate_id();
        let (chunks_tx, chunks_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let timer = self.arm_timer(id.clone(), op);
        core.tables.insert_stream(
            id.clone(),
            PendingStream::new(op.as_str(), chunks_tx, outcome_tx, timer),
        )?;
        self.send_registered(&mut core, &id, op, payload)?;

        let abort_on_drop = self.config.abandon == AbandonPolicy::AbortGeneration
            && op.category() == CallCategory::Generation;
        let weak = Arc::downgrade(self);
        let stream_id = id.clone();
        let on_abandon = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.abandon_stream(&stream_id, abort_on_drop);
            }
        });

        Ok(Some(ResponseStream::new(id, chunks_rx, outcome_rx, on_abandon)))
    }

    fn accepts(&self, op: Operation) -> bool {
        match self.lifecycle.current() {
            LifecycleState::Ready => true,
            LifecycleState::Initializing => op == Operation::Init,
            _ => false,
        }
    }

    /// Send a call whose entry is already registered, evicting it on failure.
    fn send_registered(
        &self,
        core: &mut Core,
        id: &str,
        op: Operation,
        payload: &Option<Value>,
    ) -> Result<()> {
        let sent = match core.transport.as_mut() {
            Some(transport) => transport.send(Message::call(id, op.as_str(), payload.clone())),
            None => Err(Error::ChannelUnavailable("no worker channel".to_string())),
        };

        if let Err(e) = sent {
            if let Some(entry) = core.tables.take(id) {
                entry.fail(Error::ChannelUnavailable("send failed".to_string()));
            }
            return Err(e);
        }

        tracing::debug!(%id, call_type = %op, "sent call");
        Ok(())
    }

    fn arm_timer(self: &Arc<Self>, id: String, op: Operation) -> AbortHandle {
        let after = self.config.timeouts.for_category(op.category());
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(&id, after);
            }
        })
        .abort_handle()
    }

    fn expire(&self, id: &str, after: Duration) {
        let entry = self.core().tables.take(id);
        if let Some(mut entry) = entry {
            // This is the timer's own task.
            entry.disarm_timer();
            let call_type = entry.call_type().to_string();
            tracing::warn!(%id, %call_type, ?after, "worker request timed out");
            entry.fail(Error::RequestTimeout { call_type, after });
        }
    }

    fn abandon_stream(&self, id: &str, abort_generation: bool) {
        let mut core = self.core();
        let Some(entry) = core.tables.take(id) else {
            return;
        };
        tracing::debug!(%id, "stream abandoned by consumer");
        entry.fail(Error::ChannelUnavailable("stream abandoned".to_string()));

        if abort_generation {
            // Fire and forget: no entry is registered, so the reply is dropped.
            let abort_id = self.allocate_id();
            let message = Message::call(abort_id, Operation::AbortGeneration.as_str(), None);
            if let Some(transport) = core.transport.as_mut() {
                if let Err(e) = transport.send(message) {
                    tracing::debug!("could not send abortGeneration: {}", e);
                }
            }
        }
    }

    /// Route one inbound message.
    fn dispatch(self: &Arc<Self>, generation: u64, message: Message) {
        let deferred = {
            let mut core = self.core();
            if core.generation != generation {
                tracing::debug!(id = %message.id, "dropping message from stale channel");
                return;
            }
            self.route(&mut core, message)
        };

        match deferred {
            Deferred::Nothing => {}
            Deferred::Progress(observer, update) => observer(update),
            Deferred::Serve(id, kind, data) => self.serve_reverse_call(generation, id, kind, data),
            Deferred::Diagnose(diagnostic) => {
                diagnostic.log();
                if let Some(tx) = &self.diagnostics {
                    let _ = tx.send(diagnostic);
                }
            }
        }
    }

    fn route(&self, core: &mut Core, message: Message) -> Deferred {
        match message.classify() {
            Inbound::Response { id, outcome } => {
                match core.tables.take(&id) {
                    Some(Pending::Unary(entry)) => {
                        tracing::debug!(%id, "resolved call");
                        entry.resolve(
                            outcome
                                .map(|data| data.unwrap_or(Value::Null))
                                .map_err(Error::WorkerReported),
                        );
                    }
                    Some(Pending::Stream(entry)) => match outcome {
                        Ok(data) => {
                            if data.as_ref().and_then(Value::as_str) != Some(STREAM_COMPLETE) {
                                tracing::debug!(%id, "stream completed without the completion marker");
                            }
                            tracing::debug!(%id, "stream completed");
                            entry.complete();
                        }
                        Err(error) => entry.fail(Error::WorkerReported(error)),
                    },
                    None => tracing::debug!(%id, "dropping late response"),
                }
                Deferred::Nothing
            }
            Inbound::StreamChunk { id, text } => {
                if !core.tables.push_chunk(&id, text) {
                    tracing::debug!(%id, "dropping chunk for unknown stream");
                }
                Deferred::Nothing
            }
            Inbound::Progress { id, update } => match core.tables.progress_observer(&id) {
                Some(observer) => Deferred::Progress(observer, update),
                None => Deferred::Nothing,
            },
            Inbound::Call { id, kind, data, .. } => {
                if !core.tables.contains(&id) && self.bridge.handles(&kind) {
                    Deferred::Serve(id, kind, data)
                } else {
                    Deferred::Diagnose(Diagnostic::UnexpectedCall { id, kind })
                }
            }
            Inbound::Unknown(message) => Deferred::Diagnose(Diagnostic::UnknownMessage(message)),
        }
    }

    fn serve_reverse_call(
        self: &Arc<Self>,
        generation: u64,
        id: String,
        kind: String,
        data: Option<Value>,
    ) {
        let Some(serving) = self.bridge.serve(id, &kind, data) else {
            return;
        };
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let reply = serving.await;
            if let Some(inner) = weak.upgrade() {
                inner.send_reply(generation, reply);
            }
        });
    }

    fn send_reply(&self, generation: u64, reply: Message) {
        let mut core = self.core();
        if core.generation != generation {
            tracing::debug!(id = %reply.id, "dropping reply for stale channel");
            return;
        }
        if let Some(transport) = core.transport.as_mut() {
            if let Err(e) = transport.send(reply) {
                tracing::warn!("failed to send reverse call reply: {}", e);
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(PoisonError::into_inner);
        core.stop_tasks();
        if let Some(mut transport) = core.transport.take() {
            let _ = transport.close();
        }
    }
}

/// Feed one generation's events into the dispatcher.
async fn pump(weak: Weak<Inner>, generation: u64, mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match event {
            ChannelEvent::Message(message) => inner.dispatch(generation, message),
            ChannelEvent::Error(cause) => {
                inner.handle_crash(generation, cause);
                return;
            }
            ChannelEvent::Closed { code } => {
                let cause = match code {
                    Some(code) => format!("worker exited with status {}", code),
                    None => "worker exited".to_string(),
                };
                inner.handle_crash(generation, cause);
                return;
            }
        }
    }

    if let Some(inner) = weak.upgrade() {
        inner.handle_crash(generation, "worker channel closed".to_string());
    }
}
