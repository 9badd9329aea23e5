//! Wiring between editor events and the checker session.
//!
//! The controller owns the worker process and its session, turns text
//! change/save events into check requests, and publishes the mapped
//! diagnostics. Framing, protocol, and timeout failures are absorbed
//! here; only a failed launch ever reaches the user, and only once.

use std::sync::Arc;
use std::time::Duration;

use crate::bridge::protocol::{CheckConfig, CheckReply, CheckRequest};
use crate::diagnostics::{DiagnosticsSink, map_reply};
use crate::error::BridgeError;
use crate::scheduler::{Session, SessionConfig};
use crate::supervisor::{WorkerConfig, WorkerProcess, WorkerSpawner, YueSpawner};

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub worker: WorkerConfig,
    pub session: SessionConfig,
    /// Project configuration forwarded with every request, if any.
    pub check_config: Option<CheckConfig>,
    pub shutdown_grace: Duration,
}

impl ControllerConfig {
    pub fn new(worker: WorkerConfig) -> Self {
        Self {
            worker,
            session: SessionConfig::default(),
            check_config: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_check_config(mut self, config: CheckConfig) -> Self {
        self.check_config = Some(config);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

pub struct BridgeController {
    config: ControllerConfig,
    spawner: Box<dyn WorkerSpawner>,
    sink: Arc<dyn DiagnosticsSink>,
    session: Option<Session>,
    process: Option<WorkerProcess>,
    launch_failed: bool,
    stopped: bool,
}

impl BridgeController {
    pub fn new(config: ControllerConfig, sink: Arc<dyn DiagnosticsSink>) -> Self {
        Self::with_spawner(config, sink, Box::new(YueSpawner))
    }

    pub fn with_spawner(
        config: ControllerConfig,
        sink: Arc<dyn DiagnosticsSink>,
        spawner: Box<dyn WorkerSpawner>,
    ) -> Self {
        Self {
            config,
            spawner,
            sink,
            session: None,
            process: None,
            launch_failed: false,
            stopped: false,
        }
    }

    /// Launch the worker and open a session. A launch failure is fatal:
    /// the user is notified once and later events become no-ops.
    pub async fn start(&mut self) -> Result<(), BridgeError> {
        match self.launch() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.mark_launch_failed(&e).await;
                Err(e)
            }
        }
    }

    /// Shut the session down, failing any pending request, then stop the
    /// worker process.
    pub async fn stop(&mut self) {
        self.stopped = true;
        self.discard_session().await;
    }

    pub async fn text_changed(&mut self, uri: &str, text: &str) {
        self.handle_event(uri, text, false).await;
    }

    pub async fn text_saved(&mut self, uri: &str, text: &str) {
        self.handle_event(uri, text, true).await;
    }

    async fn handle_event(&mut self, uri: &str, text: &str, saved: bool) {
        if !self.ensure_session().await {
            return;
        }

        let mut request = CheckRequest::new(text);
        if let Some(config) = &self.config.check_config {
            request = request.with_config(config.clone());
        }
        if saved {
            request = request.on_save();
        }

        let result = match &self.session {
            Some(session) => session.check(request).await,
            None => return,
        };

        match result {
            Ok(Some(reply)) => self.publish(uri, text, &reply).await,
            Ok(None) => {
                tracing::debug!(uri, "check skipped while busy, diagnostics unchanged");
            }
            Err(BridgeError::WorkerExited) => {
                // The next event respawns the worker.
                tracing::warn!(uri, "worker exited during check");
                self.discard_session().await;
            }
            Err(e) => {
                tracing::warn!(uri, error = %e, "check failed, diagnostics unchanged");
            }
        }
    }

    async fn publish(&self, uri: &str, source: &str, reply: &CheckReply) {
        let diagnostics = map_reply(reply, source);
        if reply.success && diagnostics.is_empty() {
            self.sink.clear_diagnostics(uri).await;
        } else {
            self.sink.set_diagnostics(uri, diagnostics).await;
        }
        if let Some(code) = &reply.transpiled_code {
            tracing::debug!(bytes = code.len(), "worker returned transpiled output");
        }
    }

    /// True when a live session exists afterwards. Respawns a dead
    /// worker, except after `stop` or a failed launch.
    async fn ensure_session(&mut self) -> bool {
        if self.stopped || self.launch_failed {
            return false;
        }
        if self.session.as_ref().is_some_and(Session::is_alive) {
            return true;
        }

        self.discard_session().await;
        match self.launch() {
            Ok(()) => true,
            Err(e) => {
                self.mark_launch_failed(&e).await;
                false
            }
        }
    }

    fn launch(&mut self) -> Result<(), BridgeError> {
        let mut process = WorkerProcess::spawn(self.spawner.as_ref(), &self.config.worker)?;
        let (stdin, stdout) = process.take_stdio()?;
        tracing::info!(pid = ?process.id(), "checker worker started");
        self.session = Some(Session::spawn(stdout, stdin, self.config.session.clone()));
        self.process = Some(process);
        Ok(())
    }

    async fn mark_launch_failed(&mut self, error: &BridgeError) {
        tracing::error!(error = %error, "could not start checker worker");
        self.launch_failed = true;
        self.sink
            .notify_error(&format!("failed to start the YueScript checker: {error}"))
            .await;
    }

    async fn discard_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.shutdown().await;
        }
        if let Some(process) = self.process.take() {
            process.stop(self.config.shutdown_grace).await;
        }
    }
}
