//! Single-flight request scheduling over one worker session.
//!
//! Neither wire protocol carries a correlation id, so at most one request
//! may await a reply at any instant; replies match requests strictly in
//! send order. The session runs as one event-loop task that exclusively
//! owns the transport; editor-driven callers talk to it through a command
//! channel and get their reply through a oneshot handle.
//!
//! While a request is in flight, a newly arriving request is either
//! coalesced (default: only the most recent input is remembered and
//! dispatched once the in-flight reply lands) or dropped with a null
//! result, per [`DispatchPolicy`]. The policy is fixed per session.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::bridge::codec::{CodecError, FrameStyle};
use crate::bridge::protocol::{CheckReply, CheckRequest};
use crate::error::BridgeError;
use crate::transport::Transport;

const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// What to do with a request that arrives while one is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchPolicy {
    /// Remember only the latest input; dispatch it when the in-flight
    /// reply lands. No editor event is silently lost.
    #[default]
    Coalesce,
    /// Discard the new request; its caller gets `Ok(None)`.
    DropWhileBusy,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub frame_style: FrameStyle,
    /// Bound on one reply round-trip. `None` waits until worker death.
    pub reply_timeout: Option<Duration>,
    pub policy: DispatchPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            frame_style: FrameStyle::default(),
            reply_timeout: Some(Duration::from_secs(30)),
            policy: DispatchPolicy::default(),
        }
    }
}

type ReplyTx = oneshot::Sender<Result<Option<CheckReply>, BridgeError>>;

enum SessionCommand {
    Check {
        request: CheckRequest,
        reply_tx: ReplyTx,
    },
    Shutdown,
}

/// Handle to a running session event loop.
///
/// Dropping the handle closes the command channel, which ends the loop and
/// closes the worker's input stream.
pub struct Session {
    cmd_tx: mpsc::Sender<SessionCommand>,
}

impl Session {
    /// Start the event loop over the given worker streams.
    pub fn spawn<R, W>(reader: R, writer: W, config: SessionConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let transport = Transport::new(reader, writer, config.frame_style);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        tokio::spawn(
            SessionLoop {
                transport,
                config,
                pending: None,
                queued: None,
                stale_replies: 0,
            }
            .run(cmd_rx),
        );
        Self { cmd_tx }
    }

    /// Submit one check. `Ok(None)` means the request was discarded under
    /// [`DispatchPolicy::DropWhileBusy`].
    pub async fn check(&self, request: CheckRequest) -> Result<Option<CheckReply>, BridgeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Check { request, reply_tx })
            .await
            .map_err(|_| BridgeError::WorkerExited)?;
        reply_rx.await.map_err(|_| BridgeError::WorkerExited)?
    }

    pub fn is_alive(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    /// Stop the loop, failing any pending request immediately, and wait
    /// for it to release the worker's streams.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Shutdown).await;
        self.cmd_tx.closed().await;
    }
}

/// One outstanding round-trip: the sole in-flight request per session.
struct Pending {
    waiters: Vec<ReplyTx>,
    sent: CheckRequest,
    sent_at: Instant,
}

struct SessionLoop<R, W> {
    transport: Transport<R, W>,
    config: SessionConfig,
    pending: Option<Pending>,
    queued: Option<(CheckRequest, Vec<ReplyTx>)>,
    /// Replies owed by the worker for requests that already timed out.
    /// FIFO ordering means they arrive before any live reply and must be
    /// discarded, not matched to the next request.
    stale_replies: usize,
}

impl<R, W> SessionLoop<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<SessionCommand>) {
        loop {
            let deadline = match (&self.pending, self.config.reply_timeout) {
                (Some(p), Some(timeout)) => Some(p.sent_at + timeout),
                _ => None,
            };
            let timer = tokio::time::sleep_until(
                deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400)),
            );

            tokio::select! {
                biased;

                cmd = cmd_rx.recv() => match cmd {
                    Some(SessionCommand::Check { request, reply_tx }) => {
                        if !self.accept(request, reply_tx).await {
                            break;
                        }
                    }
                    Some(SessionCommand::Shutdown) | None => {
                        self.fail_all();
                        break;
                    }
                },

                frame = self.transport.receive() => match frame {
                    Some(Ok(value)) => {
                        if !self.on_frame(value).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        // An undecodable body leaves the stream usable; I/O
                        // and oversized-frame errors are followed by
                        // end-of-stream on the next receive.
                        tracing::warn!(error = %e, "framing error on worker stream");
                        if let Some(p) = self.pending.take() {
                            let desc = e.to_string();
                            fail_waiters(p.waiters, || framing_error(&desc));
                        }
                        if !self.flush_queued(None).await {
                            break;
                        }
                    }
                    None => {
                        tracing::warn!("worker closed its output stream");
                        self.fail_all();
                        break;
                    }
                },

                _ = timer, if deadline.is_some() => {
                    if let Some(p) = self.pending.take() {
                        tracing::warn!("no reply within the configured timeout");
                        fail_waiters(p.waiters, || BridgeError::Timeout);
                        self.stale_replies += 1;
                    }
                    if !self.flush_queued(None).await {
                        break;
                    }
                }
            }
        }

        tracing::debug!("session event loop exiting");
    }

    /// Handle a new request per the session state and policy. Returns
    /// false when the session is no longer usable.
    async fn accept(&mut self, request: CheckRequest, reply_tx: ReplyTx) -> bool {
        if self.pending.is_none() {
            return self.dispatch(request, vec![reply_tx]).await;
        }

        match self.config.policy {
            DispatchPolicy::DropWhileBusy => {
                tracing::debug!("request dropped while a check is in flight");
                let _ = reply_tx.send(Ok(None));
            }
            DispatchPolicy::Coalesce => match &mut self.queued {
                Some((queued, waiters)) => {
                    *queued = request;
                    waiters.push(reply_tx);
                }
                None => self.queued = Some((request, vec![reply_tx])),
            },
        }
        true
    }

    /// Handle one decoded payload from the worker.
    async fn on_frame(&mut self, value: serde_json::Value) -> bool {
        if self.stale_replies > 0 {
            self.stale_replies -= 1;
            tracing::debug!("discarding reply to a timed-out request");
            return true;
        }

        let Some(p) = self.pending.take() else {
            tracing::warn!("unexpected frame while idle, ignoring");
            return true;
        };

        match serde_json::from_value::<CheckReply>(value) {
            Ok(reply) => {
                for waiter in p.waiters {
                    let _ = waiter.send(Ok(Some(reply.clone())));
                }
                self.flush_queued(Some((&p.sent, &reply))).await
            }
            Err(e) => {
                tracing::warn!(error = %e, "worker reply missing required fields");
                let desc = e.to_string();
                fail_waiters(p.waiters, || {
                    BridgeError::Protocol(format!("invalid reply: {desc}"))
                });
                self.flush_queued(None).await
            }
        }
    }

    async fn dispatch(&mut self, request: CheckRequest, waiters: Vec<ReplyTx>) -> bool {
        match self.transport.send(request.clone()).await {
            Ok(()) => {
                self.pending = Some(Pending {
                    waiters,
                    sent: request,
                    sent_at: Instant::now(),
                });
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to send request to worker");
                fail_waiters(waiters, || BridgeError::WorkerExited);
                self.fail_all();
                false
            }
        }
    }

    /// After the in-flight slot frees up, serve the coalesced input: send
    /// it unless it matches what was just answered, in which case its
    /// waiters get the same reply.
    async fn flush_queued(&mut self, answered: Option<(&CheckRequest, &CheckReply)>) -> bool {
        let Some((request, waiters)) = self.queued.take() else {
            return true;
        };

        if let Some((sent, reply)) = answered
            && *sent == request
        {
            for waiter in waiters {
                let _ = waiter.send(Ok(Some(reply.clone())));
            }
            return true;
        }

        self.dispatch(request, waiters).await
    }

    fn fail_all(&mut self) {
        if let Some(p) = self.pending.take() {
            fail_waiters(p.waiters, || BridgeError::WorkerExited);
        }
        if let Some((_, waiters)) = self.queued.take() {
            fail_waiters(waiters, || BridgeError::WorkerExited);
        }
    }
}

fn fail_waiters(waiters: Vec<ReplyTx>, make: impl Fn() -> BridgeError) {
    for waiter in waiters {
        let _ = waiter.send(Err(make()));
    }
}

fn framing_error(desc: &str) -> BridgeError {
    BridgeError::Framing(CodecError::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        desc.to_string(),
    )))
}
