use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::select;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::link::{ClientIdentity, Endpoint, Frame, LinkConnection};

/// Why a call did not produce a reply.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("{name}: no reply after {attempts} attempts of {timeout:?} each")]
    Timeout {
        name: &'static str,
        attempts: u8,
        timeout: Duration,
    },
    #[error("{name}: cancelled by caller")]
    Cancelled { name: &'static str },
    #[error("{name}: sending request failed: {source}")]
    Send {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

/// Retry policy for a single logical call.
#[derive(Debug, Clone, Copy)]
pub struct CallOptions {
    pub attempts: u8,
    pub timeout_per_attempt: Duration,
}
impl Default for CallOptions {
    fn default() -> Self {
        CallOptions {
            attempts: 5,
            timeout_per_attempt: Duration::from_secs(1),
        }
    }
}

/// Request / reply on top of a lossy broadcast link: send a request frame, then
/// pick the reply out of the shared frame stream by an application provided
/// predicate, resending the request on timeout.
///
/// Correlation is entirely the predicate's business - the link itself has no
/// notion of which frame answers which request.
pub struct CallEngine {
    connection: Arc<dyn LinkConnection>,
    identity: ClientIdentity,
}

impl CallEngine {
    pub fn new(connection: Arc<dyn LinkConnection>, identity: ClientIdentity) -> CallEngine {
        CallEngine { connection, identity }
    }

    pub fn identity(&self) -> ClientIdentity {
        self.identity
    }

    /// Fire-and-forget send of a single frame, stamped with this client's
    /// sender address and the connection's next link sequence number.
    pub async fn send(&self, mut frame: Frame) -> anyhow::Result<()> {
        frame.sender = self.identity.local;
        frame.sequence = self.connection.next_sequence();
        self.connection.send_frame(frame).await
    }

    /// Long lived subscription to all frames addressed to this client that
    /// match the given predicate.
    pub fn subscribe(&self, matches: impl Fn(&Frame) -> bool + Send + 'static) -> FrameSubscription {
        FrameSubscription {
            rx: self.connection.subscribe_frames(),
            local: self.identity.local,
            matches: Box::new(matches),
        }
    }

    /// Send `request` and wait for a frame accepted by `matches`, retrying per
    /// `options`. The reply subscription is opened before the first send, so a
    /// reply to any attempt - including a late reply to an earlier one - wins.
    pub async fn call<T>(
        &self,
        name: &'static str,
        request: Frame,
        options: CallOptions,
        matches: impl Fn(&Frame) -> bool,
        extract: impl FnOnce(Frame) -> T,
        cancel: &CancellationToken,
    ) -> Result<T, CallError> {
        self.call_with_retry_hook(name, request, options, matches, extract, |_, _| {}, cancel).await
    }

    /// Like [CallEngine::call], but invokes `on_retry` with the request frame
    /// and the attempt number before every resend, allowing the caller to
    /// adjust the payload (e.g. bump a confirmation counter).
    #[allow(clippy::too_many_arguments)]
    pub async fn call_with_retry_hook<T>(
        &self,
        name: &'static str,
        mut request: Frame,
        options: CallOptions,
        matches: impl Fn(&Frame) -> bool,
        extract: impl FnOnce(Frame) -> T,
        mut on_retry: impl FnMut(&mut Frame, u8) + Send,
        cancel: &CancellationToken,
    ) -> Result<T, CallError> {
        // subscribing before the first send ensures no reply can slip past
        let mut rx = self.connection.subscribe_frames();

        for attempt in 0..options.attempts {
            if cancel.is_cancelled() {
                return Err(CallError::Cancelled { name });
            }
            if attempt > 0 {
                warn!("{}: no reply within {:?}, resending (attempt {} of {})", name, options.timeout_per_attempt, attempt + 1, options.attempts);
                on_retry(&mut request, attempt);
            }

            request.sender = self.identity.local;
            request.sequence = self.connection.next_sequence();
            trace!("{}: sending {:?}", name, request.message_id);
            self.connection.send_frame(request.clone()).await
                .map_err(|source| CallError::Send { name, source })?;

            let deadline = Instant::now() + options.timeout_per_attempt;
            loop {
                select! {
                    _ = cancel.cancelled() => {
                        debug!("{}: cancelled while waiting for reply", name);
                        return Err(CallError::Cancelled { name });
                    }
                    _ = sleep_until(deadline) => {
                        break;
                    }
                    received = rx.recv() => {
                        match received {
                            Ok(frame) => {
                                if frame.target.accepts(self.identity.local) && matches(&frame) {
                                    trace!("{}: received reply {:?}", name, frame.message_id);
                                    return Ok(extract(frame));
                                }
                            }
                            Err(RecvError::Lagged(n)) => {
                                warn!("{}: frame subscription lagged, {} frames lost", name, n);
                            }
                            Err(RecvError::Closed) => {
                                // the link is gone; run down the attempt clock rather than spin
                                sleep_until(deadline).await;
                                break;
                            }
                        }
                    }
                }
            }
        }

        error!("{}: no reply after {} attempts of {:?} each", name, options.attempts, options.timeout_per_attempt);
        Err(CallError::Timeout {
            name,
            attempts: options.attempts,
            timeout: options.timeout_per_attempt,
        })
    }
}

/// A filtered view on the link's frame stream, yielding only frames addressed
/// to the local endpoint that pass the predicate.
pub struct FrameSubscription {
    rx: tokio::sync::broadcast::Receiver<Frame>,
    local: Endpoint,
    matches: Box<dyn Fn(&Frame) -> bool + Send>,
}

impl FrameSubscription {
    /// The next matching frame, or None once the link is closed. Lagging is
    /// logged and skipped over - for lossy-bus protocols a lost frame is
    /// indistinguishable from one lost on the wire anyway.
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => {
                    if frame.target.accepts(self.local) && (self.matches)(&frame) {
                        return Some(frame);
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!("frame subscription lagged, {} frames lost", n);
                }
                Err(RecvError::Closed) => {
                    return None;
                }
            }
        }
    }
}
