use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::link::{Endpoint, Frame, LinkConnection, ServerIdentity, Target};
use crate::microservice::command_messages::{CommandAck, CommandRequest, CommandResult, COMMAND_ACK_MESSAGE_ID, COMMAND_REQUEST_MESSAGE_ID};

/// Application callback executing one command. Implementations run without any lock held,
///  but the server guarantees that at most one of them runs at a time.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn execute(&self, from: Endpoint, request: &CommandRequest) -> anyhow::Result<CommandResult>;
}

/// Serializing server side of the command protocol: dispatches requests to registered
///  handlers, running at most one command at a time.
///
/// A request arriving while a command is in flight is answered with
///  [CommandResult::TemporarilyRejected] - unless it is a retry of that very command
///  (same command id, confirmation > 0), which is dropped silently because the reply to
///  the original attempt is still on its way.
pub struct CommandServer {
    connection: Arc<dyn LinkConnection>,
    identity: ServerIdentity,
    handlers: RwLock<FxHashMap<u16, Arc<dyn CommandHandler>>>,
    busy: AtomicBool,
    /// command id of the in-flight command, or -1 when idle
    current_command: AtomicI32,
}

impl CommandServer {
    pub fn new(connection: Arc<dyn LinkConnection>, identity: ServerIdentity) -> CommandServer {
        CommandServer {
            connection,
            identity,
            handlers: RwLock::new(FxHashMap::default()),
            busy: AtomicBool::new(false),
            current_command: AtomicI32::new(-1),
        }
    }

    pub async fn register_handler(&self, command: u16, handler: Arc<dyn CommandHandler>) {
        let prev = self.handlers.write().await
            .insert(command, handler);
        if prev.is_some() {
            warn!("replacing handler for command {}", command);
        }
    }

    /// The server's receive loop. Does not return as long as the link is up.
    pub async fn run(self: &Arc<Self>) {
        use tokio::sync::broadcast::error::RecvError;

        let mut rx = self.connection.subscribe_frames();
        loop {
            let frame = match rx.recv().await {
                Ok(frame) => frame,
                Err(RecvError::Lagged(n)) => {
                    warn!("command server lagged, {} frames lost", n);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if frame.message_id != COMMAND_REQUEST_MESSAGE_ID || !frame.target.accepts(self.identity.local) {
                continue;
            }
            let request = match CommandRequest::deser(frame.payload.clone()) {
                Ok(request) => request,
                Err(e) => {
                    warn!("dropping malformed command request from {:?}: {}", frame.sender, e);
                    continue;
                }
            };

            let server = self.clone();
            tokio::spawn(async move {
                server.on_request(frame.sender, request).await;
            });
        }
        debug!("link closed, command server terminating");
    }

    async fn on_request(&self, from: Endpoint, request: CommandRequest) {
        if self.busy.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            let in_flight = self.current_command.load(Ordering::SeqCst);
            if in_flight == request.command as i32 && request.confirmation != 0 {
                // a retry of the command we are already executing: the original attempt's
                //  ack will answer it
                debug!("dropping retry of in-flight command {} from {:?}", request.command, from);
                return;
            }
            warn!("rejecting command {} from {:?}: command {} still in flight", request.command, from, in_flight);
            self.send_ack(from, request.command, CommandResult::TemporarilyRejected).await;
            return;
        }
        let _busy_guard = ClearOnDrop(&self.busy);
        self.current_command.store(request.command as i32, Ordering::SeqCst);

        let handler = self.handlers.read().await
            .get(&request.command)
            .cloned();
        let Some(handler) = handler else {
            self.current_command.store(-1, Ordering::SeqCst);
            warn!("no handler for command {} from {:?}", request.command, from);
            self.send_ack(from, request.command, CommandResult::Unsupported).await;
            return;
        };

        let result = match handler.execute(from, &request).await {
            Ok(result) => result,
            Err(e) => {
                error!("handler for command {} failed: {}", request.command, e);
                CommandResult::TemporarilyRejected
            }
        };
        self.current_command.store(-1, Ordering::SeqCst);
        self.send_ack(from, request.command, result).await;
    }

    async fn send_ack(&self, to: Endpoint, command: u16, result: CommandResult) {
        let ack = CommandAck { command, result };
        let mut frame = Frame::new(COMMAND_ACK_MESSAGE_ID, Target::to(to), ack.ser_to_bytes());
        frame.sender = self.identity.local;
        frame.sequence = self.connection.next_sequence();
        if let Err(e) = self.connection.send_frame(frame).await {
            error!("sending command ack to {:?} failed: {}", to, e);
        }
    }
}

/// Clears the busy flag when dropped, so a panicking handler cannot wedge the server.
struct ClearOnDrop<'a>(&'a AtomicBool);
impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
