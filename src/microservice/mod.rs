//! Building blocks shared by the protocol microservices: the request / reply
//! call engine with retries, and the command arbitration server.

mod call_engine;
mod command_messages;
mod command_server;

pub use call_engine::{CallEngine, CallError, CallOptions, FrameSubscription};
pub use command_messages::{CommandAck, CommandRequest, CommandResult, COMMAND_ACK_MESSAGE_ID, COMMAND_REQUEST_MESSAGE_ID};
pub use command_server::{CommandHandler, CommandServer};
