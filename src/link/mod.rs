pub mod connection;
pub mod frame;
pub mod identity;

pub use connection::{LinkConnection, LoopbackBus, LoopbackConnection};
pub use frame::{Frame, MessageId};
pub use identity::{ClientIdentity, Endpoint, ServerIdentity, Target};
