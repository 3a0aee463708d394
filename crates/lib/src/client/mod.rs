//! Client reconnector: the chat-side state machine and its reconnecting WebSocket loop.

mod connection;
mod state;
pub mod store;

pub use connection::{run_client, ClientCommand, ClientOptions, RECONNECT_DELAY};
pub use state::{ClientError, ClientState, ClientUpdate, ConnectionStatus};
