//! Gateway: HTTP + WebSocket surface for the chat protocol.
//!
//! Single port serves `/health`, `/` and `/ws`. Each WebSocket frame is one JSON object;
//! see [`protocol`] for the frame vocabulary.

mod connection;
pub mod protocol;
mod server;

pub use protocol::{
    parse_client_frame, ActionKind, ActionStatus, ChatParams, ClientFrame, FrameError, ResetParams,
    ServerFrame, TextStatus, WireUsage,
};
pub use server::{router, run_gateway, serve, GatewayState};
