//! Client-facing transport: WebSocket endpoint and frame formats.

pub mod wire;
pub mod ws;

pub use wire::{server_frame, ClientFrame, ServerFrame};
pub use ws::{ws_router, WsState};
