//! Inbound request routing: message-bus subjects and websocket methods.

pub mod mq;
pub mod ws;

pub use mq::mq_routes;
pub use ws::ws_routes;
