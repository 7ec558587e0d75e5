//! Typed wire messages exchanged with the live endpoint.
//!
//! Every message is a JSON object with exactly one top-level key naming its
//! kind (`setup`, `realtimeInput`, `toolResponse` outbound; `serverContent`,
//! `toolCall`, ... inbound).

pub mod client_messages;
pub mod models;
pub mod server_messages;
