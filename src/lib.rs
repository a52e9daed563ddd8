//! gosocket: a horizontally scalable real-time messaging hub.
//!
//! One instance serves WebSocket clients at `/ws`, fans published messages
//! out to local room subscribers, replicates each broadcast to peer
//! instances over a shared Redis Pub/Sub channel, and appends it to a
//! Redis Stream that the persistence worker tails through a consumer group.

pub mod bus;
pub mod config;
pub mod consumer;
pub mod persistence;
pub mod stream;
pub mod ws;
