//! Session layer: connection lifecycle, packet routing, tunnel pairing
//! and the command plane

pub mod bridge;
pub mod buffers;
pub mod commands;
pub mod manager;
pub mod models;
pub mod packet;
pub mod registry;
pub mod socket;
pub mod state_store;
pub mod tunnel_state;
pub mod waiters;
