//! Core data carried by the network
//!
//! Only blocks travel over this p2p layer today.

pub mod block;

pub use block::Block;
