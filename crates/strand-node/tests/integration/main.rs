//! Integration test entry point for strand-node.
//!
//! Run with: cargo test --test integration

mod harness;
mod connect;
mod keepalive;
mod lifecycle;
mod messaging;
