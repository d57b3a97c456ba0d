//! A stateful IPv6 fragment reassembly engine.
//!
//! Fragments are buffered by `(source address, destination address, identification)` in a
//! two-level indexed structure — a hash table of sources, each holding a list of in-progress
//! flows, each holding an ordered, hole-tracking list of fragments — until either the terminal
//! fragment completes a datagram or time/memory pressure evicts it first. The whole structure is
//! guarded by a single mutex; see [`Engine`] for the public surface.

pub mod engine;
mod flow;
mod fragments;
mod header;
mod source;
mod timer;

pub use engine::{Engine, IncomingFragment, Limits};
