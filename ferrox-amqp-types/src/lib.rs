#![deny(missing_docs, missing_debug_implementations)]

//! AMQP 1.0 transport-layer types
//!
//! The types defined here cover the part of the protocol a transport engine
//! needs to speak: performatives, the definitions they refer to, delivery
//! states and the state enums of connections, sessions and links.
//! Everything is encoded with [`serde_amqp`].

#[macro_use]
mod macros;

pub mod definitions;
pub mod messaging;
pub mod performatives;
pub mod states;
