//! A transparent interposer for the MySQL client/server wire protocol.
//! It terminates client connections on one side, opens or reuses backend
//! connections on the other, and lets an embedded script observe, rewrite,
//! inject, or synthesize traffic at every protocol transition.
//! Two listener personalities share the core: a proxy that relays between a
//! client and a pool of backends, and a master that answers clients on its
//! own from scripted input.

#![warn(rust_2018_idioms)]

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;

pub mod discovery;
pub mod handler;
pub mod pool;
pub mod protocol;
pub mod script;
pub mod service;
pub mod session;
