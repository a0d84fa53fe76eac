//! Shared plumbing for the SQLBridge listeners: configuration, the common
//! error type, and the framed socket channel every protocol service is built
//! on.

#![warn(rust_2018_idioms)]

#[macro_use]
extern crate lazy_static;

pub mod common;
pub mod config;
pub mod service;
