//! termhub - shared terminal sessions for coding agents
//!
//! Each session runs one interactive agent (or shell) process, either on the
//! host or inside a sandboxed docker container, behind an
//! [`adapter::EnvironmentAdapter`]. Any number of viewers can watch and type
//! into a session; late joiners get the recent output replayed from a
//! bounded [`scrollback::ScrollbackBuffer`].
//!
//! ## Components
//!
//! - [`adapter`]: process backends and the [`adapter::AdapterFactory`]
//! - [`connection`]: per-session viewer registry and broadcast
//! - [`lifecycle`]: activity tracking, idle suspension, graceful shutdown
//! - [`hub`]: glue between the above plus the websocket server

pub mod adapter;
pub mod config;
pub mod connection;
pub mod domain;
pub mod error;
pub mod hub;
pub mod lifecycle;
pub mod scrollback;
pub mod store;

pub use domain::*;
