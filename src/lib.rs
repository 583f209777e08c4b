//! loopwire - same-host IPC over TCP loopback and Unix domain sockets
//!
//! A compact tagged binary wire format, a typed packet model, and a
//! dispatch runtime with fire-and-forget sends, predicate-based waits and
//! request/response exchanges.

pub mod config;
pub mod discovery;
pub mod network;
pub mod protocol;
