//! The OpalDB query execution engine.
//!
//! This crate evaluates a compiled query plan by streaming batches of rows
//! ("blocks") through a tree of pipeline operators. Local work is executed
//! directly against the storage layer; remote work is forwarded to peer
//! DB-servers over HTTP. Parsing, planning, storage and transport are
//! external collaborators injected at engine construction.

#[macro_use]
extern crate tracing;

#[macro_use]
mod mac;

#[doc(hidden)]
pub mod cluster;
#[doc(hidden)]
pub mod cnf;
#[doc(hidden)]
pub mod ctx;
#[doc(hidden)]
pub mod dbs;
#[doc(hidden)]
pub mod err;
#[doc(hidden)]
pub mod kvs;
#[doc(hidden)]
pub mod plan;
#[doc(hidden)]
pub mod val;
