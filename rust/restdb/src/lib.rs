//! Typed row-API client for the hosted relational backend.
//!
//! The surface is a narrow [`Querier`] trait (select, insert, update,
//! delete, count) plus a [`SelectQuery`] builder mirroring the backend's
//! `from(table).select(...).eq(...).order(...).range(...)` dialect.
//! [`HttpQuerier`] is the production implementation; [`MemoryQuerier`] is an
//! in-process table store for tests.

mod error;
mod http;
mod memory;
mod query;
mod querier;

pub use error::{DbError, Result};
pub use http::{HttpConfig, HttpQuerier};
pub use memory::MemoryQuerier;
pub use query::{Direction, Filter, FilterOp, SelectQuery};
pub use querier::{maybe_single, single, Querier};
