//! The high-level operations on a [`Repository`](crate::Repository).

pub mod backup;
pub mod check;
pub mod compact;
pub mod config;
pub mod forget;
pub(crate) mod recreate;
pub mod restore;
