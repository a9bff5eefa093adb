//! End-to-end consistency scenarios
//!
//! Each scenario drives the public API of the `chronicle` crate only:
//! - board: ordered and indexed link views on a project board
//! - custom_cache: an application cache kept in step with sessions
//! - cluster: nodes configured from `chronicle.toml` sharing a backend

mod fixtures;

mod board;
mod cluster;
mod custom_cache;
