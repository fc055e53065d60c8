//! Application services: tree queries, the cache-backed read facade, the
//! category write path and background flush jobs.

pub mod catalog;
pub mod categories;
pub mod error;
pub mod jobs;
pub mod repos;
pub mod tree;
