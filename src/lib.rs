//! Local image vault: uploads are validated, squeezed into a byte window by
//! an off-task optimizer, stored in SQLite and served back through
//! same-origin virtual paths.

pub mod config;
pub mod context;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
pub mod validation;
