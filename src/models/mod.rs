//! Core data models for the image vault.
//!
//! `StoredObject` maps onto the `stored_objects` table via `sqlx::FromRow`;
//! `MediaType` is the closed set of formats every component agrees on.

pub mod media_type;
pub mod stored_object;
