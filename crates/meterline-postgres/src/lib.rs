//! Meterline Postgres - Store backend over sqlx
//!
//! Nodes live in a `nodes` table whose JSONB `props` carry the canonical path
//! (unique). Samples live in `history`, unique per `(node_id, dataitem_id, time)`.

pub mod schema;
pub mod store;

pub use store::{mask_url, PgError, PgOptions, PgStore};
