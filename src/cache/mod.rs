//! Normalized client-side cache.
//!
//! - Entities live once per collection, keyed by id, with relations held as
//!   id references
//! - Query results are cached by query key as references only, so every read
//!   re-resolves through the entity maps
//! - Deleting an entity nulls every reference to it, in entities and in
//!   cached results
//! - Pending binding calls are shared per query key

mod entity_store;
mod inflight;
mod normalize;
mod query_cache;
mod store;

pub use entity_store::{Entity, EntityId, EntityStore, FieldSnapshot};
pub use inflight::{InFlightTable, SharedResponse};
pub use normalize::{denormalize, normalize};
pub use query_cache::{merge_page, CachedQuery, Page, Pagination, QueryCache, QueryResult};
pub use store::{Store, StoreEvent, Transaction};
