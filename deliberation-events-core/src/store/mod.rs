//! Concrete backends for the collaborator traits in
//! `deliberation_events_contracts`.

pub mod memory;
pub mod postgres_permanent;
pub mod redis_transient;

pub use postgres_permanent::PostgresPermanentStore;
pub use redis_transient::RedisTransientStore;
