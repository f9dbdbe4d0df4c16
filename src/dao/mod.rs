/// Database model definitions.
pub mod models;
/// Store contracts and their backends.
pub mod record_store;
/// Storage abstraction layer for database operations.
pub mod storage;
