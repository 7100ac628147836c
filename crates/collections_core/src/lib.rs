//! Persistence core for collections.
//! Maps stored collection rows to validated domain entities and back.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod store;
pub mod telemetry;

pub use config::{default_log_level, ConfigError, CoreConfig, DatabaseConfig, LoggingConfig};
pub use db::{open_store, DbError, DbResult};
pub use logging::{init_logging, logging_status, LoggingError};
pub use model::collection::{
    Collection, CollectionEdit, CollectionId, CollectionProps, CollectionType,
    CollectionValidationError, PostId,
};
pub use repo::collections_repo::CollectionsRepository;
pub use repo::mapping::MappingError;
pub use store::sqlite::{SqliteCollectionStore, SqliteTransaction};
pub use store::{
    CollectionCriteria, CollectionListQuery, CollectionOrder, CollectionOrderField,
    CollectionPostRow, CollectionRecord, CollectionRow, CollectionStore, FindOptions,
    MembershipDescriptor, SortDirection,
};
pub use telemetry::{BufferedErrorReporter, ErrorReporter, NoopErrorReporter};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
