pub mod app;
pub mod domain;
pub mod error;
pub mod infra;
pub mod storage;

// Convenience re-exports (keeps call-sites clean)
pub use app::record_service::{RecordService, RecordServiceBuilder};
pub use domain::record::{FieldValue, FillOptions, Identity, Record, Reference, RelationRegistry, SharedRecord};
pub use domain::schema::{
    CacheOptions, ChildCollection, FieldValidation, FilePolicy, RelationField, SchemaDescriptor, SchemaRegistry,
};
pub use domain::validate::{Validator, ValidatorOptions, ValidatorSet};
pub use error::{Fault, FaultKind, FaultResult, StoreError, StoreResult};
