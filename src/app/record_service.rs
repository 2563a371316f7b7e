//! The record service.
//!
//! Bundles the collaborators every record consumes: the query backend, the
//! cache store, the file store, the validator set and the schema registry.
//! Records hold an `Arc<RecordService>` and never reach for ambient state.

use crate::domain::record::{Identity, Record};
use crate::domain::schema::{SchemaDescriptor, SchemaRegistry};
use crate::domain::validate::ValidatorSet;
use crate::error::{Fault, FaultResult};
use crate::infra::config::{self, CacheBackend};
use crate::storage::backend::{MemoryBackend, PgBackend, QueryBackend, Row};
use crate::storage::cache::{CacheStore, MemoryCache, NoCache, PostgresCache};
use crate::storage::files::{FileStore, HttpFileStore, LocalFileStore, MemoryFileStore};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

pub struct RecordService {
    backend: Arc<dyn QueryBackend>,
    cache: Arc<dyn CacheStore>,
    files: Arc<dyn FileStore>,
    validators: ValidatorSet,
    schemas: SchemaRegistry,
    strict_relations: bool,
    cache_ttl: Option<Duration>,
}

/// Assembles a [`RecordService`]. Collaborators left unset default to the
/// in-memory backend, no cache and the in-memory file store.
pub struct RecordServiceBuilder {
    schemas: SchemaRegistry,
    backend: Option<Arc<dyn QueryBackend>>,
    cache: Option<Arc<dyn CacheStore>>,
    files: Option<Arc<dyn FileStore>>,
    validators: ValidatorSet,
    strict_relations: bool,
    cache_ttl: Option<Duration>,
}

impl RecordServiceBuilder {
    pub fn backend(mut self, backend: Arc<dyn QueryBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn files(mut self, files: Arc<dyn FileStore>) -> Self {
        self.files = Some(files);
        self
    }

    pub fn validators(mut self, validators: ValidatorSet) -> Self {
        self.validators = validators;
        self
    }

    pub fn strict_relations(mut self, strict: bool) -> Self {
        self.strict_relations = strict;
        self
    }

    pub fn cache_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn build(self) -> Arc<RecordService> {
        Arc::new(RecordService {
            backend: self.backend.unwrap_or_else(|| Arc::new(MemoryBackend::new())),
            cache: self.cache.unwrap_or_else(|| Arc::new(NoCache)),
            files: self.files.unwrap_or_else(|| Arc::new(MemoryFileStore::new())),
            validators: self.validators,
            schemas: self.schemas,
            strict_relations: self.strict_relations,
            cache_ttl: self.cache_ttl,
        })
    }
}

impl RecordService {
    pub fn builder(schemas: SchemaRegistry) -> RecordServiceBuilder {
        RecordServiceBuilder {
            schemas,
            backend: None,
            cache: None,
            files: None,
            validators: ValidatorSet::standard(),
            strict_relations: false,
            cache_ttl: None,
        }
    }

    /// Builds the Postgres-backed service from the environment.
    ///
    /// Without an explicit registry the schemas are loaded from
    /// `record_schemas`.
    pub async fn connect(schemas: Option<SchemaRegistry>) -> anyhow::Result<Arc<Self>> {
        config::load_env();
        let database_url = config::database_url()?;
        let backend = PgBackend::connect(&database_url, config::database_max_connections()?).await?;
        let pool = backend.pool().clone();

        let schemas = match schemas {
            Some(s) => s,
            None => {
                SchemaRegistry::install_schema_table(&pool).await?;
                SchemaRegistry::load_from_db(&pool).await?
            }
        };
        schemas.check_references()?;

        let ttl = config::cache_ttl()?;
        let cache: Arc<dyn CacheStore> = match config::cache_backend()? {
            CacheBackend::Memory => Arc::new(MemoryCache::new().with_ttl(ttl)),
            CacheBackend::Postgres => {
                let cache = PostgresCache::new(pool, ttl);
                cache.install().await?;
                Arc::new(cache)
            }
            CacheBackend::Disabled => Arc::new(NoCache),
        };

        let files: Arc<dyn FileStore> = match config::file_store_endpoint() {
            Some(endpoint) => Arc::new(HttpFileStore::new(endpoint)?),
            None => Arc::new(LocalFileStore::new(
                config::file_store_root(),
                config::file_store_base_uri(),
            )),
        };

        tracing::info!(
            entities = schemas.len(),
            strict_relations = config::strict_relations(),
            "record service connected"
        );

        Ok(Self::builder(schemas)
            .backend(Arc::new(backend))
            .cache(cache)
            .files(files)
            .strict_relations(config::strict_relations())
            .cache_ttl(ttl)
            .build())
    }

    pub fn backend(&self) -> &Arc<dyn QueryBackend> {
        &self.backend
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    pub fn files(&self) -> &Arc<dyn FileStore> {
        &self.files
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn strict_relations(&self) -> bool {
        self.strict_relations
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl
    }

    /// Descriptor of a registered entity.
    pub fn schema(&self, entity: &str) -> FaultResult<Arc<SchemaDescriptor>> {
        self.schemas
            .get(entity)
            .ok_or_else(|| Fault::server(format!("Unknown entity {}", entity)))
    }

    /// Constructs a record of `entity` from a field bag (a JSON object).
    pub fn record(self: &Arc<Self>, entity: &str, bag: JsonValue) -> FaultResult<Record> {
        let bag = match bag {
            JsonValue::Object(map) => map,
            JsonValue::Null => Row::new(),
            other => {
                return Err(Fault::client(format!("{} data must be an object", entity)).with_cause(other))
            }
        };
        Record::new(self.clone(), self.schema(entity)?, bag)
    }

    /// Constructs and fills a record located by an id, a uuid or a bag of uniques.
    pub async fn find(self: &Arc<Self>, entity: &str, locator: JsonValue) -> FaultResult<Record> {
        let bag = match Identity::classify(&locator) {
            Some(identity) => JsonValue::Object(identity.to_bag()),
            None => locator,
        };
        let mut record = self.record(entity, bag)?;
        record.fill().await?;
        Ok(record)
    }

    /// A hydrated record built from a row the caller already fetched.
    pub fn from_row(self: &Arc<Self>, entity: &str, row: Row) -> FaultResult<Record> {
        let mut record = Record::new(self.clone(), self.schema(entity)?, Row::new())?;
        record.fill_with_existing(row)?;
        Ok(record)
    }
}
