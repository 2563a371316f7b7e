use record_kernel::domain::schema::{examples, SchemaRegistry};
use record_kernel::infra::config::{self, CacheBackend};
use record_kernel::infra::logging;
use record_kernel::storage::backend::PgBackend;

fn usage_and_exit() -> ! {
    eprintln!(
        "Usage: cargo run --bin preflight -- [--install-examples]\n\
         \n\
         Requires env vars:\n\
           DATABASE_URL\n\
         Optional:\n\
           DATABASE_MAX_CONNECTIONS, RECORD_CACHE, RECORD_CACHE_TTL_SECS,\n\
           FILE_STORE_ROOT, FILE_STORE_BASE_URI, FILE_STORE_ENDPOINT,\n\
           RECORD_STRICT_RELATIONS\n"
    );
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::load_env();
    logging::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        usage_and_exit();
    }
    let install_examples = args.iter().any(|a| a == "--install-examples");

    // Force-read config (nice error messages if missing)
    let database_url = config::database_url()?;
    let max_connections = config::database_max_connections()?;
    let cache = config::cache_backend()?;
    let ttl = config::cache_ttl()?;

    println!("> Preflight:");
    println!("  DATABASE_MAX_CONNECTIONS={}", max_connections);
    println!("  RECORD_CACHE={:?} (ttl: {:?})", cache, ttl);
    println!("  RECORD_STRICT_RELATIONS={}", config::strict_relations());
    match config::file_store_endpoint() {
        Some(endpoint) => println!("  File store: HTTP {}", endpoint),
        None => println!(
            "  File store: local {} (served as {})",
            config::file_store_root(),
            config::file_store_base_uri()
        ),
    }

    let backend = PgBackend::connect(&database_url, max_connections).await?;
    let pool = backend.pool();
    let version: (String,) = sqlx::query_as("SELECT version()").fetch_one(pool).await?;
    println!("  Database: {}", version.0);

    SchemaRegistry::install_schema_table(pool).await?;
    if install_examples {
        println!("  Installing notification example tables and descriptors...");
        for sql in examples::create_table_statements() {
            sqlx::query(sql).execute(pool).await?;
        }
        let registry = examples::notification_registry()?;
        for entity in registry.list_entities() {
            if let Some(descriptor) = registry.get(&entity) {
                SchemaRegistry::store(pool, &descriptor).await?;
            }
        }
    }

    let registry = SchemaRegistry::load_from_db(pool).await?;
    if registry.is_empty() {
        eprintln!("  Warning: no schemas registered in record_schemas.");
    } else {
        println!("  Schemas: {}", registry.list_entities().join(", "));
    }
    registry.check_references()?;
    println!("  Cross-entity references resolve.");

    if cache == CacheBackend::Postgres {
        let exists: (bool,) = sqlx::query_as("SELECT to_regclass('record_cache') IS NOT NULL")
            .fetch_one(pool)
            .await?;
        if !exists.0 {
            println!("  record_cache table missing; it is created on first connect.");
        }
    }

    println!("> Preflight OK.");
    Ok(())
}
