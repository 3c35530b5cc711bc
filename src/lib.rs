//! # tidemark
//!
//! PostgreSQL schema migrations built on recorded snapshots.
//!
//! tidemark provides:
//! - Structured diffs between a recorded baseline and the live schema
//! - Generated UP and DOWN scripts, with `ALTER TABLE` rebuilds for unsafe type changes
//! - Conflict scans over the migration directory
//! - Tamper detection through stored checksums
//! - A TTL lock with force takeover so only one process migrates at a time
//! - Transactional execution with savepoints and a recovery log
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tidemark::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = PgPool::builder().url("postgresql://localhost/mydb").build()?;
//!     let engine = migration_engine(EngineConfig::new(), &pool);
//!     engine.initialize().await?;
//!
//!     let script = engine
//!         .create_from_database("add invoices", &PgCatalog::new(pool.clone()))
//!         .await?;
//!     println!("Wrote {}", script.path.display());
//!
//!     let mut conn = pool.get().await?;
//!     println!("{}", engine.migrate(&mut conn, None).await?.summary());
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

/// The backend-agnostic migration engine.
pub mod migrate {
    pub use tidemark_migrate::*;
}

/// The PostgreSQL backend.
#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres {
    pub use tidemark_postgres::*;
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use tidemark_migrate::{
        ChangeDetector, EngineConfig, MigrateResult, MigrationEngine, MigrationError,
        MigrationGenerator, SchemaSnapshot, SqlConnection,
    };

    #[cfg(feature = "postgres")]
    pub use tidemark_postgres::{PgCatalog, PgConfig, PgPool, migration_engine};
}

// Re-export key types at the crate root
pub use tidemark_migrate::{MigrateResult, MigrationError};
