//! Shared PostgreSQL fixtures for autodev integration tests.
//!
//! Every test gets an isolated database cloned from a migrated template,
//! so per-test setup is a single `CREATE DATABASE ... TEMPLATE` statement
//! instead of a full migration run.
//!
//! The backing server comes from `AUTODEV_TEST_PG_URL` when set (CI
//! provides one container for the whole run); otherwise testcontainers
//! boots a postgres instance shared per test binary.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

/// Name of the migrated template database cloned by every test.
///
/// Suffixed with the process id: test binaries run in parallel and may
/// share one external server, and each binary rebuilds its own template.
fn template_db() -> String {
    format!("autodev_template_{}", std::process::id())
}

struct TestCluster {
    base_url: String,
    template: String,
    /// Keeps the containerised server alive for the binary's lifetime.
    /// `None` when an external server is used.
    _container: Option<ContainerAsync<Postgres>>,
}

static CLUSTER: OnceCell<TestCluster> = OnceCell::const_new();

async fn maintenance_pool(base_url: &str) -> PgPool {
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&format!("{base_url}/postgres"))
        .await
        .expect("failed to connect to maintenance database")
}

/// Start (or adopt) the server and build the migrated template database.
async fn boot_cluster() -> TestCluster {
    let (base_url, container) = match std::env::var("AUTODEV_TEST_PG_URL") {
        Ok(url) => (url, None),
        Err(_) => {
            let container = Postgres::default()
                .with_tag("18")
                .start()
                .await
                .expect("failed to start PostgreSQL container");
            let host = container.get_host().await.expect("failed to get host");
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("failed to get mapped port");
            (
                format!("postgresql://postgres:postgres@{host}:{port}"),
                Some(container),
            )
        }
    };

    // Rebuild the template from scratch so schema edits land without a
    // stale-template surprise.
    let template = template_db();
    let maint = maintenance_pool(&base_url).await;
    maint
        .execute(format!("DROP DATABASE IF EXISTS {template}").as_str())
        .await
        .expect("failed to drop stale template database");
    maint
        .execute(format!("CREATE DATABASE {template}").as_str())
        .await
        .expect("failed to create template database");
    maint.close().await;

    let template_pool = PgPoolOptions::new()
        .max_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&format!("{base_url}/{template}"))
        .await
        .expect("failed to connect to template database");
    autodev_db::pool::run_migrations(&template_pool)
        .await
        .expect("migrations should apply to the template database");
    // Cloning refuses while anyone is connected to the template.
    template_pool.close().await;

    TestCluster {
        base_url,
        template,
        _container: container,
    }
}

/// Base URL of the shared test server (no database name appended).
pub async fn pg_url() -> &'static str {
    let cluster = CLUSTER.get_or_init(boot_cluster).await;
    &cluster.base_url
}

/// Create an isolated, fully-migrated database for one test.
///
/// Returns `(pool, db_name)`; hand `db_name` back to [`drop_test_db`]
/// during teardown. Cloning from the template is retried a few times
/// because concurrent clones of one template can collide.
pub async fn create_test_db() -> (PgPool, String) {
    let cluster = CLUSTER.get_or_init(boot_cluster).await;
    let base_url = &cluster.base_url;
    let template = &cluster.template;
    let db_name = format!("autodev_test_{}", Uuid::new_v4().simple());

    let maint = maintenance_pool(base_url).await;
    let stmt = format!("CREATE DATABASE {db_name} TEMPLATE {template}");
    let mut clone_result = Ok(());
    for attempt in 0..5u64 {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(100 * attempt)).await;
        }
        match maint.execute(stmt.as_str()).await {
            Ok(_) => {
                clone_result = Ok(());
                break;
            }
            Err(e) => clone_result = Err(e),
        }
    }
    maint.close().await;
    if let Err(e) = clone_result {
        panic!("failed to clone {template} into {db_name}: {e}");
    }

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&format!("{base_url}/{db_name}"))
        .await
        .unwrap_or_else(|e| panic!("failed to connect to test database {db_name}: {e}"));

    (pool, db_name)
}

/// Tear down a database created by [`create_test_db`].
///
/// Stray connections are terminated first; dropping an already-dropped
/// database is not an error.
pub async fn drop_test_db(db_name: &str) {
    let base_url = pg_url().await;
    let maint = maintenance_pool(base_url).await;

    let terminate = format!(
        "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
         WHERE datname = '{db_name}' AND pid <> pg_backend_pid()"
    );
    let _ = maint.execute(terminate.as_str()).await;
    let _ = maint
        .execute(format!("DROP DATABASE IF EXISTS {db_name}").as_str())
        .await;
    maint.close().await;
}
