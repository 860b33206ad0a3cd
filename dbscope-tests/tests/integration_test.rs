//! Integration tests for dbscope against real SQLite databases
//!
//! Every test works on its own database file in a temporary directory, so
//! tests run in parallel without sharing state.
//!
//! Two extra driver identities are registered on top of the built-in SQLite
//! driver to exercise the compensating code paths end to end:
//! - `sqlite-nolimit` can't bind LIMIT/OFFSET values, so row windows are
//!   applied while streaming
//! - `sqlite-autocommit` reports no transaction support

use std::collections::HashSet;
use std::sync::{mpsc, Arc, Barrier, Once};
use std::thread;
use std::time::Duration;

use chrono::NaiveDate;
use dbscope::driver::sqlite::SqliteDriver;
use dbscope::{
    bind, capabilities, rollback, Capabilities, Datasource, DatasourceConfig, DriverRegistry, Error,
    Executor, FetchSummary, FromValue, IsolationLevel, NoParameters, PoolPhase, Query, QueryManager,
    ResultHandler, Row, RowProcessor, Transactional, VirtualParameters,
};
use rust_decimal::Decimal;
use tempfile::TempDir;

const NO_LIMIT_DRIVER: &str = "sqlite-nolimit";
const AUTOCOMMIT_DRIVER: &str = "sqlite-autocommit";

const SCHEMA: &str = "CREATE TABLE product (
    id INTEGER PRIMARY KEY,
    sku TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    price TEXT,
    stock INTEGER NOT NULL DEFAULT 0,
    active INTEGER NOT NULL DEFAULT 1,
    released TEXT,
    attributes TEXT
)";

fn register_test_drivers() {
    static REGISTER: Once = Once::new();
    REGISTER.call_once(|| {
        let registry = DriverRegistry::global();
        registry.register_driver(NO_LIMIT_DRIVER, Arc::new(SqliteDriver::default()));
        capabilities::register(Capabilities::new(NO_LIMIT_DRIVER).with_limit_parameters(false));
        registry.register_driver(AUTOCOMMIT_DRIVER, Arc::new(SqliteDriver::default()));
        capabilities::register(Capabilities::new(AUTOCOMMIT_DRIVER).with_transactions(false));
    });
}

/// A database file that lives as long as the value.
struct TestDb {
    dir: TempDir,
}

impl TestDb {
    fn new() -> Self {
        register_test_drivers();
        let db = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        let setup = Datasource::new("sqlite", db.url(), 0).unwrap();
        setup.connection().unwrap().execute_update(SCHEMA).unwrap();
        db
    }

    fn url(&self) -> String {
        format!("sqlite://{}", self.dir.path().join("shop.db").display())
    }

    fn datasource(&self, pool_size: usize) -> Datasource {
        self.datasource_for("sqlite", pool_size)
    }

    fn datasource_for(&self, driver: &str, pool_size: usize) -> Datasource {
        Datasource::new(driver, self.url(), pool_size).unwrap()
    }
}

fn insert_product(manager: &impl Executor, sku: &str, name: &str, stock: i64) -> dbscope::Result<u64> {
    let query = Query::new("INSERT INTO product (sku, name, stock) VALUES (?, ?, ?)")
        .parameters(["sku", "name", "stock"]);
    manager.execute_update_query(
        &query,
        bind(|s| {
            s.set("sku", sku)?.set("name", name)?.set("stock", stock)?;
            Ok(())
        }),
    )
}

fn seed(manager: &impl Executor, count: i64) {
    for i in 1..=count {
        insert_product(manager, &format!("SKU{i:03}"), &format!("Product {i}"), i * 10).unwrap();
    }
}

fn count_products(manager: &impl Executor) -> i64 {
    manager
        .execute_get_first::<i64, _>(&Query::new("SELECT COUNT(*) FROM product"), NoParameters)
        .unwrap()
        .unwrap_or_default()
}

fn skus(rows: &[Row]) -> Vec<String> {
    rows.iter().map(|row| row.get::<String>("sku").unwrap()).collect()
}

// ============ Pool Tests ============

#[test]
fn test_pooled_connections_are_reused() {
    let db = TestDb::new();
    let ds = db.datasource(2);
    let manager = QueryManager::new(ds.clone());

    seed(&manager, 3);
    assert_eq!(count_products(&manager), 3);

    let status = ds.pool_status();
    assert_eq!(status.phase, PoolPhase::Initialized);
    assert_eq!((status.idle, status.leased), (1, 0));
}

#[test]
fn test_concurrent_writers_share_a_small_pool() {
    let db = TestDb::new();
    let ds = db.datasource(2);
    let manager = QueryManager::new(ds.clone());

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let manager = manager.clone();
            thread::spawn(move || {
                for i in 0..10 {
                    insert_product(&manager, &format!("W{worker}-{i}"), "threaded", i).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(count_products(&manager), 40);
    let status = ds.pool_status();
    assert!(status.idle <= 2);
    assert_eq!(status.leased, 0);
}

#[test]
fn test_cleanup_closes_the_pool() {
    let db = TestDb::new();
    let ds = db.datasource(2);
    ds.prepare_pool().unwrap();
    assert_eq!(ds.pool_status().idle, 2);

    ds.cleanup();
    assert_eq!(ds.pool_status().phase, PoolPhase::Cleaned);
    assert!(matches!(ds.connection(), Err(Error::PoolClosed)));
}

#[test]
fn test_unpooled_datasource_opens_fresh_connections() {
    let db = TestDb::new();
    let ds = db.datasource(0);
    let first = ds.connection().unwrap();
    let second = ds.connection().unwrap();
    assert_ne!(first.id(), second.id());
    assert!(!first.is_pooled());
    drop((first, second));
    assert_eq!(ds.pool_status().idle, 0);
}

#[test]
fn test_third_lease_waits_for_a_release() {
    let db = TestDb::new();
    let ds = db.datasource(2);
    let (leased_tx, leased_rx) = mpsc::channel();

    let workers: Vec<_> = (0..3)
        .map(|worker| {
            let ds = ds.clone();
            let leased_tx = leased_tx.clone();
            let (release_tx, release_rx) = mpsc::channel::<()>();
            let handle = thread::spawn(move || {
                let conn = ds.connection().unwrap();
                leased_tx.send(worker).unwrap();
                release_rx.recv().unwrap();
                drop(conn);
            });
            (handle, release_tx)
        })
        .collect();

    let first = leased_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let second = leased_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(leased_rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(ds.pool_status().leased, 2);

    workers[first].1.send(()).unwrap();
    let third = leased_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(third != first && third != second);

    for (handle, release) in workers {
        let _ = release.send(());
        handle.join().unwrap();
    }
    assert_eq!(ds.pool_status().leased, 0);
}

#[test]
fn test_unpooled_connections_are_independent_across_threads() {
    let db = TestDb::new();
    let ds = db.datasource(0);
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|worker| {
            let ds = ds.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let conn = ds.connection().unwrap();
                barrier.wait();
                insert_product(&conn, &format!("U{worker}"), "unpooled", worker).unwrap();
                conn.id()
            })
        })
        .collect();
    let ids: HashSet<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(ids.len(), 2);
    assert_eq!(count_products(&QueryManager::new(ds.clone())), 2);
    assert_eq!(ds.pool_status().idle, 0);
}

// ============ Statement Tests ============

#[test]
fn test_named_parameters_and_type_mapping() {
    let db = TestDb::new();
    let manager = QueryManager::new(db.datasource(1));

    let insert = Query::new(
        "INSERT INTO product (sku, name, price, active, released, attributes) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .parameters(["sku", "name", "price", "active", "released", "attributes"]);
    manager
        .execute_update_query(
            &insert,
            bind(|s| {
                s.set("sku", "LAMP-1")?
                    .set("name", "Desk lamp")?
                    .set("price", Decimal::new(1999, 2))?
                    .set("active", false)?
                    .set("released", NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())?
                    .set("attributes", serde_json::json!({"color": "green"}))?;
                Ok(())
            }),
        )
        .unwrap();

    let select = Query::new("SELECT * FROM product WHERE sku = ?").parameter("sku");
    let row = manager
        .execute_fetch_first(&select, bind(|s| {
            s.set("sku", "LAMP-1")?;
            Ok(())
        }))
        .unwrap()
        .unwrap();

    assert_eq!(row.get::<String>("name").unwrap(), "Desk lamp");
    assert_eq!(row.get::<Decimal>("price").unwrap(), Decimal::new(1999, 2));
    assert!(!row.get::<bool>("active").unwrap());
    assert_eq!(
        row.get::<NaiveDate>("released").unwrap(),
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    );
    assert_eq!(
        row.get::<serde_json::Value>("attributes").unwrap()["color"],
        "green"
    );
    assert_eq!(row.get::<Option<i64>>("stock").unwrap(), Some(0));
}

#[test]
fn test_repeated_parameter_name_binds_every_slot() {
    let db = TestDb::new();
    let manager = QueryManager::new(db.datasource(1));
    seed(&manager, 5);

    let query = Query::new("SELECT sku FROM product WHERE stock >= ? AND stock <= ? + 10 ORDER BY id")
        .parameters(["stock", "stock"]);
    let rows = manager
        .execute_fetch_rows(&query, bind(|s| {
            s.set("stock", 20)?;
            Ok(())
        }))
        .unwrap();
    assert_eq!(skus(&rows), ["SKU002", "SKU003"]);
}

#[test]
fn test_missing_parameter_is_reported() {
    let db = TestDb::new();
    let manager = QueryManager::new(db.datasource(1));

    let query = Query::new("UPDATE product SET stock = ? WHERE sku = ?").parameters(["stock", "sku"]);
    let err = manager
        .execute_update_query(&query, bind(|s| {
            s.set("stock", 1)?;
            Ok(())
        }))
        .unwrap_err();
    assert!(matches!(err, Error::UnboundParameter(2)));
}

#[test]
fn test_virtual_parameter_resolved_by_handler() {
    let db = TestDb::new();
    let manager = QueryManager::new(db.datasource(1));

    // prices arrive in cents and are stored as decimals
    let insert = Query::new("INSERT INTO product (sku, name, price) VALUES (?, ?, ?)")
        .parameters(["sku", "name", "price"])
        .virtual_parameter("cents");
    let cents_to_price = VirtualParameters::new(["cents"], |stmt| {
        let cents = i64::from_value(stmt.virtual_value("cents")?)?;
        stmt.set("price", Decimal::new(cents, 2))?;
        Ok(())
    });

    manager
        .with_connection(|conn| {
            let mut stmt = conn.prepare_query(&insert)?;
            stmt.set_virtual_parameters(cents_to_price)?;
            for (sku, cents) in [("A", 250), ("B", 1099)] {
                stmt.set("sku", sku)?.set("name", sku)?.set("cents", cents)?;
                stmt.execute_update()?;
            }
            Ok(())
        })
        .unwrap();

    let prices = manager
        .execute_fetch_rows(&Query::new("SELECT price FROM product ORDER BY sku"), NoParameters)
        .unwrap()
        .iter()
        .map(|row| row.get::<Decimal>("price").unwrap())
        .collect::<Vec<_>>();
    assert_eq!(prices, [Decimal::new(250, 2), Decimal::new(1099, 2)]);
}

#[test]
fn test_handler_derives_one_virtual_value_from_another() {
    let db = TestDb::new();
    let manager = QueryManager::new(db.datasource(1));

    let insert = Query::new("INSERT INTO product (sku, name, stock) VALUES (?, ?, ?)")
        .parameters(["sku", "name", "stock"])
        .virtual_parameter("base")
        .virtual_parameter("label");
    let derive_label = VirtualParameters::new(["base", "label"], |stmt| {
        let base = String::from_value(stmt.virtual_value("base")?)?;
        stmt.set("label", format!("{base} (boxed)"))?;
        let label = String::from_value(stmt.virtual_value("label")?)?;
        stmt.set("sku", base.to_uppercase())?.set("name", label)?;
        Ok(())
    });

    manager
        .with_connection(|conn| {
            let mut stmt = conn.prepare_query(&insert)?;
            stmt.set_virtual_parameters(derive_label)?;
            stmt.set("base", "mug")?.set("stock", 4)?;
            stmt.execute_update()
        })
        .unwrap();

    let row = manager
        .execute_fetch_first(&Query::new("SELECT sku, name, stock FROM product"), NoParameters)
        .unwrap()
        .unwrap();
    assert_eq!(row.get::<String>("sku").unwrap(), "MUG");
    assert_eq!(row.get::<String>("name").unwrap(), "mug (boxed)");
    assert_eq!(row.get::<i64>("stock").unwrap(), 4);
}

#[test]
fn test_unresolved_virtual_parameter_fails_before_execution() {
    let db = TestDb::new();
    let manager = QueryManager::new(db.datasource(1));

    let insert = Query::new("INSERT INTO product (sku, name) VALUES (?, ?)")
        .parameters(["sku", "name"])
        .virtual_parameter("note");
    let err = manager
        .with_connection(|conn| {
            let mut stmt = conn.prepare_query(&insert)?;
            stmt.set_virtual_parameters(VirtualParameters::new(["note"], |_stmt| Ok(())))?;
            stmt.set("sku", "X")?.set("name", "x")?;
            stmt.execute_update()
        })
        .unwrap_err();
    assert!(matches!(err, Error::UndefinedVirtualParameter(name) if name == "note"));
    assert_eq!(count_products(&manager), 0);
}

#[test]
fn test_sql_error_names_the_statement() {
    let db = TestDb::new();
    let manager = QueryManager::new(db.datasource(1));
    let err = manager.execute_update("UPDATE missing_table SET a = 1").unwrap_err();
    assert!(matches!(&err, Error::Execution { sql, .. } if sql.contains("missing_table")));
    assert_eq!(manager.datasource().pool_status().leased, 0);
}

// ============ Row Window Tests ============

fn newest_products() -> Query {
    Query::new("SELECT sku FROM product WHERE stock > ? ORDER BY id DESC")
        .parameter("min_stock")
        .limit_offset("LIMIT ? OFFSET ?", "limit", Some("offset"))
}

fn fetch_window(manager: &QueryManager, limit: i64, offset: i64) -> Vec<String> {
    let rows = manager
        .execute_fetch_rows(&newest_products(), bind(|s| {
            s.set("min_stock", 0)?.set("limit", limit)?.set("offset", offset)?;
            Ok(())
        }))
        .unwrap();
    skus(&rows)
}

#[test]
fn test_bound_and_compensated_windows_agree() {
    let db = TestDb::new();
    let bound = QueryManager::new(db.datasource(1));
    let compensated = QueryManager::new(db.datasource_for(NO_LIMIT_DRIVER, 1));
    seed(&bound, 10);

    assert!(bound.datasource().capabilities().unwrap().supports_limit_parameters());
    assert!(!compensated.datasource().capabilities().unwrap().supports_limit_parameters());

    for (limit, offset) in [(3, 0), (3, 4), (5, 8), (2, 20)] {
        assert_eq!(
            fetch_window(&bound, limit, offset),
            fetch_window(&compensated, limit, offset),
            "limit {limit} offset {offset}"
        );
    }
    assert_eq!(fetch_window(&compensated, 3, 4), ["SKU006", "SKU005", "SKU004"]);
}

#[test]
fn test_compensated_zero_limit_returns_nothing() {
    let db = TestDb::new();
    let manager = QueryManager::new(db.datasource_for(NO_LIMIT_DRIVER, 1));
    seed(&manager, 3);
    assert!(fetch_window(&manager, 0, 0).is_empty());
}

#[test]
fn test_processor_stops_the_traversal() {
    let db = TestDb::new();
    let manager = QueryManager::new(db.datasource(1));
    seed(&manager, 10);

    let mut seen = Vec::new();
    let completed = manager
        .execute_fetch_all(
            &Query::new("SELECT sku FROM product ORDER BY id"),
            &mut |row: &Row| -> dbscope::Result<bool> {
                seen.push(row.get::<String>("sku")?);
                Ok(seen.len() < 2)
            },
            NoParameters,
        )
        .unwrap();
    assert!(!completed);
    assert_eq!(seen, ["SKU001", "SKU002"]);
}

struct StockTotal {
    total: i64,
}

impl RowProcessor for StockTotal {
    fn process_row(&mut self, row: &Row) -> dbscope::Result<bool> {
        self.total += row.get::<i64>("stock")?;
        Ok(true)
    }
}

impl ResultHandler for StockTotal {
    type Output = (i64, usize);

    fn conclude(&mut self, summary: &FetchSummary) -> dbscope::Result<(i64, usize)> {
        Ok((self.total, summary.rows))
    }
}

#[test]
fn test_result_handler_sees_the_summary() {
    let db = TestDb::new();
    let manager = QueryManager::new(db.datasource(1));
    seed(&manager, 4);

    let result = manager
        .execute_query(
            &Query::new("SELECT stock FROM product"),
            StockTotal { total: 0 },
            NoParameters,
        )
        .unwrap();
    assert_eq!(result, (100, 4));
    assert!(manager
        .execute_has_result_rows(&Query::new("SELECT 1 FROM product WHERE stock = 40"), NoParameters)
        .unwrap());
}

// ============ Transaction Tests ============

#[test]
fn test_transaction_commits_on_success() -> anyhow::Result<()> {
    let db = TestDb::new();
    let manager = QueryManager::new(db.datasource(1));

    let inserted = manager.in_transaction(|conn| {
        assert!(conn.is_in_transaction()?);
        insert_product(conn, "A", "a", 1)?;
        insert_product(conn, "B", "b", 2)
    })?;
    assert_eq!(inserted, Some(1));
    assert_eq!(count_products(&manager), 2);
    Ok(())
}

#[test]
fn test_rollback_request_discards_changes() -> anyhow::Result<()> {
    let db = TestDb::new();
    let manager = QueryManager::new(db.datasource(1));

    let committed = manager.in_transaction_without_result(|conn| {
        insert_product(conn, "A", "a", 1)?;
        rollback()
    })?;
    assert!(!committed);
    assert_eq!(count_products(&manager), 0);
    Ok(())
}

#[test]
fn test_failure_rolls_back_and_propagates() {
    let db = TestDb::new();
    let manager = QueryManager::new(db.datasource(1));

    let err = manager
        .in_transaction(|conn| -> dbscope::Result<()> {
            insert_product(conn, "A", "a", 1)?;
            Err(Error::caller(std::io::Error::other("payment declined")))
        })
        .unwrap_err();
    let original = err.into_caller().unwrap();
    assert_eq!(original.to_string(), "payment declined");
    assert_eq!(count_products(&manager), 0);
}

#[test]
fn test_nested_scopes_join_the_outer_transaction() {
    let db = TestDb::new();
    let manager = QueryManager::new(db.datasource(1));
    seed(&manager, 2);

    let committed = manager
        .in_transaction_without_result(|_conn| {
            manager.execute_update("DELETE FROM product")?;
            manager.in_transaction_without_result(|_conn| {
                insert_product(&manager, "C", "c", 3)?;
                rollback()
            })?;
            Ok(())
        })
        .unwrap();
    assert!(!committed);
    assert_eq!(count_products(&manager), 2);
}

#[test]
fn test_isolation_level_is_applied_before_begin() {
    let db = TestDb::new();
    let manager = QueryManager::new(db.datasource(1));

    let value = manager
        .in_transaction_with(Some(IsolationLevel::ReadUncommitted), |conn| {
            conn.execute_get_first::<i64, _>(&Query::new("PRAGMA read_uncommitted"), NoParameters)
        })
        .unwrap();
    assert_eq!(value, Some(Some(1)));
}

#[test]
fn test_dangling_transaction_rolls_back_on_release() {
    let db = TestDb::new();
    let ds = db.datasource(1);

    let conn = ds.connection().unwrap();
    conn.begin_transaction().unwrap();
    insert_product(&conn, "A", "a", 1).unwrap();
    drop(conn);

    assert_eq!(count_products(&ds.connection().unwrap()), 0);
}

#[test]
fn test_without_transaction_support_changes_stay() {
    let db = TestDb::new();
    let manager = QueryManager::new(db.datasource_for(AUTOCOMMIT_DRIVER, 1));

    let committed = manager
        .in_transaction_without_result(|conn| {
            insert_product(conn, "A", "a", 1)?;
            rollback()
        })
        .unwrap();
    assert!(!committed);
    assert_eq!(count_products(&manager), 1);
}

// ============ Datasource & Config Tests ============

#[test]
fn test_datasource_from_config_file() {
    let db = TestDb::new();
    let path = db.dir.path().join("dbscope.toml");
    std::fs::write(
        &path,
        format!("driver = \"sqlite3\"\nurl = \"{}\"\npool_size = 3\nacquire_timeout_ms = 500\n", db.url()),
    )
    .unwrap();

    let config = DatasourceConfig::load(Some(&path)).unwrap();
    let ds = Datasource::from_config(&config).unwrap();
    assert_eq!(ds.pool_size(), 3);
    assert_eq!(ds.acquire_timeout(), Some(Duration::from_millis(500)));
    assert_eq!(ds.aliased_driver().unwrap(), "sqlite");

    let manager = QueryManager::new(ds);
    seed(&manager, 1);
    assert_eq!(count_products(&manager), 1);
}

#[test]
fn test_config_without_url_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dbscope.toml");
    std::fs::write(&path, "driver = \"sqlite\"\n").unwrap();

    let config = DatasourceConfig::load(Some(&path)).unwrap();
    assert!(matches!(Datasource::from_config(&config), Err(Error::Config(_))));
}

#[test]
fn test_equal_datasources_deduplicate() {
    let db = TestDb::new();
    let mut set = HashSet::new();
    set.insert(db.datasource(1));
    set.insert(db.datasource(4));
    set.insert(db.datasource_for(NO_LIMIT_DRIVER, 1));
    assert_eq!(set.len(), 2);
}

#[test]
fn test_settings_are_frozen_once_used() {
    let db = TestDb::new();
    let mut ds = db.datasource(1);
    ds.set_user(Some("reporting".into())).unwrap();
    drop(ds.connection().unwrap());

    assert!(matches!(ds.set_url("sqlite::memory:"), Err(Error::Immutable(_))));
    assert!(matches!(ds.set_pool_size(8), Err(Error::Immutable(_))));
    assert_eq!(ds.user(), Some("reporting"));
}

#[test]
fn test_unknown_driver_token() {
    let err = Datasource::new("informix", "informix://db", 1)
        .unwrap()
        .connection()
        .unwrap_err();
    assert!(matches!(err, Error::DriverInstantiation { .. }));
    assert!(matches!(
        DriverRegistry::global().resolve_alias("informix"),
        Err(Error::UnsupportedDriverName(_))
    ));
}
