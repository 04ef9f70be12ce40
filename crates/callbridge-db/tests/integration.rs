use callbridge_db::{create_pool, run_migrations, DbRuntimeSettings};

#[test]
fn db_initialization_creates_context_table() {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    let path = dir.path().join("callbridge.db");
    let pool = create_pool(path.to_str().unwrap(), DbRuntimeSettings::default())
        .expect("failed to create pool");
    let conn = pool.get().expect("failed to get connection");
    let applied = run_migrations(&conn).expect("failed to run migrations");
    assert_eq!(applied, 1);

    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .expect("failed to prepare table query");
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .expect("failed to execute table query")
        .map(|r| r.expect("failed to read table name"))
        .collect();

    assert_eq!(tables, vec!["context_records"]);

    let version: i64 = conn
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .expect("failed to read schema version");
    assert_eq!(version, 1);
}

#[test]
fn migrated_schema_is_shared_across_pooled_connections() {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    let path = dir.path().join("callbridge.db");
    let pool = create_pool(path.to_str().unwrap(), DbRuntimeSettings::default())
        .expect("failed to create pool");

    {
        let conn = pool.get().expect("failed to get connection");
        run_migrations(&conn).expect("failed to run migrations");
    }

    let first = pool.get().expect("first connection");
    let second = pool.get().expect("second connection");
    first
        .execute(
            "INSERT INTO context_records (id, call_id, role, text, embedding_json, created_at)
             VALUES ('r1', 'call-1', 'user', 'hello', '[0.1]', '2026-01-01T00:00:00Z')",
            [],
        )
        .expect("insert should succeed");

    let count: i64 = second
        .query_row("SELECT COUNT(*) FROM context_records", [], |row| row.get(0))
        .expect("count should succeed");
    assert_eq!(count, 1);
}

#[test]
fn role_constraint_rejects_unknown_roles() {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    let path = dir.path().join("callbridge.db");
    let pool = create_pool(path.to_str().unwrap(), DbRuntimeSettings::default())
        .expect("failed to create pool");
    let conn = pool.get().expect("failed to get connection");
    run_migrations(&conn).expect("failed to run migrations");

    let result = conn.execute(
        "INSERT INTO context_records (id, call_id, role, text, embedding_json, created_at)
         VALUES ('r1', 'call-1', 'moderator', 'hello', '[]', '2026-01-01T00:00:00Z')",
        [],
    );
    assert!(result.is_err());
}
