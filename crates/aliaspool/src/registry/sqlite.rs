//! SQLite-backed registry.
//!
//! Concurrency contract with other processes using the same file:
//! - WAL journal mode: readers never block the single writer.
//! - A busy timeout: a writer blocked by another process retries until the
//!   timeout elapses, then fails with a storage error.
//! - Multi-statement writes begin IMMEDIATE so the write lock is taken (and
//!   waited for) up front instead of failing on a read-to-write upgrade.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, TransactionBehavior, ffi, params};

use super::{Allocation, Registry, RegistryError, schema};
use crate::clock::{Clock, SystemClock};
use crate::config::RegistryConfig;
use crate::naming::display_name;
use crate::slot::Slot;

const ALLOCATION_COLUMNS: &str =
    "id, project, branch, slot, display_name, allocated_at, last_seen_at";

pub struct SqliteRegistry {
    conn: Connection,
    clock: Arc<dyn Clock>,
}

impl SqliteRegistry {
    /// Open (creating if needed) the registry file described by `config`.
    ///
    /// Does not touch the schema; call [`Registry::init_schema`] before use.
    pub fn open(config: &RegistryConfig) -> Result<Self, RegistryError> {
        if let Some(parent) = config.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| RegistryError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(&config.path)?;
        tracing::debug!(path = %config.path.display(), "Opened registry");
        Self::configure(conn, config.busy_timeout)
    }

    /// Private in-memory registry. Not shared with any other handle.
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        let conn = Connection::open_in_memory()?;
        Self::configure(conn, Duration::ZERO)
    }

    fn configure(conn: Connection, busy_timeout: Duration) -> Result<Self, RegistryError> {
        conn.busy_timeout(busy_timeout)?;

        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::debug!(%mode, "Registry not in WAL mode");
        }
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        Ok(Self {
            conn,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn now_millis(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    /// Rows last seen strictly before this instant are stale.
    fn stale_cutoff_millis(&self, days: u32) -> i64 {
        (self.clock.now() - TimeDelta::days(i64::from(days))).timestamp_millis()
    }

    fn query_allocations(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Allocation>, RegistryError> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params, row_to_allocation)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn row_to_allocation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Allocation> {
    Ok(Allocation {
        id: row.get(0)?,
        project: row.get(1)?,
        branch: row.get(2)?,
        slot: row.get(3)?,
        display_name: row.get(4)?,
        allocated_at: millis_to_datetime(5, row.get(5)?)?,
        last_seen_at: millis_to_datetime(6, row.get(6)?)?,
    })
}

fn millis_to_datetime(column: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(column, millis))
}

fn insert_allocation(
    conn: &Connection,
    project: &str,
    branch: &str,
    slot: Slot,
    now: i64,
) -> Result<Allocation, RegistryError> {
    let name = display_name(project, branch);
    conn.execute(
        "INSERT INTO allocations (project, branch, slot, display_name, allocated_at, last_seen_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![project, branch, slot, name, now],
    )
    .map_err(classify)?;

    let at = millis_to_datetime(5, now)?;
    Ok(Allocation {
        id: conn.last_insert_rowid(),
        project: project.to_string(),
        branch: branch.to_string(),
        slot,
        display_name: name,
        allocated_at: at,
        last_seen_at: at,
    })
}

fn find_by_consumer_in(
    conn: &Connection,
    project: &str,
    branch: &str,
) -> rusqlite::Result<Option<Allocation>> {
    conn.prepare_cached(&format!(
        "SELECT {ALLOCATION_COLUMNS} FROM allocations WHERE project = ?1 AND branch = ?2"
    ))?
    .query_row(params![project, branch], row_to_allocation)
    .optional()
}

/// Map uniqueness violations to [`RegistryError::Conflict`]; everything else is storage.
fn classify(err: rusqlite::Error) -> RegistryError {
    if let rusqlite::Error::SqliteFailure(failure, message) = &err
        && failure.code == ErrorCode::ConstraintViolation
        && matches!(
            failure.extended_code,
            ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        )
    {
        return RegistryError::Conflict(
            message.clone().unwrap_or_else(|| failure.to_string()),
        );
    }
    RegistryError::Storage(err)
}

impl Registry for SqliteRegistry {
    fn init_schema(&mut self) -> Result<(), RegistryError> {
        schema::init_schema(&mut self.conn)?;
        tracing::debug!(version = schema::SCHEMA_VERSION, "Registry schema ready");
        Ok(())
    }

    fn allocate(
        &mut self,
        project: &str,
        branch: &str,
        slot: Slot,
    ) -> Result<Allocation, RegistryError> {
        let now = self.now_millis();

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = find_by_consumer_in(&tx, project, branch)? {
            tracing::debug!(
                project,
                branch,
                slot = %existing.slot,
                requested = %slot,
                "Consumer already bound"
            );
            return Ok(existing);
        }

        let allocation = insert_allocation(&tx, project, branch, slot, now)?;
        tx.commit()?;

        tracing::info!(
            id = allocation.id,
            project,
            branch,
            %slot,
            display_name = %allocation.display_name,
            "Allocated slot"
        );
        Ok(allocation)
    }

    fn find_by_consumer(
        &self,
        project: &str,
        branch: &str,
    ) -> Result<Option<Allocation>, RegistryError> {
        Ok(find_by_consumer_in(&self.conn, project, branch)?)
    }

    fn find_by_slot(&self, slot: Slot) -> Result<Option<Allocation>, RegistryError> {
        Ok(self
            .conn
            .prepare_cached(&format!(
                "SELECT {ALLOCATION_COLUMNS} FROM allocations WHERE slot = ?1"
            ))?
            .query_row(params![slot], row_to_allocation)
            .optional()?)
    }

    fn list_all(&self) -> Result<Vec<Allocation>, RegistryError> {
        self.query_allocations(
            &format!(
                "SELECT {ALLOCATION_COLUMNS} FROM allocations ORDER BY last_seen_at DESC, id DESC"
            ),
            [],
        )
    }

    fn touch(&mut self, id: i64) -> Result<bool, RegistryError> {
        let now = self.now_millis();
        let updated = self.conn.execute(
            "UPDATE allocations SET last_seen_at = MAX(last_seen_at, ?1) WHERE id = ?2",
            params![now, id],
        )?;
        Ok(updated > 0)
    }

    fn release(&mut self, id: i64) -> Result<(), RegistryError> {
        let removed = self
            .conn
            .execute("DELETE FROM allocations WHERE id = ?1", params![id])?;
        if removed > 0 {
            tracing::info!(id, "Released allocation");
        }
        Ok(())
    }

    fn stale_allocations(&self, days: u32) -> Result<Vec<Allocation>, RegistryError> {
        self.query_allocations(
            &format!(
                "SELECT {ALLOCATION_COLUMNS} FROM allocations
                 WHERE last_seen_at < ?1
                 ORDER BY last_seen_at ASC, id ASC"
            ),
            params![self.stale_cutoff_millis(days)],
        )
    }

    fn reclaim(
        &mut self,
        victim: i64,
        days: u32,
        project: &str,
        branch: &str,
        slot: Slot,
    ) -> Result<Allocation, RegistryError> {
        let now = self.now_millis();
        let cutoff = self.stale_cutoff_millis(days);

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = find_by_consumer_in(&tx, project, branch)? {
            tracing::debug!(project, branch, slot = %existing.slot, "Consumer already bound, keeping victim");
            return Ok(existing);
        }

        let removed = tx.execute(
            "DELETE FROM allocations WHERE id = ?1 AND slot = ?2 AND last_seen_at < ?3",
            params![victim, slot, cutoff],
        )?;
        if removed == 0 {
            return Err(RegistryError::Conflict(format!(
                "allocation {victim} no longer holds slot {slot} or was used within {days} days"
            )));
        }

        let allocation = insert_allocation(&tx, project, branch, slot, now)?;
        tx.commit()?;

        tracing::info!(
            victim,
            id = allocation.id,
            project,
            branch,
            %slot,
            "Reclaimed stale allocation"
        );
        Ok(allocation)
    }

    fn used_slots(&self) -> Result<Vec<Slot>, RegistryError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT slot FROM allocations ORDER BY slot")?;
        let slots = stmt.query_map([], |row| row.get::<_, Slot>(0))?;
        Ok(slots.collect::<Result<Vec<_>, _>>()?)
    }

    fn get_config(&self, key: &str) -> Result<Option<String>, RegistryError> {
        Ok(self
            .conn
            .prepare_cached("SELECT value FROM config WHERE key = ?1")?
            .query_row(params![key], |row| row.get(0))
            .optional()?)
    }

    fn set_config(&mut self, key: &str, value: &str) -> Result<(), RegistryError> {
        self.conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        tracing::info!(key, value, "Updated registry config");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn registry_with_clock() -> (SqliteRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let mut registry = SqliteRegistry::open_in_memory()
            .unwrap()
            .with_clock(clock.clone());
        registry.init_schema().unwrap();
        (registry, clock)
    }

    fn open_file(path: &std::path::Path, clock: &Arc<ManualClock>) -> SqliteRegistry {
        let mut registry = SqliteRegistry::open(
            &RegistryConfig::new(path).with_busy_timeout(Duration::from_millis(200)),
        )
        .unwrap()
        .with_clock(clock.clone());
        registry.init_schema().unwrap();
        registry
    }

    #[test]
    fn allocate_sets_both_timestamps_and_display_name() {
        let (mut registry, clock) = registry_with_clock();

        let allocation = registry.allocate("app", "Feature/X", Slot::new(10)).unwrap();
        assert_eq!(allocation.slot, Slot::new(10));
        assert_eq!(allocation.display_name, "feature-x-app");
        assert_eq!(allocation.allocated_at, clock.now());
        assert_eq!(allocation.last_seen_at, allocation.allocated_at);

        let stored = registry.find_by_slot(Slot::new(10)).unwrap().unwrap();
        assert_eq!(stored, allocation);
    }

    #[test]
    fn allocation_serializes_with_rfc3339_timestamps() {
        let (mut registry, _clock) = registry_with_clock();
        let allocation = registry.allocate("app", "main", Slot::new(12)).unwrap();

        insta::assert_json_snapshot!(allocation, @r#"
        {
          "id": 1,
          "project": "app",
          "branch": "main",
          "slot": 12,
          "display_name": "main-app",
          "allocated_at": "2026-01-01T00:00:00Z",
          "last_seen_at": "2026-01-01T00:00:00Z"
        }
        "#);
    }

    #[test]
    fn allocate_existing_consumer_ignores_requested_slot() {
        let (mut registry, clock) = registry_with_clock();

        let first = registry.allocate("app", "main", Slot::new(10)).unwrap();
        clock.advance(TimeDelta::hours(1));
        let second = registry.allocate("app", "main", Slot::new(42)).unwrap();

        assert_eq!(second, first);
        assert!(registry.find_by_slot(Slot::new(42)).unwrap().is_none());
    }

    #[test]
    fn same_branch_in_different_projects_is_distinct() {
        let (mut registry, _clock) = registry_with_clock();

        let a = registry.allocate("app", "main", Slot::new(10)).unwrap();
        let b = registry.allocate("api", "main", Slot::new(11)).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(
            registry.find_by_consumer("api", "main").unwrap().unwrap().slot,
            Slot::new(11)
        );
    }

    #[test]
    fn duplicate_slot_is_a_conflict() {
        let (mut registry, _clock) = registry_with_clock();

        registry.allocate("app", "main", Slot::new(10)).unwrap();
        let err = registry.allocate("app", "dev", Slot::new(10)).unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)), "got {err:?}");
        assert!(registry.find_by_consumer("app", "dev").unwrap().is_none());
    }

    #[test]
    fn list_all_is_most_recently_used_first() {
        let (mut registry, clock) = registry_with_clock();

        let main = registry.allocate("app", "main", Slot::new(10)).unwrap();
        clock.advance(TimeDelta::minutes(1));
        registry.allocate("app", "dev", Slot::new(11)).unwrap();
        clock.advance(TimeDelta::minutes(1));
        registry.touch(main.id).unwrap();

        let branches: Vec<String> = registry
            .list_all()
            .unwrap()
            .into_iter()
            .map(|a| a.branch)
            .collect();
        assert_eq!(branches, vec!["main", "dev"]);
    }

    #[test]
    fn touch_never_moves_backwards() {
        let (mut registry, clock) = registry_with_clock();

        let allocation = registry.allocate("app", "main", Slot::new(10)).unwrap();
        clock.advance(TimeDelta::hours(2));
        registry.touch(allocation.id).unwrap();
        let touched = registry.find_by_slot(Slot::new(10)).unwrap().unwrap();
        assert_eq!(touched.last_seen_at, clock.now());
        assert_eq!(touched.allocated_at, allocation.allocated_at);

        clock.rewind(TimeDelta::hours(5));
        registry.touch(allocation.id).unwrap();
        let after_rewind = registry.find_by_slot(Slot::new(10)).unwrap().unwrap();
        assert_eq!(after_rewind.last_seen_at, touched.last_seen_at);
        assert!(after_rewind.last_seen_at >= after_rewind.allocated_at);
    }

    #[test]
    fn release_unknown_id_is_ok() {
        let (mut registry, _clock) = registry_with_clock();

        let allocation = registry.allocate("app", "main", Slot::new(10)).unwrap();
        registry.release(allocation.id).unwrap();
        registry.release(allocation.id).unwrap();
        registry.release(9999).unwrap();
        assert!(registry.list_all().unwrap().is_empty());
    }

    #[test]
    fn ids_are_not_reused_after_release() {
        let (mut registry, _clock) = registry_with_clock();

        let first = registry.allocate("app", "main", Slot::new(10)).unwrap();
        registry.release(first.id).unwrap();
        let second = registry.allocate("app", "main", Slot::new(10)).unwrap();
        assert!(second.id > first.id);
    }

    #[test]
    fn stale_allocations_are_oldest_first_and_strictly_older() {
        let (mut registry, clock) = registry_with_clock();

        registry.allocate("app", "a", Slot::new(10)).unwrap();
        clock.advance(TimeDelta::days(1));
        registry.allocate("app", "b", Slot::new(11)).unwrap();
        clock.advance(TimeDelta::days(1));
        registry.allocate("app", "c", Slot::new(12)).unwrap();

        // Exactly one day old is not "older than one day".
        let stale: Vec<String> = registry
            .stale_allocations(1)
            .unwrap()
            .into_iter()
            .map(|a| a.branch)
            .collect();
        assert_eq!(stale, vec!["a"]);

        clock.advance(TimeDelta::milliseconds(1));
        let stale: Vec<String> = registry
            .stale_allocations(0)
            .unwrap()
            .into_iter()
            .map(|a| a.branch)
            .collect();
        assert_eq!(stale, vec!["a", "b", "c"]);
    }

    #[test]
    fn used_slots_lists_every_bound_slot() {
        let (mut registry, _clock) = registry_with_clock();

        registry.allocate("app", "a", Slot::new(15)).unwrap();
        registry.allocate("app", "b", Slot::new(11)).unwrap();
        assert_eq!(
            registry.used_slots().unwrap(),
            vec![Slot::new(11), Slot::new(15)]
        );
    }

    #[test]
    fn config_seeding_does_not_overwrite_user_values() {
        let (mut registry, _clock) = registry_with_clock();

        assert_eq!(registry.get_config("range_start").unwrap().as_deref(), Some("10"));
        registry.set_config("range_start", "40").unwrap();
        registry.init_schema().unwrap();
        registry.init_schema().unwrap();

        assert_eq!(registry.get_config("range_start").unwrap().as_deref(), Some("40"));
        assert_eq!(registry.get_config("range_end").unwrap().as_deref(), Some("99"));
        assert_eq!(registry.get_config("missing").unwrap(), None);
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("registry.db");
        let clock = Arc::new(ManualClock::new());

        let mut registry = open_file(&path, &clock);
        registry.allocate("app", "main", Slot::new(10)).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn allocations_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");
        let clock = Arc::new(ManualClock::new());

        let original = {
            let mut registry = open_file(&path, &clock);
            registry.allocate("app", "main", Slot::new(10)).unwrap()
        };

        let registry = open_file(&path, &clock);
        assert_eq!(
            registry.find_by_consumer("app", "main").unwrap(),
            Some(original)
        );
    }

    #[test]
    fn second_handle_sees_writes_and_loses_slot_race() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");
        let clock = Arc::new(ManualClock::new());

        let mut first = open_file(&path, &clock);
        let mut second = open_file(&path, &clock);

        first.allocate("app", "main", Slot::new(10)).unwrap();
        assert_eq!(second.used_slots().unwrap(), vec![Slot::new(10)]);

        let err = second.allocate("app", "dev", Slot::new(10)).unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)), "got {err:?}");

        // Same consumer from another handle resolves to the existing row.
        let same = second.allocate("app", "main", Slot::new(11)).unwrap();
        assert_eq!(same.slot, Slot::new(10));
    }

    #[test]
    fn blocked_writer_fails_after_busy_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");
        let clock = Arc::new(ManualClock::new());
        let mut registry = open_file(&path, &clock);

        let holder = Connection::open(&path).unwrap();
        holder.execute_batch("BEGIN IMMEDIATE").unwrap();

        let started = std::time::Instant::now();
        let err = registry
            .allocate("app", "main", Slot::new(10))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Storage(_)), "got {err:?}");
        assert!(started.elapsed() >= Duration::from_millis(150));

        // Readers are not blocked by the pending writer.
        assert!(registry.list_all().unwrap().is_empty());

        holder.execute_batch("ROLLBACK").unwrap();
        registry.allocate("app", "main", Slot::new(10)).unwrap();
    }

    #[test]
    fn blocked_writer_proceeds_once_lock_is_released() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");
        let clock = Arc::new(ManualClock::new());
        let mut registry = SqliteRegistry::open(
            &RegistryConfig::new(&path).with_busy_timeout(Duration::from_secs(5)),
        )
        .unwrap()
        .with_clock(clock.clone());
        registry.init_schema().unwrap();

        let holder_path = path.clone();
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let conn = Connection::open(&holder_path).unwrap();
            conn.execute_batch("BEGIN IMMEDIATE").unwrap();
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(200));
            conn.execute_batch("COMMIT").unwrap();
        });

        locked_rx.recv().unwrap();
        let allocation = registry.allocate("app", "main", Slot::new(10)).unwrap();
        assert_eq!(allocation.slot, Slot::new(10));
        holder.join().unwrap();
    }

    #[test]
    fn touch_reports_missing_row() {
        let (mut registry, _clock) = registry_with_clock();

        let allocation = registry.allocate("app", "main", Slot::new(10)).unwrap();
        assert!(registry.touch(allocation.id).unwrap());
        registry.release(allocation.id).unwrap();
        assert!(!registry.touch(allocation.id).unwrap());
    }

    #[test]
    fn reclaim_swaps_stale_row_for_new_consumer() {
        let (mut registry, clock) = registry_with_clock();

        let old = registry.allocate("app", "main", Slot::new(10)).unwrap();
        clock.advance(TimeDelta::days(2));

        let fresh = registry
            .reclaim(old.id, 1, "app", "feat", Slot::new(10))
            .unwrap();
        assert_eq!(fresh.slot, Slot::new(10));
        assert_eq!(fresh.allocated_at, clock.now());
        assert!(registry.find_by_consumer("app", "main").unwrap().is_none());
        assert_eq!(registry.find_by_slot(Slot::new(10)).unwrap(), Some(fresh));
    }

    #[test]
    fn reclaim_refuses_row_touched_after_scan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");
        let clock = Arc::new(ManualClock::new());
        let mut reclaimer = open_file(&path, &clock);
        let mut owner = open_file(&path, &clock);

        let owned = owner.allocate("app", "main", Slot::new(10)).unwrap();
        clock.advance(TimeDelta::days(10));

        let victim = reclaimer.stale_allocations(1).unwrap().remove(0);
        assert_eq!(victim.id, owned.id);
        assert!(owner.touch(owned.id).unwrap());

        let err = reclaimer
            .reclaim(victim.id, 1, "app", "feat", victim.slot)
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)), "got {err:?}");

        let kept = owner.find_by_consumer("app", "main").unwrap().unwrap();
        assert_eq!(kept.slot, Slot::new(10));
        assert_eq!(kept.last_seen_at, clock.now());
        assert!(reclaimer.find_by_consumer("app", "feat").unwrap().is_none());
    }

    #[test]
    fn reclaim_refuses_victim_on_another_slot() {
        let (mut registry, clock) = registry_with_clock();

        let old = registry.allocate("app", "main", Slot::new(10)).unwrap();
        clock.advance(TimeDelta::days(2));

        let err = registry
            .reclaim(old.id, 1, "app", "feat", Slot::new(11))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)), "got {err:?}");
        assert!(registry.find_by_consumer("app", "main").unwrap().is_some());
    }

    #[test]
    fn reclaim_for_bound_consumer_keeps_victim() {
        let (mut registry, clock) = registry_with_clock();

        let main = registry.allocate("app", "main", Slot::new(10)).unwrap();
        registry.allocate("app", "feat", Slot::new(11)).unwrap();
        clock.advance(TimeDelta::days(2));

        let feat = registry
            .reclaim(main.id, 1, "app", "feat", Slot::new(10))
            .unwrap();
        assert_eq!(feat.slot, Slot::new(11));
        assert!(registry.find_by_consumer("app", "main").unwrap().is_some());
    }

    #[test]
    fn migrated_registry_accepts_same_branch_in_another_project() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");
        let clock = Arc::new(ManualClock::new());
        Connection::open(&path)
            .unwrap()
            .execute_batch(schema::LEGACY_SCHEMA)
            .unwrap();

        let mut registry = open_file(&path, &clock);
        let api = registry.allocate("api", "main", Slot::new(21)).unwrap();
        assert_eq!(api.slot, Slot::new(21));

        let legacy = registry.find_by_consumer("", "main").unwrap().unwrap();
        assert_eq!(legacy.slot, Slot::new(20));
        assert_eq!(legacy.display_name, "main");
        assert_eq!(registry.list_all().unwrap().len(), 2);
    }

    /// Start `workers` threads that open `path` and initialize it at the same moment.
    fn init_concurrently(path: &std::path::Path, workers: usize) {
        let barrier = &std::sync::Barrier::new(workers);
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    scope.spawn(move || {
                        barrier.wait();
                        let mut registry = SqliteRegistry::open(&RegistryConfig::new(path))?;
                        registry.init_schema()
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap().unwrap();
            }
        });
    }

    fn schema_version(path: &std::path::Path) -> i64 {
        Connection::open(path)
            .unwrap()
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn concurrent_init_on_fresh_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");

        init_concurrently(&path, 8);

        assert_eq!(schema_version(&path), schema::SCHEMA_VERSION);
        let clock = Arc::new(ManualClock::new());
        let registry = open_file(&path, &clock);
        assert_eq!(registry.get_config("range_start").unwrap().as_deref(), Some("10"));
        assert_eq!(registry.get_config("range_end").unwrap().as_deref(), Some("99"));
        assert!(registry.list_all().unwrap().is_empty());
    }

    #[test]
    fn concurrent_init_upgrades_legacy_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch(schema::LEGACY_SCHEMA)
            .unwrap();

        init_concurrently(&path, 8);

        assert_eq!(schema_version(&path), schema::SCHEMA_VERSION);
        let clock = Arc::new(ManualClock::new());
        let mut registry = open_file(&path, &clock);
        assert_eq!(registry.get_config("range_start").unwrap().as_deref(), Some("20"));
        assert_eq!(registry.get_config("range_end").unwrap().as_deref(), Some("99"));

        let rows = registry.list_all().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!((rows[0].project.as_str(), rows[0].branch.as_str()), ("", "main"));
        assert_eq!(rows[0].slot, Slot::new(20));

        registry.allocate("api", "main", Slot::new(21)).unwrap();
    }
}
