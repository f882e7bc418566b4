//! SQLite-backed durable work store.
//!
//! One table holds every task. A row's state is never stored: it is fully
//! determined by the nullness of `claimant` and `output` (see
//! [`State::from_columns`]). The claim protocol runs its select and its
//! update inside a single exclusive transaction so no two claimants, in this
//! process or another one sharing the file, can lease the same row.
//!
//! WAL mode plus a busy timeout means lock contention between processes is
//! retried inside SQLite and never surfaces as an error.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use opentelemetry::KeyValue;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use crate::codec::{self, Encode, Registry};
use crate::error::{Error, Result};
use crate::model::{Counts, Files, LeasedTask, State, TaskId, TaskStatus, WorkerId};
use crate::telemetry::metrics;

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Rows fetched per round trip by [`Results`].
const RESULTS_PAGE: usize = 256;

/// Durable work store for tasks decoding to `T`.
pub struct Store<T> {
    conn: Mutex<Connection>,
    registry: Registry<T>,
}

impl<T> Store<T> {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>, registry: Registry<T>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn, registry)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory(registry: Registry<T>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, registry)
    }

    fn init(conn: Connection, registry: Registry<T>) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tasks (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                payload     TEXT NOT NULL,
                files       TEXT,
                claimant    INTEGER,
                output      TEXT
            );

            CREATE INDEX IF NOT EXISTS tasks_claimed ON tasks(claimant)
                WHERE claimant IS NOT NULL;
            CREATE INDEX IF NOT EXISTS tasks_done ON tasks(id)
                WHERE output IS NOT NULL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            registry,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Other("store connection lock poisoned".to_string()))
    }

    // -----------------------------------------------------------------------
    // Enqueue
    // -----------------------------------------------------------------------

    /// Insert one Pending row per task, in order, and return their ids.
    ///
    /// Every payload is encoded before anything is written, so a codec
    /// failure inserts nothing.
    pub fn enqueue<'a, E, I>(&self, tasks: I) -> Result<Vec<TaskId>>
    where
        E: Encode + ?Sized + 'a,
        I: IntoIterator<Item = &'a E>,
    {
        self.enqueue_with_files(tasks.into_iter().map(|task| (task, None)))
    }

    /// Like [`enqueue`](Self::enqueue), but each task may carry its input
    /// files. Rows and files land in the same transaction, so no claimant
    /// can ever lease a task before its files are in place.
    pub fn enqueue_with_files<'a, E, I>(&self, tasks: I) -> Result<Vec<TaskId>>
    where
        E: Encode + ?Sized + 'a,
        I: IntoIterator<Item = (&'a E, Option<&'a Files>)>,
    {
        let rows = tasks
            .into_iter()
            .map(|(task, files)| -> std::result::Result<_, codec::CodecError> {
                let payload = codec::to_text(task)?;
                let files = match files {
                    Some(files) if !files.is_empty() => Some(serde_json::to_string(files)?),
                    _ => None,
                };
                Ok((payload, files))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(rows.len());
        {
            let mut stmt = tx.prepare("INSERT INTO tasks (payload, files) VALUES (?1, ?2)")?;
            for (payload, files) in &rows {
                stmt.execute(params![payload, files])?;
                ids.push(TaskId(tx.last_insert_rowid()));
            }
        }
        tx.commit()?;

        metrics::tasks_enqueued().add(ids.len() as u64, &[]);
        debug!(count = ids.len(), "tasks enqueued");
        Ok(ids)
    }

    /// Replace the input files of a task. Only safe while nothing else can
    /// claim it; use [`enqueue_with_files`](Self::enqueue_with_files) to
    /// enqueue tasks together with their files.
    pub fn attach_files(&self, id: TaskId, files: &Files) -> Result<()> {
        let encoded = serde_json::to_string(files).map_err(codec::CodecError::from)?;
        let conn = self.lock()?;
        let rows = conn.execute(
            "UPDATE tasks SET files = ?1 WHERE id = ?2",
            params![encoded, id.0],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Claim protocol
    // -----------------------------------------------------------------------

    /// Lease up to `max` Pending tasks to `worker`.
    ///
    /// Returns fewer than `max` when fewer remain, and an empty batch only
    /// when nothing is Pending: that is the drained signal. A claimed row
    /// whose payload or files fail to decode is logged and left Claimed so
    /// it shows up as stuck rather than vanishing.
    pub fn claim_batch(&self, worker: WorkerId, max: usize) -> Result<Vec<LeasedTask<T>>> {
        if max == 0 {
            return Ok(Vec::new());
        }

        loop {
            let rows = self.claim_rows(worker, max)?;
            if rows.is_empty() {
                return Ok(Vec::new());
            }

            let claimed = rows.len();
            let tasks: Vec<_> = rows
                .into_iter()
                .filter_map(|row| match self.decode_lease(row) {
                    Ok(task) => Some(task),
                    Err((id, e)) => {
                        error!(
                            task_id = %id,
                            worker_id = %worker,
                            "undecodable task left claimed: {e}"
                        );
                        metrics::runner_failures().add(1, &[KeyValue::new("stage", "decode")]);
                        None
                    }
                })
                .collect();

            metrics::tasks_claimed().add(
                claimed as u64,
                &[KeyValue::new("worker", worker.to_string())],
            );
            debug!(worker_id = %worker, claimed, decoded = tasks.len(), "batch claimed");

            if !tasks.is_empty() {
                return Ok(tasks);
            }
            warn!(worker_id = %worker, claimed, "no decodable task in batch, claiming again");
        }
    }

    /// The critical section: select Pending ids and mark them claimed in
    /// one exclusive transaction.
    fn claim_rows(&self, worker: WorkerId, max: usize) -> Result<Vec<RawLease>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;

        let rows = {
            let mut stmt = tx.prepare(
                "SELECT id, payload, files FROM tasks
                 WHERE claimant IS NULL AND output IS NULL
                 ORDER BY id LIMIT ?1",
            )?;
            let limit = i64::try_from(max).unwrap_or(i64::MAX);
            stmt.query_map(params![limit], |row| {
                Ok(RawLease {
                    id: TaskId(row.get(0)?),
                    payload: row.get(1)?,
                    files: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?
        };

        {
            let mut mark = tx.prepare("UPDATE tasks SET claimant = ?1 WHERE id = ?2")?;
            for row in &rows {
                mark.execute(params![worker.0, row.id.0])?;
            }
        }
        tx.commit()?;
        Ok(rows)
    }

    fn decode_lease(&self, row: RawLease) -> std::result::Result<LeasedTask<T>, (TaskId, Error)> {
        let decode = || -> Result<LeasedTask<T>> {
            let payload = self.registry.decode_str(&row.payload)?;
            let files = match &row.files {
                Some(text) => serde_json::from_str(text).map_err(codec::CodecError::from)?,
                None => Files::new(),
            };
            Ok(LeasedTask {
                id: row.id,
                payload,
                files,
            })
        };
        decode().map_err(|e| (row.id, e))
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    /// Record the output of a task and clear its claimant.
    ///
    /// Ownership is not checked: whoever calls this wins, and completing a
    /// Done task overwrites its result.
    pub fn complete<R: Serialize + ?Sized>(&self, id: TaskId, output: &R) -> Result<()> {
        let encoded = serde_json::to_string(output).map_err(codec::CodecError::from)?;
        let conn = self.lock()?;
        let rows = conn.execute(
            "UPDATE tasks SET output = ?1, claimant = NULL WHERE id = ?2",
            params![encoded, id.0],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        metrics::tasks_completed().add(1, &[]);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn count_total(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM tasks")
    }

    pub fn count_claimed(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM tasks WHERE claimant IS NOT NULL AND output IS NULL")
    }

    pub fn count_done(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM tasks WHERE output IS NOT NULL")
    }

    fn count(&self, sql: &str) -> Result<u64> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }

    /// All three counts in a single read.
    pub fn counts(&self) -> Result<Counts> {
        let conn = self.lock()?;
        let (total, claimed, done): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*),
                    COUNT(CASE WHEN claimant IS NOT NULL AND output IS NULL THEN 1 END),
                    COUNT(output)
             FROM tasks",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(Counts {
            total: total.max(0) as u64,
            claimed: claimed.max(0) as u64,
            done: done.max(0) as u64,
        })
    }

    pub fn status(&self, id: TaskId) -> Result<TaskStatus> {
        let conn = self.lock()?;
        let row: Option<(Option<i64>, bool)> = conn
            .query_row(
                "SELECT claimant, output IS NOT NULL FROM tasks WHERE id = ?1",
                params![id.0],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (claimant, has_output) = row.ok_or_else(|| Error::NotFound(id.to_string()))?;
        let state = State::from_columns(claimant, has_output);
        Ok(TaskStatus {
            id,
            state,
            claimant: match state {
                State::Claimed => claimant.map(WorkerId),
                _ => None,
            },
        })
    }

    // -----------------------------------------------------------------------
    // Maintenance (run only while no worker is active)
    // -----------------------------------------------------------------------

    /// Return every Claimed task to Pending. Returns how many were reverted.
    pub fn sweep_stuck(&self) -> Result<usize> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE tasks SET claimant = NULL WHERE claimant IS NOT NULL AND output IS NULL",
            [],
        )?;
        metrics::store_maintenance().add(n as u64, &[KeyValue::new("operation", "sweep_stuck")]);
        info!(reverted = n, "swept stuck tasks");
        Ok(n)
    }

    /// Clear the output of every Done task so it runs again. Returns how
    /// many were reset.
    pub fn reset_all(&self) -> Result<usize> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE tasks SET output = NULL, claimant = NULL WHERE output IS NOT NULL",
            [],
        )?;
        metrics::store_maintenance().add(n as u64, &[KeyValue::new("operation", "reset_all")]);
        info!(reset = n, "reset done tasks");
        Ok(n)
    }

    // -----------------------------------------------------------------------
    // Results
    // -----------------------------------------------------------------------

    /// Lazily read every Done task with its decoded output, by ascending id.
    ///
    /// The snapshot is bounded by the highest id present when this is
    /// called. The store lock is only held while a page is fetched.
    pub fn iter_results<R: DeserializeOwned>(&self) -> Result<Results<'_, T, R>> {
        let until: Option<i64> = {
            let conn = self.lock()?;
            conn.query_row("SELECT MAX(id) FROM tasks", [], |row| row.get(0))?
        };
        Ok(Results {
            store: self,
            after: 0,
            until: until.unwrap_or(0),
            page: VecDeque::new(),
            exhausted: until.is_none(),
            _output: PhantomData,
        })
    }

    fn results_page(&self, after: i64, until: i64) -> Result<Vec<(i64, String, String)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, payload, output FROM tasks
             WHERE output IS NOT NULL AND id > ?1 AND id <= ?2
             ORDER BY id LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![after, until, RESULTS_PAGE as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

struct RawLease {
    id: TaskId,
    payload: String,
    files: Option<String>,
}

/// Iterator returned by [`Store::iter_results`].
pub struct Results<'a, T, R> {
    store: &'a Store<T>,
    after: i64,
    until: i64,
    page: VecDeque<(i64, String, String)>,
    exhausted: bool,
    _output: PhantomData<fn() -> R>,
}

impl<T, R: DeserializeOwned> Iterator for Results<'_, T, R> {
    type Item = Result<(T, R)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.exhausted {
            match self.store.results_page(self.after, self.until) {
                Ok(rows) => {
                    if rows.len() < RESULTS_PAGE {
                        self.exhausted = true;
                    }
                    self.page.extend(rows);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }

        let (id, payload, output) = self.page.pop_front()?;
        self.after = id;
        let decoded = self
            .store
            .registry
            .decode_str(&payload)
            .and_then(|task| Ok((task, serde_json::from_str(&output)?)))
            .map_err(Error::from);
        Some(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Tagged;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Echo {
        text: String,
    }

    impl Tagged for Echo {
        const TAG: &'static str = "echo";
    }

    fn echo(text: &str) -> Echo {
        Echo {
            text: text.to_string(),
        }
    }

    fn test_store() -> Store<Echo> {
        Store::in_memory(Registry::for_type()).unwrap()
    }

    #[test]
    fn enqueue_assigns_increasing_ids() {
        let store = test_store();
        let ids = store.enqueue(&[echo("a"), echo("b")]).unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids[0] < ids[1]);
        assert_eq!(store.status(ids[0]).unwrap().state, State::Pending);
    }

    #[test]
    fn payload_is_stored_as_tagged_json_text() {
        let store = test_store();
        let ids = store.enqueue(&[echo("hi")]).unwrap();
        let conn = store.lock().unwrap();
        let text: String = conn
            .query_row("SELECT payload FROM tasks WHERE id = ?1", params![ids[0].0], |r| {
                r.get(0)
            })
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["__type__"], "echo");
        assert_eq!(value["text"], "hi");
    }

    #[test]
    fn claim_of_zero_touches_nothing() {
        let store = test_store();
        store.enqueue(&[echo("a")]).unwrap();
        assert!(store.claim_batch(WorkerId(1), 0).unwrap().is_empty());
        assert_eq!(store.count_claimed().unwrap(), 0);
    }

    #[test]
    fn undecodable_rows_stay_claimed() {
        let store = test_store();
        store.enqueue(&[echo("good")]).unwrap();
        {
            let conn = store.lock().unwrap();
            conn.execute(
                "INSERT INTO tasks (payload) VALUES ('{\"__type__\": \"mystery\"}')",
                [],
            )
            .unwrap();
        }

        let batch = store.claim_batch(WorkerId(1), 10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, echo("good"));
        assert_eq!(store.count_claimed().unwrap(), 2);
        assert!(store.claim_batch(WorkerId(1), 10).unwrap().is_empty());
    }

    #[test]
    fn status_hides_claimant_once_done() {
        let store = test_store();
        let ids = store.enqueue(&[echo("a")]).unwrap();
        store.claim_batch(WorkerId(9), 1).unwrap();
        assert_eq!(store.status(ids[0]).unwrap().claimant, Some(WorkerId(9)));

        store.complete(ids[0], &1).unwrap();
        let status = store.status(ids[0]).unwrap();
        assert_eq!(status.state, State::Done);
        assert_eq!(status.claimant, None);
    }

    #[test]
    fn results_span_multiple_pages() {
        let store = test_store();
        let tasks: Vec<_> = (0..RESULTS_PAGE + 3).map(|i| echo(&i.to_string())).collect();
        let ids = store.enqueue(&tasks).unwrap();
        for (i, id) in ids.iter().enumerate() {
            store.complete(*id, &i).unwrap();
        }

        let results: Vec<(Echo, usize)> = store
            .iter_results()
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(results.len(), tasks.len());
        let last = RESULTS_PAGE + 2;
        assert_eq!(results[last], (echo(&last.to_string()), last));
    }
}
