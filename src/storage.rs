//! Event persistence.
//!
//! Every validated detection is stored before notification is attempted, so
//! a delivery outage never loses history. SQLite is the on-device store; the
//! in-memory store backs tests and ephemeral deployments.

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::detect::result::BackendKind;
use crate::validate::ValidatedEvent;

/// A persisted event with its row id.
#[derive(Clone, Debug, serde::Serialize)]
pub struct StoredEvent {
    pub id: i64,
    #[serde(flatten)]
    pub event: ValidatedEvent,
}

pub trait EventStore: Send {
    /// Persist one event, returning its id.
    fn save_event(&mut self, event: &ValidatedEvent) -> Result<i64>;

    /// Most recent events, newest first.
    fn recent(&self, limit: usize) -> Result<Vec<StoredEvent>>;

    fn count(&self) -> Result<u64>;

    /// Delete events captured before `cutoff_ms` (Unix milliseconds).
    /// Returns the number of rows removed.
    fn purge_older_than(&mut self, cutoff_ms: u64) -> Result<usize>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    unix_time_ms    INTEGER NOT NULL,
    frame_seq       INTEGER NOT NULL,
    backend         TEXT NOT NULL,
    confidence      REAL NOT NULL,
    cat_count       INTEGER NOT NULL,
    boxes           TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_time ON events(unix_time_ms);
";

pub struct SqliteEventStore {
    conn: Connection,
}

impl SqliteEventStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("open event database {}", path.as_ref().display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enable WAL")?;
        conn.execute_batch(SCHEMA).context("apply schema")?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        conn.execute_batch(SCHEMA).context("apply schema")?;
        Ok(Self { conn })
    }
}

fn backend_from_str(s: &str) -> BackendKind {
    match s {
        "primary" => BackendKind::Primary,
        "secondary" => BackendKind::Secondary,
        "tertiary" => BackendKind::Tertiary,
        _ => BackendKind::Mock,
    }
}

impl EventStore for SqliteEventStore {
    fn save_event(&mut self, event: &ValidatedEvent) -> Result<i64> {
        let boxes = serde_json::to_string(&event.boxes).context("serialize boxes")?;
        self.conn
            .execute(
                "INSERT INTO events (unix_time_ms, frame_seq, backend, confidence, cat_count, boxes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.unix_time_ms as i64,
                    event.frame_seq as i64,
                    event.backend.as_str(),
                    event.confidence as f64,
                    event.cat_count,
                    boxes,
                ],
            )
            .context("insert event")?;
        Ok(self.conn.last_insert_rowid())
    }

    fn recent(&self, limit: usize) -> Result<Vec<StoredEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, unix_time_ms, frame_seq, backend, confidence, cat_count, boxes
                 FROM events ORDER BY unix_time_ms DESC, id DESC LIMIT ?1",
            )
            .context("prepare recent query")?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let backend: String = row.get(3)?;
                let boxes_json: String = row.get(6)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    backend,
                    row.get::<_, f64>(4)?,
                    row.get::<_, u32>(5)?,
                    boxes_json,
                ))
            })
            .context("query recent events")?;

        let mut events = Vec::new();
        for row in rows {
            let (id, unix_time_ms, frame_seq, backend, confidence, cat_count, boxes_json) =
                row.context("read event row")?;
            let boxes =
                serde_json::from_str(&boxes_json).context("deserialize stored boxes")?;
            events.push(StoredEvent {
                id,
                event: ValidatedEvent {
                    boxes,
                    cat_count,
                    confidence: confidence as f32,
                    backend: backend_from_str(&backend),
                    frame_seq: frame_seq as u64,
                    unix_time_ms: unix_time_ms as u64,
                },
            });
        }
        Ok(events)
    }

    fn count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .context("count events")?;
        Ok(count as u64)
    }

    fn purge_older_than(&mut self, cutoff_ms: u64) -> Result<usize> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM events WHERE unix_time_ms < ?1",
                params![cutoff_ms as i64],
            )
            .context("purge old events")?;
        if removed > 0 {
            log::info!("retention purge removed {} events", removed);
        }
        Ok(removed)
    }
}

/// Test and ephemeral-deployment store.
#[derive(Default)]
pub struct InMemoryEventStore {
    events: Vec<StoredEvent>,
    next_id: i64,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for InMemoryEventStore {
    fn save_event(&mut self, event: &ValidatedEvent) -> Result<i64> {
        self.next_id += 1;
        self.events.push(StoredEvent {
            id: self.next_id,
            event: event.clone(),
        });
        Ok(self.next_id)
    }

    fn recent(&self, limit: usize) -> Result<Vec<StoredEvent>> {
        let mut events = self.events.clone();
        events.sort_by(|a, b| {
            b.event
                .unix_time_ms
                .cmp(&a.event.unix_time_ms)
                .then(b.id.cmp(&a.id))
        });
        events.truncate(limit);
        Ok(events)
    }

    fn count(&self) -> Result<u64> {
        Ok(self.events.len() as u64)
    }

    fn purge_older_than(&mut self, cutoff_ms: u64) -> Result<usize> {
        let before = self.events.len();
        self.events.retain(|e| e.event.unix_time_ms >= cutoff_ms);
        Ok(before - self.events.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::BoundingBox;

    fn event(ms: u64, seq: u64) -> ValidatedEvent {
        ValidatedEvent {
            boxes: vec![BoundingBox::new(10, 20, 60, 60, 0.9)],
            cat_count: 1,
            confidence: 0.9,
            backend: BackendKind::Secondary,
            frame_seq: seq,
            unix_time_ms: ms,
        }
    }

    #[test]
    fn sqlite_round_trips_an_event() {
        let mut store = SqliteEventStore::open_in_memory().expect("open");
        let id = store.save_event(&event(1_700_000_000_000, 42)).expect("save");
        assert!(id > 0);

        let events = store.recent(10).expect("recent");
        assert_eq!(events.len(), 1);
        let stored = &events[0];
        assert_eq!(stored.event.frame_seq, 42);
        assert_eq!(stored.event.cat_count, 1);
        assert_eq!(stored.event.backend, BackendKind::Secondary);
        assert_eq!(stored.event.boxes.len(), 1);
        assert_eq!(stored.event.boxes[0].x, 10);
        assert!((stored.event.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn sqlite_purge_removes_only_old_rows() {
        let mut store = SqliteEventStore::open_in_memory().expect("open");
        store.save_event(&event(1_000, 1)).expect("save");
        store.save_event(&event(2_000, 2)).expect("save");
        store.save_event(&event(3_000, 3)).expect("save");

        let removed = store.purge_older_than(2_500).expect("purge");
        assert_eq!(removed, 2);
        assert_eq!(store.count().expect("count"), 1);
        assert_eq!(store.recent(10).expect("recent")[0].event.frame_seq, 3);
    }

    #[test]
    fn recent_is_newest_first() {
        let mut store = SqliteEventStore::open_in_memory().expect("open");
        for i in 0..5u64 {
            store.save_event(&event(1_000 + i, i)).expect("save");
        }
        let events = store.recent(3).expect("recent");
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event.frame_seq, 4);
    }

    #[test]
    fn in_memory_matches_sqlite_semantics() {
        let mut store = InMemoryEventStore::new();
        store.save_event(&event(1_000, 1)).expect("save");
        store.save_event(&event(2_000, 2)).expect("save");
        assert_eq!(store.count().expect("count"), 2);
        assert_eq!(store.purge_older_than(1_500).expect("purge"), 1);
        assert_eq!(store.recent(10).expect("recent")[0].event.frame_seq, 2);
    }
}
