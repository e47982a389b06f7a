use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension as _, params};

use super::{RequestedSwap, Swap, Transition, TransitionRecord};
use crate::poll::PeerPoll;

/// Rejected requests kept for the operator; older ones are pruned.
pub const MAX_REJECTED_REQUESTS: usize = 100;

/// Durable swap records. Every write is committed before it returns.
pub trait SwapStore: Send + Sync {
    fn put(&self, swap: &Swap) -> Result<()>;
    fn get(&self, swap_id: &str) -> Result<Option<Swap>>;
    fn list(&self) -> Result<Vec<Swap>>;
    fn list_non_terminal(&self) -> Result<Vec<Swap>>;

    /// Stores the swap as it is after `transition` and appends the transition
    /// to its log, atomically. Returns the log sequence number.
    fn record_transition(&self, swap: &Swap, transition: &Transition, at: DateTime<Utc>)
    -> Result<u64>;
    fn history(&self, swap_id: &str) -> Result<Vec<TransitionRecord>>;

    /// Inserts or replaces a request. Rejected requests beyond
    /// `MAX_REJECTED_REQUESTS` are dropped, oldest first.
    fn put_requested(&self, request: &RequestedSwap) -> Result<()>;
    fn remove_requested(&self, swap_id: &str) -> Result<()>;
    fn list_requested(&self) -> Result<Vec<RequestedSwap>>;
}

pub trait PollStore: Send + Sync {
    fn put_poll(&self, poll: &PeerPoll) -> Result<()>;
    fn list_polls(&self) -> Result<Vec<PeerPoll>>;
}

#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create swap store dir {}", dir.display()))?;
        }

        let conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("set sqlite busy_timeout")?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL; PRAGMA foreign_keys = ON;",
        )
        .context("configure sqlite pragmas")?;

        migrate(&conn).context("migrate sqlite schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().expect("swap store mutex poisoned");
        f(&mut conn)
    }

    fn query_swaps(&self, sql: &str) -> Result<Vec<Swap>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql).context("prepare list swaps")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .context("query list swaps")?;
            let mut out = Vec::new();
            for row in rows {
                let json = row.context("read swap row")?;
                out.push(decode_swap(&json)?);
            }
            Ok(out)
        })
    }
}

impl SwapStore for SqliteStore {
    fn put(&self, swap: &Swap) -> Result<()> {
        self.with_conn(|conn| upsert_swap(conn, swap))
    }

    fn get(&self, swap_id: &str) -> Result<Option<Swap>> {
        let json: Option<String> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT record FROM swaps WHERE swap_id = ?1",
                params![swap_id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("get swap {swap_id}"))
        })?;
        json.map(|json| decode_swap(&json)).transpose()
    }

    fn list(&self) -> Result<Vec<Swap>> {
        self.query_swaps("SELECT record FROM swaps ORDER BY created_at, swap_id")
    }

    fn list_non_terminal(&self) -> Result<Vec<Swap>> {
        self.query_swaps(
            "SELECT record FROM swaps WHERE terminal = 0 ORDER BY created_at, swap_id",
        )
    }

    fn record_transition(
        &self,
        swap: &Swap,
        transition: &Transition,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let transition_json =
            serde_json::to_string(transition).context("serialize swap transition")?;

        self.with_conn(|conn| {
            let tx = conn
                .transaction()
                .with_context(|| format!("begin transition for swap {}", swap.id))?;
            upsert_swap(&tx, swap)?;

            let seq: i64 = tx
                .query_row(
                    "SELECT COALESCE(MAX(seq), 0) + 1 FROM swap_transitions WHERE swap_id = ?1",
                    params![&swap.id],
                    |row| row.get(0),
                )
                .context("next transition seq")?;
            tx.execute(
                r#"
INSERT INTO swap_transitions (swap_id, seq, state, transition, at)
VALUES (?1, ?2, ?3, ?4, ?5)
"#,
                params![
                    &swap.id,
                    seq,
                    swap.state.as_str(),
                    transition_json,
                    at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("append transition for swap {}", swap.id))?;

            tx.commit()
                .with_context(|| format!("commit transition for swap {}", swap.id))?;
            u64::try_from(seq).context("transition seq out of range")
        })
    }

    fn history(&self, swap_id: &str) -> Result<Vec<TransitionRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    r#"
SELECT seq, at, transition
FROM swap_transitions
WHERE swap_id = ?1
ORDER BY seq
"#,
                )
                .context("prepare swap history")?;
            let rows = stmt
                .query_map(params![swap_id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .with_context(|| format!("query history of swap {swap_id}"))?;

            let mut out = Vec::new();
            for row in rows {
                let (seq, at, json) = row.context("read transition row")?;
                out.push(TransitionRecord {
                    seq: u64::try_from(seq).context("transition seq out of range")?,
                    at: parse_time(&at)?,
                    transition: serde_json::from_str(&json)
                        .with_context(|| format!("decode transition {seq} of {swap_id}"))?,
                });
            }
            Ok(out)
        })
    }

    fn put_requested(&self, request: &RequestedSwap) -> Result<()> {
        let json = serde_json::to_string(request).context("serialize requested swap")?;
        self.with_conn(|conn| {
            conn.execute(
                r#"
INSERT INTO requested_swaps (swap_id, peer_id, rejected, record, received_at)
VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT(swap_id) DO UPDATE SET
  peer_id = excluded.peer_id,
  rejected = excluded.rejected,
  record = excluded.record,
  received_at = excluded.received_at
"#,
                params![
                    &request.swap_id,
                    &request.peer_id,
                    !request.is_pending(),
                    json,
                    request.received_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("insert requested swap {}", request.swap_id))?;

            if !request.is_pending() {
                conn.execute(
                    r#"
DELETE FROM requested_swaps
WHERE rejected = 1 AND swap_id NOT IN (
  SELECT swap_id FROM requested_swaps
  WHERE rejected = 1
  ORDER BY received_at DESC, swap_id DESC
  LIMIT ?1
)
"#,
                    params![MAX_REJECTED_REQUESTS as i64],
                )
                .context("prune rejected requests")?;
            }
            Ok(())
        })
    }

    fn remove_requested(&self, swap_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM requested_swaps WHERE swap_id = ?1",
                params![swap_id],
            )
            .with_context(|| format!("delete requested swap {swap_id}"))?;
            Ok(())
        })
    }

    fn list_requested(&self) -> Result<Vec<RequestedSwap>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT record FROM requested_swaps ORDER BY received_at, swap_id")
                .context("prepare list requested swaps")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .context("query requested swaps")?;
            let mut out = Vec::new();
            for row in rows {
                let json = row.context("read requested swap row")?;
                out.push(serde_json::from_str(&json).context("decode requested swap")?);
            }
            Ok(out)
        })
    }
}

impl PollStore for SqliteStore {
    fn put_poll(&self, poll: &PeerPoll) -> Result<()> {
        let json = serde_json::to_string(poll).context("serialize peer poll")?;
        self.with_conn(|conn| {
            conn.execute(
                r#"
INSERT INTO peer_polls (peer_id, record, received_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(peer_id) DO UPDATE SET
  record = excluded.record,
  received_at = excluded.received_at
"#,
                params![&poll.peer_id, json, poll.received_at.to_rfc3339()],
            )
            .with_context(|| format!("store poll from {}", poll.peer_id))?;
            Ok(())
        })
    }

    fn list_polls(&self) -> Result<Vec<PeerPoll>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT record FROM peer_polls ORDER BY peer_id")
                .context("prepare list peer polls")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .context("query peer polls")?;
            let mut out = Vec::new();
            for row in rows {
                let json = row.context("read peer poll row")?;
                out.push(serde_json::from_str(&json).context("decode peer poll")?);
            }
            Ok(out)
        })
    }
}

fn upsert_swap(conn: &Connection, swap: &Swap) -> Result<()> {
    let json = serde_json::to_string(swap).context("serialize swap")?;
    conn.execute(
        r#"
INSERT INTO swaps (
  swap_id,
  peer_id,
  asset,
  state,
  terminal,
  record,
  created_at,
  updated_at
) VALUES (
  ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8
)
ON CONFLICT(swap_id) DO UPDATE SET
  state = excluded.state,
  terminal = excluded.terminal,
  record = excluded.record,
  updated_at = excluded.updated_at
"#,
        params![
            &swap.id,
            &swap.peer_id,
            swap.asset.as_str(),
            swap.state.as_str(),
            swap.state.is_terminal(),
            json,
            swap.created_at.to_rfc3339(),
            swap.updated_at.to_rfc3339(),
        ],
    )
    .with_context(|| format!("upsert swap {}", swap.id))?;
    Ok(())
}

fn decode_swap(json: &str) -> Result<Swap> {
    serde_json::from_str(json).context("decode swap record")
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("parse timestamp {s}"))?
        .with_timezone(&Utc))
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS swaps (
  swap_id TEXT PRIMARY KEY,
  peer_id TEXT NOT NULL,
  asset TEXT NOT NULL,
  state TEXT NOT NULL,
  terminal INTEGER NOT NULL,
  record TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS swaps_terminal_idx ON swaps(terminal);

CREATE TABLE IF NOT EXISTS swap_transitions (
  swap_id TEXT NOT NULL REFERENCES swaps(swap_id),
  seq INTEGER NOT NULL,
  state TEXT NOT NULL,
  transition TEXT NOT NULL,
  at TEXT NOT NULL,
  PRIMARY KEY (swap_id, seq)
);

CREATE TABLE IF NOT EXISTS requested_swaps (
  swap_id TEXT PRIMARY KEY,
  peer_id TEXT NOT NULL,
  rejected INTEGER NOT NULL DEFAULT 0,
  record TEXT NOT NULL,
  received_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS peer_polls (
  peer_id TEXT PRIMARY KEY,
  record TEXT NOT NULL,
  received_at TEXT NOT NULL
);
"#,
    )
    .context("create tables")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::{Asset, SwapKind, SwapState};

    fn open() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("swaps.sqlite")).unwrap();
        (dir, store)
    }

    #[test]
    fn record_transition_updates_row_and_log_together() {
        let (_dir, store) = open();
        let mut swap =
            Swap::new_initiator(SwapKind::SwapOut, Asset::Bitcoin, "bob", 50_000, Utc::now());
        let created = Transition::Created {
            swap: Box::new(swap.clone()),
        };
        assert_eq!(store.record_transition(&swap, &created, swap.created_at).unwrap(), 1);

        let at = Utc::now();
        swap.apply(&Transition::RequestSent, at).unwrap();
        assert_eq!(
            store
                .record_transition(&swap, &Transition::RequestSent, at)
                .unwrap(),
            2
        );

        let stored = store.get(&swap.id).unwrap().unwrap();
        assert_eq!(stored.state, SwapState::RequestSent);
        let history = store.history(&swap.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(Swap::replay(&history).unwrap(), stored);
    }

    #[test]
    fn terminal_swaps_are_not_listed_for_recovery() {
        let (_dir, store) = open();
        let mut swap =
            Swap::new_initiator(SwapKind::SwapIn, Asset::Liquid, "bob", 10_000, Utc::now());
        store.put(&swap).unwrap();
        assert_eq!(store.list_non_terminal().unwrap().len(), 1);

        swap.apply(
            &Transition::Canceled {
                reason: "test".into(),
            },
            Utc::now(),
        )
        .unwrap();
        store.put(&swap).unwrap();
        assert!(store.list_non_terminal().unwrap().is_empty());
        assert_eq!(store.list().unwrap().len(), 1);
    }
}
