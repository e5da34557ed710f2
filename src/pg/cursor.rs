//! Incremental result consumption through a server-side portal.

use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use super::client::{Client, CursorRequest};
use super::error::{PgError, PgResult};
use super::types::{PgValue, Row};

/// Cursor lifecycle. `Closed` is reachable from every state and terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Unopened,
    Open,
    Exhausted,
    Closed,
}

/// A cursor over the rows of one query.
///
/// The first [`read`](Cursor::read) opens the portal. Until the cursor is
/// exhausted or closed it holds its client's operation slot, so other
/// operations on that client wait behind it. Dropping an open cursor
/// closes the portal in the background.
pub struct Cursor<'c> {
    client: &'c Client,
    sql: String,
    params: Vec<PgValue>,
    state: CursorState,
    requests: Option<mpsc::UnboundedSender<CursorRequest>>,
}

impl<'c> Cursor<'c> {
    pub(crate) fn new(client: &'c Client, sql: &str, params: &[PgValue]) -> Self {
        Self {
            client,
            sql: sql.to_string(),
            params: params.to_vec(),
            state: CursorState::Unopened,
            requests: None,
        }
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Fetch up to `rows` rows.
    ///
    /// Fewer than `rows` rows means the result is exhausted; every read
    /// after that returns an empty batch. Reading a closed cursor fails
    /// with `CursorClosed`. A server error closes the cursor.
    pub async fn read(&mut self, rows: usize) -> PgResult<Vec<Row>> {
        match self.state {
            CursorState::Closed => return Err(PgError::CursorClosed),
            CursorState::Exhausted => return Ok(Vec::new()),
            _ if rows == 0 => return Ok(Vec::new()),
            _ => {}
        }

        let batch = match self.requests {
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                let batch = self.client.open_cursor(&self.sql, &self.params, rows, rx).await;
                self.requests = Some(tx);
                batch
            }
            Some(ref requests) => {
                let (reply, result) = oneshot::channel();
                match requests.send(CursorRequest::Fetch { rows, reply }) {
                    Ok(()) => result.await.unwrap_or(Err(PgError::ConnectionClosed)),
                    Err(_) => Err(PgError::ConnectionClosed),
                }
            }
        };

        match batch {
            Ok(batch) if batch.done => {
                trace!(rows = batch.rows.len(), "cursor exhausted");
                self.state = CursorState::Exhausted;
                self.requests = None;
                Ok(batch.rows)
            }
            Ok(batch) => {
                self.state = CursorState::Open;
                Ok(batch.rows)
            }
            Err(err) => {
                self.state = CursorState::Closed;
                self.requests = None;
                Err(err)
            }
        }
    }

    /// Release the portal. Safe from any state; closing twice is a no-op.
    pub async fn close(&mut self) -> PgResult<()> {
        self.state = CursorState::Closed;
        let Some(requests) = self.requests.take() else {
            return Ok(());
        };

        let (reply, result) = oneshot::channel();
        match requests.send(CursorRequest::Close { reply }) {
            Ok(()) => result.await.unwrap_or(Err(PgError::ConnectionClosed)),
            // The connection is gone and the portal with it.
            Err(_) => Ok(()),
        }
    }
}

impl std::fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("sql", &self.sql)
            .field("state", &self.state)
            .finish()
    }
}
