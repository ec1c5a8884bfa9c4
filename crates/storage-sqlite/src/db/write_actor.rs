//! Single writer for the database.
//!
//! SQLite allows one writer at a time. All writes are funnelled through one thread that owns
//! the write path; each job runs inside its own `BEGIN IMMEDIATE` transaction, so a job is
//! the unit of atomicity.

use std::sync::mpsc;

use diesel::sqlite::SqliteConnection;
use log::{debug, error};
use tokio::sync::oneshot;

use fieldsync_core::errors::Result;

use super::DbPool;
use crate::errors::StorageError;

type Job = Box<dyn FnOnce(&mut SqliteConnection) + Send + 'static>;

#[derive(Clone)]
pub struct WriteHandle {
    sender: mpsc::Sender<Job>,
}

impl WriteHandle {
    /// Runs `job` in one write transaction. An `Err` from the job rolls everything back.
    pub async fn exec<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel::<Result<T>>();
        let boxed: Job = Box::new(move |conn| {
            let result = conn
                .immediate_transaction::<T, StorageError, _>(|tx| job(tx).map_err(StorageError::Core))
                .map_err(Into::into);
            let _ = reply_tx.send(result);
        });
        self.sender
            .send(boxed)
            .map_err(|_| StorageError::WriterClosed)?;
        reply_rx.await.map_err(|_| StorageError::WriterClosed)?
    }
}

/// Spawns the writer thread. It exits once every [`WriteHandle`] is dropped.
pub fn spawn_writer(pool: DbPool) -> WriteHandle {
    let (sender, receiver) = mpsc::channel::<Job>();
    let spawned = std::thread::Builder::new()
        .name("fieldsync-db-writer".to_string())
        .spawn(move || {
            for job in receiver {
                match pool.get() {
                    Ok(mut conn) => job(&mut *conn),
                    Err(err) => {
                        // dropping the job drops its reply sender; the caller sees WriterClosed
                        error!("[LocalStore] Writer could not acquire a connection: {}", err);
                    }
                }
            }
            debug!("[LocalStore] Writer stopped");
        });
    if let Err(err) = spawned {
        error!("[LocalStore] Failed to spawn writer thread: {}", err);
    }
    WriteHandle { sender }
}
