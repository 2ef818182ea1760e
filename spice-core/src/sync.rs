//! Cross-channel serial barriers.
//!
//! Every channel records the serial of the last message it finished
//! dispatching. [`SyncTable::wait`] blocks until each listed channel has
//! caught up, rechecking on every broadcast and giving up as soon as the
//! session starts aborting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::trace;

use crate::error::SpiceError;
use crate::message::ChannelIdentity;
use crate::protocol::control::WaitEntry;

#[derive(Debug, Default)]
pub struct SyncTable {
    serials: Mutex<HashMap<ChannelIdentity, u64>>,
    changed: Notify,
    aborting: AtomicBool,
}

impl SyncTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ChannelIdentity, u64>> {
        self.serials.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record that `identity` finished dispatching message `serial`.
    pub fn update(&self, identity: ChannelIdentity, serial: u64) {
        self.lock().insert(identity, serial);
        self.changed.notify_waiters();
    }

    /// Last serial dispatched by `identity`, 0 if none yet.
    pub fn serial(&self, identity: ChannelIdentity) -> u64 {
        self.lock().get(&identity).copied().unwrap_or(0)
    }

    fn satisfied(&self, entries: &[WaitEntry]) -> bool {
        let table = self.lock();
        entries.iter().all(|e| {
            let id = ChannelIdentity::new(e.channel_type, e.channel_id);
            table.get(&id).copied().unwrap_or(0) >= e.serial
        })
    }

    /// Wait until every entry's channel reached its serial.
    pub async fn wait(&self, entries: &[WaitEntry]) -> Result<(), SpiceError> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_aborting() {
                return Err(SpiceError::Aborted);
            }
            if self.satisfied(entries) {
                return Ok(());
            }
            trace!(waiting = entries.len(), "channel barrier not reached");
            notified.await;
        }
    }

    /// Release every waiter with [`SpiceError::Aborted`] until
    /// [`resume`](Self::resume) is called.
    pub fn abort(&self) {
        self.aborting.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// Forget every recorded serial and clear the aborting state.
    pub fn reset(&self) {
        self.lock().clear();
        self.resume();
    }

    pub fn resume(&self) {
        self.aborting.store(false, Ordering::SeqCst);
    }

    pub fn is_aborting(&self) -> bool {
        self.aborting.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ChannelType;
    use std::sync::Arc;
    use std::time::Duration;

    fn entry(ty: ChannelType, id: u8, serial: u64) -> WaitEntry {
        WaitEntry {
            channel_type: ty,
            channel_id: id,
            serial,
        }
    }

    #[tokio::test]
    async fn wait_returns_once_all_serials_reached() {
        let table = Arc::new(SyncTable::new());
        let waiter = {
            let table = table.clone();
            tokio::spawn(async move {
                table
                    .wait(&[entry(ChannelType::Display, 0, 5), entry(ChannelType::Cursor, 0, 2)])
                    .await
            })
        };

        table.update(ChannelIdentity::new(ChannelType::Display, 0), 5);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        table.update(ChannelIdentity::new(ChannelType::Cursor, 0), 3);
        let r = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(r.is_ok());
    }

    #[tokio::test]
    async fn already_satisfied_returns_immediately() {
        let table = SyncTable::new();
        table.update(ChannelIdentity::new(ChannelType::Display, 1), 9);
        table.wait(&[entry(ChannelType::Display, 1, 9)]).await.unwrap();
        table.wait(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn abort_releases_waiters() {
        let table = Arc::new(SyncTable::new());
        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.wait(&[entry(ChannelType::Record, 0, 1)]).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        table.abort();
        let r = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(matches!(r, Err(SpiceError::Aborted)));

        table.resume();
        assert!(!table.is_aborting());
    }

    #[test]
    fn waiter_rechecks_on_every_wake() {
        use tokio_test::{assert_pending, assert_ready_ok};

        let table = SyncTable::new();
        let display = ChannelIdentity::new(ChannelType::Display, 0);
        let entries = [entry(ChannelType::Display, 0, 2)];
        let mut wait = tokio_test::task::spawn(table.wait(&entries));
        assert_pending!(wait.poll());

        table.update(display, 1);
        assert!(wait.is_woken());
        assert_pending!(wait.poll());

        table.update(display, 2);
        assert!(wait.is_woken());
        assert_ready_ok!(wait.poll());
    }
}
