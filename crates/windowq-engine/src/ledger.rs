//! Implementation of the state ledger.
//!
//! The ledger is the single source of truth for scheduling decisions. It
//! holds four collections (queued, active, completed and failed) plus a
//! pause flag, and persists every change to its [`LedgerStore`] before the
//! changing operation returns.
//!
//! Operations that touch two collections write them in an order that a
//! subsequent [`Ledger::open`] can always repair: an interrupted
//! [`Ledger::retire`] may leave an active record next to its own terminal
//! record, which is dropped on load.

mod record;
mod store;

use std::collections::HashSet;
use std::collections::VecDeque;
use std::io;

use chrono::DateTime;
use chrono::Utc;
pub use record::ActiveRecord;
pub use record::FIELD_DELIMITER;
pub use record::TerminalRecord;
pub use record::TerminalStatus;
pub(crate) use record::unpersistable_field;
pub use store::Collection;
pub use store::FileStore;
pub use store::LedgerStore;
pub use store::MemoryStore;
use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::DeviceId;
use crate::WindowDescriptor;
use crate::WindowId;

/// Represents a ledger error.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The store failed to read or write a collection.
    #[error("failed to access ledger: {0}")]
    Io(#[from] io::Error),

    /// A persisted record could not be parsed.
    #[error("malformed record on line {line} of ledger collection `{collection}`: {reason}")]
    Malformed {
        /// The collection containing the record.
        collection: Collection,
        /// The one-based line number of the record.
        line: usize,
        /// Why the record could not be parsed.
        reason: String,
    },

    /// A window field cannot be persisted.
    #[error("window `{window}` cannot be recorded: its {field} contains a reserved character")]
    Unpersistable {
        /// The window.
        window: WindowId,
        /// The offending field.
        field: &'static str,
    },

    /// The window is already queued or active.
    #[error("window `{0}` is already queued or active")]
    AlreadyTracked(WindowId),

    /// The device is already bound to an active job.
    #[error("device {device} is already bound to active window `{window}`")]
    DeviceBusy {
        /// The requested device.
        device: DeviceId,
        /// The window holding the device.
        window: WindowId,
    },

    /// The window is not active.
    #[error("window `{0}` is not active")]
    NotActive(WindowId),
}

/// The result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Represents the durable record of job state.
#[derive(Debug)]
pub struct Ledger {
    /// The persistence backing the ledger.
    store: Box<dyn LedgerStore>,
    /// The windows awaiting dispatch, in dispatch order.
    queued: VecDeque<WindowDescriptor>,
    /// The jobs bound to a device.
    active: Vec<ActiveRecord>,
    /// The jobs that finished successfully.
    completed: Vec<TerminalRecord>,
    /// The jobs that finished unsuccessfully.
    failed: Vec<TerminalRecord>,
}

impl Ledger {
    /// Opens a ledger from the given store.
    ///
    /// Opening never writes to the store, so it is safe for read-only
    /// monitoring. State left behind by an interrupted operation is repaired
    /// in memory; the repair becomes durable with the next write.
    pub fn open(store: impl LedgerStore + 'static) -> Result<Self> {
        let store: Box<dyn LedgerStore> = Box::new(store);

        let queued: VecDeque<_> = read_records(store.as_ref(), Collection::Queue, |l| {
            record::decode_window(l)
        })?
        .into();
        let active = read_records(store.as_ref(), Collection::Active, ActiveRecord::decode)?;
        let completed = read_records(store.as_ref(), Collection::Completed, TerminalRecord::decode)?;
        let failed = read_records(store.as_ref(), Collection::Failed, TerminalRecord::decode)?;

        let mut ledger = Self {
            store,
            queued,
            active,
            completed,
            failed,
        };
        ledger.repair();
        Ok(ledger)
    }

    /// Repairs state left behind by an interrupted operation.
    fn repair(&mut self) {
        let Self {
            active,
            completed,
            failed,
            queued,
            ..
        } = self;

        active.retain(|a| {
            let retired = completed.iter().chain(failed.iter()).any(|t| t.terminates(a));
            if retired {
                warn!(
                    "dropping active record for window `{window}` that already has a terminal \
                     record",
                    window = a.window.id()
                );
            }

            !retired
        });

        let active: HashSet<_> = active.iter().map(|a| a.window.id().clone()).collect();
        let mut seen = HashSet::new();
        queued.retain(|w| {
            if active.contains(w.id()) {
                warn!(
                    "dropping queued entry for window `{window}` that is already active",
                    window = w.id()
                );
                return false;
            }

            if !seen.insert(w.id().clone()) {
                warn!(
                    "dropping duplicate queued entry for window `{window}`",
                    window = w.id()
                );
                return false;
            }

            true
        });
    }

    /// Gets the windows awaiting dispatch, in dispatch order.
    pub fn queued(&self) -> &VecDeque<WindowDescriptor> {
        &self.queued
    }

    /// Gets the active records.
    pub fn active(&self) -> &[ActiveRecord] {
        &self.active
    }

    /// Gets the completed records.
    pub fn completed(&self) -> &[TerminalRecord] {
        &self.completed
    }

    /// Gets the failed records.
    pub fn failed(&self) -> &[TerminalRecord] {
        &self.failed
    }

    /// Gets the number of queued windows.
    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }

    /// Gets the number of active jobs.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Gets the number of completed jobs.
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Gets the number of failed jobs.
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// Determines if there is neither queued nor active work.
    pub fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.active.is_empty()
    }

    /// Determines if the window is queued or active.
    pub fn is_tracked(&self, id: &WindowId) -> bool {
        self.queued.iter().any(|w| w.id() == id) || self.active.iter().any(|a| a.window.id() == id)
    }

    /// Appends a window to the back of the queue.
    pub fn enqueue(&mut self, window: WindowDescriptor) -> Result<()> {
        self.enqueue_all([window]).map(|_| ())
    }

    /// Appends windows to the back of the queue as a single durable write.
    ///
    /// Either every window is enqueued or none is. Returns the number of
    /// windows enqueued.
    pub fn enqueue_all(
        &mut self,
        windows: impl IntoIterator<Item = WindowDescriptor>,
    ) -> Result<usize> {
        let windows: Vec<_> = windows.into_iter().collect();
        let mut incoming = HashSet::new();
        for window in &windows {
            check_persistable(window)?;
            if self.is_tracked(window.id()) || !incoming.insert(window.id()) {
                return Err(LedgerError::AlreadyTracked(window.id().clone()));
            }
        }

        if windows.is_empty() {
            return Ok(0);
        }

        let count = windows.len();
        let mut queued = self.queued.clone();
        queued.extend(windows);
        self.write_queue(&queued)?;
        self.queued = queued;

        debug!("enqueued {count} window(s)");
        Ok(count)
    }

    /// Removes and returns the window at the front of the queue.
    pub fn dequeue_front(&mut self) -> Result<Option<WindowDescriptor>> {
        let Some(front) = self.queued.front().cloned() else {
            return Ok(None);
        };

        let queued: VecDeque<_> = self.queued.iter().skip(1).cloned().collect();
        self.write_queue(&queued)?;
        self.queued = queued;
        Ok(Some(front))
    }

    /// Records a launched job as active.
    ///
    /// Fails if the window is queued or active, or if the record's device is
    /// already bound to another active job.
    pub fn promote_to_active(&mut self, record: ActiveRecord) -> Result<()> {
        check_persistable(&record.window)?;

        if self.is_tracked(record.window.id()) {
            return Err(LedgerError::AlreadyTracked(record.window.id().clone()));
        }

        if let Some(existing) = self.active.iter().find(|a| a.device == record.device) {
            return Err(LedgerError::DeviceBusy {
                device: record.device,
                window: existing.window.id().clone(),
            });
        }

        let mut active = self.active.clone();
        active.push(record);
        self.write_active(&active)?;
        self.active = active;
        Ok(())
    }

    /// Retires an active job with the given terminal status.
    ///
    /// The job is removed from the active collection and exactly one terminal
    /// record is appended: to the completed collection for a success and to
    /// the failed collection otherwise.
    pub fn retire(
        &mut self,
        id: &WindowId,
        status: TerminalStatus,
        finished: DateTime<Utc>,
    ) -> Result<TerminalRecord> {
        let index = self
            .active
            .iter()
            .position(|a| a.window.id() == id)
            .ok_or_else(|| LedgerError::NotActive(id.clone()))?;

        let mut active = self.active.clone();
        let record = TerminalRecord::from_active(active.remove(index), finished, status);

        // The terminal record is written first; see `repair`
        self.append_terminal(record.clone())?;
        self.write_active(&active)?;
        self.active = active;
        Ok(record)
    }

    /// Records a job that failed to launch as a failed terminal record.
    ///
    /// The window must already have been dequeued; it never becomes active.
    pub fn record_launch_failure(
        &mut self,
        window: WindowDescriptor,
        device: DeviceId,
        pid: Option<u32>,
        started: DateTime<Utc>,
        finished: DateTime<Utc>,
    ) -> Result<TerminalRecord> {
        check_persistable(&window)?;

        let record = TerminalRecord::from_active(
            ActiveRecord::new(window, device, pid.unwrap_or(0), started),
            finished,
            TerminalStatus::Failed,
        );
        self.append_terminal(record.clone())?;
        Ok(record)
    }

    /// Re-queues the windows of failed records.
    ///
    /// If a status is given, only failed records with that status are
    /// re-queued. Windows already queued or active are skipped, as are
    /// repeated failures of the same window. The failed records themselves are
    /// kept. Returns the number of windows queued.
    pub fn requeue_failed(&mut self, status: Option<TerminalStatus>) -> Result<usize> {
        let mut seen = HashSet::new();
        let windows: Vec<_> = self
            .failed
            .iter()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .filter(|r| !self.is_tracked(r.window.id()))
            .filter(|r| seen.insert(r.window.id().clone()))
            .map(|r| r.window.clone())
            .collect();

        let count = self.enqueue_all(windows)?;
        if count > 0 {
            info!("re-queued {count} failed window(s)");
        }

        Ok(count)
    }

    /// Determines if dispatch is paused.
    ///
    /// The flag is read from the store on every call so that a pause
    /// requested by another process takes effect.
    pub fn is_paused(&self) -> Result<bool> {
        Ok(self.store.paused()?)
    }

    /// Pauses or resumes dispatch.
    pub fn set_paused(&mut self, paused: bool) -> Result<()> {
        self.store.set_paused(paused)?;
        Ok(())
    }

    /// Clears every collection and the pause flag.
    pub fn clear(&mut self) -> Result<()> {
        for collection in Collection::ALL {
            self.store.write(collection, &[])?;
        }

        self.store.set_paused(false)?;
        self.queued.clear();
        self.active.clear();
        self.completed.clear();
        self.failed.clear();

        info!("cleared the ledger");
        Ok(())
    }

    /// Writes the given queue to the store.
    fn write_queue(&self, queued: &VecDeque<WindowDescriptor>) -> Result<()> {
        let lines: Vec<_> = queued.iter().map(record::encode_window).collect();
        self.store.write(Collection::Queue, &lines)?;
        Ok(())
    }

    /// Writes the given active records to the store.
    fn write_active(&self, active: &[ActiveRecord]) -> Result<()> {
        let lines: Vec<_> = active.iter().map(ActiveRecord::encode).collect();
        self.store.write(Collection::Active, &lines)?;
        Ok(())
    }

    /// Appends a terminal record to the collection matching its status.
    fn append_terminal(&mut self, record: TerminalRecord) -> Result<()> {
        let (collection, records) = if record.status.is_success() {
            (Collection::Completed, &mut self.completed)
        } else {
            (Collection::Failed, &mut self.failed)
        };

        let lines: Vec<_> = records
            .iter()
            .chain(std::iter::once(&record))
            .map(TerminalRecord::encode)
            .collect();
        self.store.write(collection, &lines)?;
        records.push(record);
        Ok(())
    }
}

/// Ensures a window can be persisted.
fn check_persistable(window: &WindowDescriptor) -> Result<()> {
    match unpersistable_field(window) {
        Some(field) => Err(LedgerError::Unpersistable {
            window: window.id().clone(),
            field,
        }),
        None => Ok(()),
    }
}

/// Reads and decodes every record of a collection.
fn read_records<T>(
    store: &dyn LedgerStore,
    collection: Collection,
    decode: impl Fn(&str) -> std::result::Result<T, String>,
) -> Result<Vec<T>> {
    store
        .read(collection)?
        .iter()
        .enumerate()
        .map(|(i, line)| {
            decode(line).map_err(|reason| LedgerError::Malformed {
                collection,
                line: i + 1,
                reason,
            })
        })
        .collect()
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    fn window(sequence: u32) -> WindowDescriptor {
        WindowDescriptor::new(
            WindowId::new("g", "bound", "vdw", sequence),
            format!("/data/g/bound/vdw.{sequence}"),
        )
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn ids(windows: &VecDeque<WindowDescriptor>) -> Vec<u32> {
        windows.iter().map(|w| w.id().sequence).collect()
    }

    #[test]
    fn fifo_queue_is_persisted() {
        let store = MemoryStore::new();
        let mut ledger = Ledger::open(store.clone()).unwrap();
        ledger.enqueue_all([window(2), window(0), window(1)]).unwrap();

        assert_eq!(ids(ledger.queued()), [2, 0, 1]);
        assert_eq!(ledger.dequeue_front().unwrap().unwrap(), window(2));

        let reopened = Ledger::open(store).unwrap();
        assert_eq!(ids(reopened.queued()), [0, 1]);
    }

    #[test]
    fn enqueue_rejects_tracked_windows() {
        let mut ledger = Ledger::open(MemoryStore::new()).unwrap();
        ledger.enqueue(window(0)).unwrap();
        assert!(matches!(
            ledger.enqueue(window(0)),
            Err(LedgerError::AlreadyTracked(_))
        ));

        // A batch with an internal duplicate is rejected as a whole
        assert!(ledger.enqueue_all([window(1), window(1)]).is_err());
        assert_eq!(ledger.queued_count(), 1);

        let front = ledger.dequeue_front().unwrap().unwrap();
        ledger
            .promote_to_active(ActiveRecord::new(front, 0, 10, at(0)))
            .unwrap();
        assert!(matches!(
            ledger.enqueue(window(0)),
            Err(LedgerError::AlreadyTracked(_))
        ));
    }

    #[test]
    fn unpersistable_window_is_rejected() {
        let mut ledger = Ledger::open(MemoryStore::new()).unwrap();
        let bad = WindowDescriptor::new(WindowId::new("g", "bound", "vdw", 0), "/a|b");
        assert!(matches!(
            ledger.enqueue(bad),
            Err(LedgerError::Unpersistable {
                field: "location",
                ..
            })
        ));
        assert_eq!(ledger.queued_count(), 0);
    }

    #[test]
    fn promote_rejects_busy_device() {
        let mut ledger = Ledger::open(MemoryStore::new()).unwrap();
        ledger
            .promote_to_active(ActiveRecord::new(window(0), 1, 10, at(0)))
            .unwrap();

        match ledger.promote_to_active(ActiveRecord::new(window(1), 1, 11, at(0))) {
            Err(LedgerError::DeviceBusy { device, window }) => {
                assert_eq!(device, 1);
                assert_eq!(window.sequence, 0);
            }
            r => panic!("unexpected result {r:?}"),
        }
        assert_eq!(ledger.active_count(), 1);
    }

    #[test]
    fn retire_appends_one_terminal_record() {
        let store = MemoryStore::new();
        let mut ledger = Ledger::open(store.clone()).unwrap();
        ledger
            .promote_to_active(ActiveRecord::new(window(0), 0, 10, at(0)))
            .unwrap();
        ledger
            .promote_to_active(ActiveRecord::new(window(1), 1, 11, at(0)))
            .unwrap();

        let record = ledger
            .retire(window(0).id(), TerminalStatus::Success, at(65))
            .unwrap();
        assert_eq!(record.duration.as_secs(), 65);
        ledger
            .retire(window(1).id(), TerminalStatus::Incomplete, at(3))
            .unwrap();

        assert!(matches!(
            ledger.retire(window(1).id(), TerminalStatus::Failed, at(4)),
            Err(LedgerError::NotActive(_))
        ));

        let reopened = Ledger::open(store).unwrap();
        assert_eq!(reopened.active_count(), 0);
        assert_eq!(reopened.completed(), ledger.completed());
        assert_eq!(reopened.failed(), ledger.failed());
        assert_eq!(reopened.completed_count(), 1);
        assert_eq!(reopened.failed()[0].status, TerminalStatus::Incomplete);
    }

    #[test]
    fn interrupted_retire_is_repaired_on_open() {
        let store = MemoryStore::new();
        let mut ledger = Ledger::open(store.clone()).unwrap();
        let active = ActiveRecord::new(window(0), 0, 10, at(0));
        ledger.promote_to_active(active.clone()).unwrap();
        ledger
            .retire(window(0).id(), TerminalStatus::Failed, at(9))
            .unwrap();

        // Simulate an interruption between the two writes of `retire`
        store
            .write(Collection::Active, &[active.encode()])
            .unwrap();

        let reopened = Ledger::open(store).unwrap();
        assert_eq!(reopened.active_count(), 0);
        assert_eq!(reopened.failed_count(), 1);
    }

    #[test]
    fn queued_and_active_overlap_is_repaired_on_open() {
        let store = MemoryStore::new();
        store
            .write(
                Collection::Queue,
                &[
                    record::encode_window(&window(0)),
                    record::encode_window(&window(1)),
                    record::encode_window(&window(1)),
                ],
            )
            .unwrap();
        store
            .write(
                Collection::Active,
                &[ActiveRecord::new(window(0), 0, 10, at(0)).encode()],
            )
            .unwrap();

        let ledger = Ledger::open(store).unwrap();
        assert_eq!(ids(ledger.queued()), [1]);
        assert_eq!(ledger.active_count(), 1);
    }

    #[test]
    fn malformed_records_are_reported() {
        let store = MemoryStore::new();
        store
            .write(
                Collection::Queue,
                &[record::encode_window(&window(0)), "garbage".to_string()],
            )
            .unwrap();

        match Ledger::open(store) {
            Err(LedgerError::Malformed {
                collection, line, ..
            }) => {
                assert_eq!(collection, Collection::Queue);
                assert_eq!(line, 2);
            }
            r => panic!("unexpected result {r:?}"),
        }
    }

    #[test]
    fn launch_failures_are_failed_records() {
        let mut ledger = Ledger::open(MemoryStore::new()).unwrap();
        let record = ledger
            .record_launch_failure(window(3), 2, None, at(0), at(2))
            .unwrap();
        assert_eq!(record.status, TerminalStatus::Failed);
        assert_eq!(record.pid, 0);
        assert_eq!(ledger.failed_count(), 1);
        assert_eq!(ledger.active_count(), 0);
    }

    #[test]
    fn requeue_failed_windows() {
        let mut ledger = Ledger::open(MemoryStore::new()).unwrap();
        for (sequence, status) in [
            (0, TerminalStatus::Failed),
            (1, TerminalStatus::Incomplete),
            (2, TerminalStatus::Success),
        ] {
            ledger
                .promote_to_active(ActiveRecord::new(window(sequence), sequence, 1, at(0)))
                .unwrap();
            ledger.retire(window(sequence).id(), status, at(1)).unwrap();
        }
        ledger
            .record_launch_failure(window(0), 0, None, at(2), at(2))
            .unwrap();

        assert_eq!(
            ledger
                .requeue_failed(Some(TerminalStatus::Incomplete))
                .unwrap(),
            1
        );
        assert_eq!(ids(ledger.queued()), [1]);

        assert_eq!(ledger.requeue_failed(None).unwrap(), 1);
        assert_eq!(ids(ledger.queued()), [1, 0]);
        assert_eq!(ledger.failed_count(), 3, "failed records are kept");
        assert_eq!(ledger.requeue_failed(None).unwrap(), 0);
    }

    #[test]
    fn pause_and_clear() {
        let store = MemoryStore::new();
        let mut ledger = Ledger::open(store.clone()).unwrap();
        ledger.enqueue(window(0)).unwrap();
        ledger.set_paused(true).unwrap();
        assert!(ledger.is_paused().unwrap());

        // A pause requested through another handle is observed
        store.set_paused(false).unwrap();
        assert!(!ledger.is_paused().unwrap());
        store.set_paused(true).unwrap();

        ledger.clear().unwrap();
        assert!(!ledger.is_paused().unwrap());
        assert!(ledger.is_idle());
        assert!(Ledger::open(store).unwrap().is_idle());
    }
}
