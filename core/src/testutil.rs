//! Host fakes for the hardware collaborators

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;
use std::vec::Vec;

use hal_abstractions::{
    FileId, FileStore, RtcClock, RtcDateTime, RtcError, StorageError, TickCounter,
};

use crate::config::TimeSysConfig;
use crate::time::TimeSys;

/// Whether another context could run right now
///
/// The host critical-section implementation is one global lock, so a thread
/// that tries to enter a critical section stalls while the caller is inside
/// one, the way a masked interrupt would.
pub(crate) fn interrupts_enabled() -> bool {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        critical_section::with(|_| ());
        let _ = tx.send(());
    });
    rx.recv_timeout(Duration::from_millis(500)).is_ok()
}

pub(crate) struct FakeCounter {
    reload: AtomicU32,
    current: AtomicU32,
    wrap_pending: AtomicBool,
}

impl FakeCounter {
    pub(crate) fn new(reload: u32, current: u32) -> Self {
        Self {
            reload: AtomicU32::new(reload),
            current: AtomicU32::new(current),
            wrap_pending: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_wrap_pending(&self, pending: bool) {
        self.wrap_pending.store(pending, Ordering::Relaxed);
    }
}

impl TickCounter for FakeCounter {
    fn reload(&self) -> u32 {
        self.reload.load(Ordering::Relaxed)
    }

    fn current(&self) -> u32 {
        self.current.load(Ordering::Relaxed)
    }

    fn wrap_pending(&self) -> bool {
        self.wrap_pending.load(Ordering::Relaxed)
    }

    fn set_reload(&self, value: u32) {
        self.reload.store(value, Ordering::Relaxed);
    }
}

/// RTC that holds whatever it was last given; invalid until set
pub(crate) struct FakeRtc {
    date_time: Mutex<Option<RtcDateTime>>,
    micros: AtomicU64,
}

impl FakeRtc {
    pub(crate) fn new() -> Self {
        Self {
            date_time: Mutex::new(None),
            micros: AtomicU64::new(0),
        }
    }

    pub(crate) fn set(&self, dt: Option<RtcDateTime>) {
        *self.date_time.lock().unwrap() = dt;
    }

    pub(crate) fn advance_micros(&self, us: u64) {
        self.micros.fetch_add(us, Ordering::Relaxed);
    }
}

impl RtcClock for FakeRtc {
    fn is_valid(&self) -> bool {
        self.date_time.lock().unwrap().is_some()
    }

    fn date_time(&self) -> Result<RtcDateTime, RtcError> {
        self.date_time.lock().unwrap().ok_or(RtcError::NotInitialized)
    }

    fn set_date_time(&self, dt: RtcDateTime) -> Result<(), RtcError> {
        self.set(Some(dt));
        Ok(())
    }

    fn micros(&self) -> Result<u64, RtcError> {
        Ok(self.micros.load(Ordering::Relaxed))
    }
}

#[derive(Default)]
struct MemStoreInner {
    record: Option<Vec<u8>>,
    fail_writes: bool,
    check_interrupts: bool,
    writes: u32,
    masked_writes: u32,
}

/// Single-record store; clones share the same record
#[derive(Clone, Default)]
pub(crate) struct MemStore {
    inner: Arc<Mutex<MemStoreInner>>,
}

impl MemStore {
    pub(crate) fn with_record(data: &[u8]) -> Self {
        let store = Self::default();
        store.inner.lock().unwrap().record = Some(data.to_vec());
        store
    }

    pub(crate) fn record(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().record.clone()
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.inner.lock().unwrap().fail_writes = fail;
    }

    /// Record on every write whether interrupts were enabled
    pub(crate) fn check_interrupts(&self) {
        self.inner.lock().unwrap().check_interrupts = true;
    }

    /// Writes seen since [`MemStore::check_interrupts`], and how many of
    /// them ran with interrupts masked
    pub(crate) fn write_counts(&self) -> (u32, u32) {
        let inner = self.inner.lock().unwrap();
        (inner.writes, inner.masked_writes)
    }
}

impl FileStore for MemStore {
    fn read(&mut self, id: FileId, buf: &mut [u8]) -> Result<usize, StorageError> {
        assert_eq!(id, FileId::TIME_SYS);
        let inner = self.inner.lock().unwrap();
        let record = inner.record.as_ref().ok_or(StorageError::NotFound)?;
        let n = record.len().min(buf.len());
        buf[..n].copy_from_slice(&record[..n]);
        Ok(n)
    }

    fn write(&mut self, id: FileId, data: &[u8]) -> Result<(), StorageError> {
        assert_eq!(id, FileId::TIME_SYS);
        let mut inner = self.inner.lock().unwrap();
        if inner.check_interrupts {
            inner.writes += 1;
            if !interrupts_enabled() {
                inner.masked_writes += 1;
            }
        }
        if inner.fail_writes {
            return Err(StorageError::Io);
        }
        inner.record = Some(data.to_vec());
        Ok(())
    }
}

/// Fake board: owns the collaborators a [`TimeSys`] borrows
pub(crate) struct TestHw {
    pub rtc: FakeRtc,
}

impl TestHw {
    pub(crate) fn new() -> Self {
        Self { rtc: FakeRtc::new() }
    }

    pub(crate) fn time_sys(&self) -> TimeSys<'_, MemStore> {
        self.time_sys_with_store(MemStore::default())
    }

    pub(crate) fn time_sys_with_store(&self, store: MemStore) -> TimeSys<'_, MemStore> {
        TimeSys::new(TimeSysConfig::default(), store, &self.rtc, None)
    }

    pub(crate) fn with_counter<'a>(&'a self, counter: &'a FakeCounter) -> TimeSys<'a, MemStore> {
        TimeSys::new(TimeSysConfig::default(), MemStore::default(), &self.rtc, Some(counter))
    }
}
