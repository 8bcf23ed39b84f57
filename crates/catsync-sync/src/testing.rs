//! Scripted source and store doubles shared by the unit tests.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use catsync_core::{extract_keywords, normalize, CatalogRecord, RawCatalogRow};
use catsync_source::{CatalogSource, SourceError};
use catsync_store::{CatalogStore, MemoryCatalogStore, StoreError};
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::Notify;

pub fn raw(code: &str, description: &str, price_cents: i64) -> RawCatalogRow {
    RawCatalogRow::new(code, Some(description), Decimal::new(price_cents, 2))
}

pub fn record(code: &str) -> CatalogRecord {
    let description = format!("Producto {code}");
    CatalogRecord {
        code: code.to_string(),
        normalized_description: normalize(&description),
        keywords: extract_keywords(&description),
        description,
        price: Decimal::new(1000, 2),
        updated_at: Utc::now(),
    }
}

fn unavailable() -> StoreError {
    StoreError::HttpStatus {
        status: 503,
        url: "memory://scripted".to_string(),
        body: "scripted failure".to_string(),
    }
}

pub struct ScriptedSource {
    rows: Vec<RawCatalogRow>,
    fail: bool,
    gate: Option<Gate>,
    calls: AtomicUsize,
}

/// Lets a test hold a run inside the extraction stage.
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

impl ScriptedSource {
    pub fn new(rows: Vec<RawCatalogRow>) -> Self {
        Self {
            rows,
            fail: false,
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn gated(rows: Vec<RawCatalogRow>) -> Self {
        Self {
            gate: Some(Gate {
                entered: Notify::new(),
                release: Notify::new(),
            }),
            ..Self::new(rows)
        }
    }

    pub fn gate(&self) -> &Gate {
        self.gate.as_ref().expect("source is not gated")
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatalogSource for ScriptedSource {
    async fn fetch_rows(&self) -> Result<Vec<RawCatalogRow>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if self.fail {
            return Err(SourceError::Timeout(std::time::Duration::from_secs(30)));
        }
        Ok(self.rows.clone())
    }
}

/// In-memory store with failure injection and call recording.
#[derive(Default)]
pub struct ScriptedStore {
    inner: MemoryCatalogStore,
    fail_list: AtomicBool,
    fail_upsert_calls: Mutex<HashSet<usize>>,
    fail_delete_codes: Mutex<HashSet<String>>,
    panic_delete_codes: Mutex<HashSet<String>>,
    delete_delay_ms: AtomicU64,
    deletes_in_flight: AtomicUsize,
    peak_deletes: AtomicUsize,
    upsert_sizes: Mutex<Vec<usize>>,
    delete_chunks: Mutex<Vec<Vec<String>>>,
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<CatalogRecord>) -> Self {
        Self {
            inner: MemoryCatalogStore::with_records(records),
            ..Self::default()
        }
    }

    pub fn with_codes(codes: &[&str]) -> Self {
        Self::with_records(codes.iter().map(|c| record(c)).collect())
    }

    pub fn fail_list(&self) {
        self.fail_list.store(true, Ordering::SeqCst);
    }

    /// 1-based index of the upsert call that should fail.
    pub fn fail_upsert_call(&self, call: usize) {
        self.fail_upsert_calls.lock().unwrap().insert(call);
    }

    pub fn fail_delete_containing(&self, code: &str) {
        self.fail_delete_codes.lock().unwrap().insert(code.to_string());
    }

    /// The delete task itself panics when it sees `code`.
    pub fn panic_delete_containing(&self, code: &str) {
        self.panic_delete_codes.lock().unwrap().insert(code.to_string());
    }

    /// Hold every delete call open for `delay` so overlapping calls show up.
    pub fn slow_deletes(&self, delay: Duration) {
        self.delete_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Highest number of `delete_codes` calls seen in flight at once.
    pub fn peak_deletes(&self) -> usize {
        self.peak_deletes.load(Ordering::SeqCst)
    }

    pub fn upsert_sizes(&self) -> Vec<usize> {
        self.upsert_sizes.lock().unwrap().clone()
    }

    pub fn delete_chunks(&self) -> Vec<Vec<String>> {
        self.delete_chunks.lock().unwrap().clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.len().await
    }

    pub async fn codes(&self) -> BTreeSet<String> {
        self.inner.list_codes().await.unwrap()
    }
}

#[async_trait]
impl CatalogStore for ScriptedStore {
    async fn upsert(&self, records: &[CatalogRecord]) -> Result<(), StoreError> {
        let call = {
            let mut sizes = self.upsert_sizes.lock().unwrap();
            sizes.push(records.len());
            sizes.len()
        };
        if self.fail_upsert_calls.lock().unwrap().contains(&call) {
            return Err(unavailable());
        }
        self.inner.upsert(records).await
    }

    async fn delete_codes(&self, codes: &[String]) -> Result<(), StoreError> {
        self.delete_chunks.lock().unwrap().push(codes.to_vec());
        let in_flight = self.deletes_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_deletes.fetch_max(in_flight, Ordering::SeqCst);
        let delay = self.delete_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.deletes_in_flight.fetch_sub(1, Ordering::SeqCst);

        let explodes = {
            let panicking = self.panic_delete_codes.lock().unwrap();
            codes.iter().any(|c| panicking.contains(c))
        };
        if explodes {
            panic!("scripted delete panic");
        }
        let poisoned = {
            let failing = self.fail_delete_codes.lock().unwrap();
            codes.iter().any(|c| failing.contains(c))
        };
        if poisoned {
            return Err(unavailable());
        }
        self.inner.delete_codes(codes).await
    }

    async fn list_codes(&self) -> Result<BTreeSet<String>, StoreError> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.inner.list_codes().await
    }
}
