use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use crate::error::{ErrorKind, SinkResult};
use crate::merge::MergeOperation;
use crate::script::{MapFunction, MergeFunction};
use crate::sink_error;
use crate::types::Document;

/// A merge function returning a fixed value and recording every operation it receives.
#[derive(Debug, Clone)]
pub struct RecordingMerge {
    result: Value,
    operations: Arc<Mutex<Vec<MergeOperation>>>,
}

impl RecordingMerge {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            operations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Returns the operations received so far.
    pub fn operations(&self) -> Vec<MergeOperation> {
        self.operations
            .lock()
            .map(|operations| operations.clone())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.operations().len()
    }
}

impl MergeFunction for RecordingMerge {
    fn merge(&self, op: &MergeOperation) -> SinkResult<Value> {
        if let Ok(mut operations) = self.operations.lock() {
            operations.push(op.clone());
        }

        Ok(self.result.clone())
    }
}

/// A merge function resolving unmerged properties by keeping the target's values.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferTarget;

impl MergeFunction for PreferTarget {
    fn merge(&self, op: &MergeOperation) -> SinkResult<Value> {
        let mut merged = op.target.clone();
        for (name, value) in op.proposed.iter() {
            if !op.unmerged.contains(name) {
                merged.insert(name.clone(), value.clone());
            }
        }

        Ok(json!({ "apply": merged.to_json() }))
    }
}

/// A merge function that always fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingMerge;

impl MergeFunction for FailingMerge {
    fn merge(&self, _op: &MergeOperation) -> SinkResult<Value> {
        Err(sink_error!(ErrorKind::InvalidState, "merge exploded"))
    }
}

/// A map function that sleeps before returning its input unchanged.
#[derive(Debug, Clone, Copy)]
pub struct SlowMap {
    delay: Duration,
}

impl SlowMap {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl MapFunction for SlowMap {
    fn map(&self, doc: &Document, _meta: &Document) -> SinkResult<Value> {
        std::thread::sleep(self.delay);
        Ok(doc.to_json())
    }
}

/// A map function counting its invocations and returning its input unchanged.
#[derive(Debug, Clone, Default)]
pub struct CountingMap {
    calls: Arc<AtomicUsize>,
}

impl CountingMap {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MapFunction for CountingMap {
    fn map(&self, doc: &Document, _meta: &Document) -> SinkResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(doc.to_json())
    }
}
