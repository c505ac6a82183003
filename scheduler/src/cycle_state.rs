//! Per-cycle typed key-value store threaded through a single pod's scheduling cycle.
//!
//! One `CycleState` is created per pod per cycle. `ProfileClassifier` writes the
//! `SchedulingProfile` into it during Pre-Filter; every other plugin reads it back.
//! Nothing written here survives past the cycle it belongs to — the only state that
//! outlives a cycle is the process-wide maps each plugin owns directly
//! (`PodGroupInfo`, `GangNUMAState`, the reservation cache).

use std::any::Any;
use std::collections::HashMap;

#[derive(Default)]
pub struct CycleState {
    storage: HashMap<&'static str, Box<dyn Any + Send + Sync>>,
}

impl CycleState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read<T: 'static>(&self, key: &'static str) -> Option<&T> {
        self.storage.get(key).and_then(|v| v.downcast_ref())
    }

    pub fn write<T: Send + Sync + 'static>(&mut self, key: &'static str, value: T) {
        self.storage.insert(key, Box::new(value));
    }
}
