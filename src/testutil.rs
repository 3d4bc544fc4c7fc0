//! Test doubles shared by the unit tests

use crate::scale::{Scale, ScaleClient, ScaleError, ScaleTarget};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// In-memory scale client: serves canned scales and records patches.
///
/// `patch_scale` updates the stored desired count so subsequent reads see the
/// patch, mirroring what the API server reports immediately after a patch
/// (observed replicas lag behind until pods actually start or stop).
pub struct MockScaleClient {
    scales: Mutex<HashMap<String, Scale>>,
    patches: Mutex<Vec<(String, i32)>>,
    reads: AtomicUsize,
}

impl MockScaleClient {
    pub fn new() -> Self {
        Self {
            scales: Mutex::new(HashMap::new()),
            patches: Mutex::new(Vec::new()),
            reads: AtomicUsize::new(0),
        }
    }

    pub fn set_scale(&self, target: &str, scale: Scale) {
        self.scales.lock().insert(target.to_string(), scale);
    }

    /// All patches applied so far, as `(namespace/name, replicas)`
    pub fn patches(&self) -> Vec<(String, i32)> {
        self.patches.lock().clone()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScaleClient for MockScaleClient {
    async fn read_scale(&self, target: &ScaleTarget) -> Result<Scale, ScaleError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .scales
            .lock()
            .get(&target.to_string())
            .copied()
            .unwrap_or(Scale {
                desired: 0,
                observed: 0,
            }))
    }

    async fn patch_scale(&self, target: &ScaleTarget, replicas: i32) -> Result<(), ScaleError> {
        let key = target.to_string();
        self.patches.lock().push((key.clone(), replicas));
        let mut scales = self.scales.lock();
        let scale = scales.entry(key).or_insert(Scale {
            desired: 0,
            observed: 0,
        });
        scale.desired = replicas;
        Ok(())
    }
}
