use crate::hash::ObjectId;
use log::debug;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Keeps committed objects in memory, keyed by object name
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn commit(&self, content: Vec<u8>, objects: &[ObjectId]) {
        let mut stored = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        for object in objects {
            debug!("mem: stored {} ({} bytes)", object, content.len());
            stored.insert(object.to_string(), content.clone());
        }
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Sorted names of every stored object
    pub fn object_names(&self) -> Vec<String> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
