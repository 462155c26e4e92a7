//! In-memory stand-ins for the queue and object storage.

use crate::queue::{QueueError, QueueMessage, ReceiptHandle, WorkQueue, WorkRequest};
use crate::transfer::{folder_key, ObjectPath, ObjectStore, TransferError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    body: Vec<u8>,
}

/// Queue with visibility-timeout semantics.
///
/// Received messages move in flight until acknowledged; `expire_visibility`
/// returns every unacknowledged message to the front of the queue.
#[derive(Default)]
pub struct InMemoryQueue {
    available: Mutex<VecDeque<StoredMessage>>,
    in_flight: Mutex<HashMap<String, StoredMessage>>,
    acknowledged: Mutex<Vec<String>>,
    receive_calls: AtomicUsize,
    fail_receive: AtomicBool,
    fail_acknowledge: AtomicBool,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a raw body, returning its message id
    pub fn push_raw(&self, body: &[u8]) -> String {
        let id = Uuid::new_v4().to_string();
        self.available.lock().unwrap().push_back(StoredMessage {
            id: id.clone(),
            body: body.to_vec(),
        });
        id
    }

    pub fn push(&self, request: &WorkRequest) -> String {
        self.push_raw(&serde_json::to_vec(request).unwrap())
    }

    pub fn expire_visibility(&self) {
        let mut available = self.available.lock().unwrap();
        let mut in_flight = self.in_flight.lock().unwrap();
        for (_, message) in in_flight.drain() {
            available.push_front(message);
        }
    }

    pub fn acknowledged_ids(&self) -> Vec<String> {
        self.acknowledged.lock().unwrap().clone()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    pub fn available_count(&self) -> usize {
        self.available.lock().unwrap().len()
    }

    pub fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::SeqCst)
    }

    pub fn set_fail_receive(&self, fail: bool) {
        self.fail_receive.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_acknowledge(&self, fail: bool) {
        self.fail_acknowledge.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkQueue for InMemoryQueue {
    async fn send(&self, request: &WorkRequest) -> Result<String, QueueError> {
        Ok(self.push(request))
    }

    async fn receive(
        &self,
        max_messages: u32,
        _wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_receive.load(Ordering::SeqCst) {
            return Err(QueueError::Receive("connection refused".into()));
        }

        let mut available = self.available.lock().unwrap();
        let mut in_flight = self.in_flight.lock().unwrap();
        let mut received = Vec::new();

        while received.len() < max_messages as usize {
            let Some(message) = available.pop_front() else {
                break;
            };
            let handle = Uuid::new_v4().to_string();
            received.push(QueueMessage {
                message_id: message.id.clone(),
                body: message.body.clone(),
                receipt_handle: ReceiptHandle::new(handle.clone()),
            });
            in_flight.insert(handle, message);
        }

        Ok(received)
    }

    async fn acknowledge(&self, handle: &ReceiptHandle) -> Result<(), QueueError> {
        if self.fail_acknowledge.load(Ordering::SeqCst) {
            return Err(QueueError::Acknowledge("service unavailable".into()));
        }

        let message = self
            .in_flight
            .lock()
            .unwrap()
            .remove(handle.as_str())
            .ok_or_else(|| QueueError::Acknowledge("receipt handle is no longer valid".into()))?;

        self.acknowledged.lock().unwrap().push(message.id);
        Ok(())
    }
}

/// Object store that keeps everything in a map and records write order
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<ObjectPath, Vec<u8>>>,
    writes: Mutex<Vec<ObjectPath>>,
    failing_keys: Mutex<HashSet<String>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &ObjectPath, data: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(path.clone(), data.to_vec());
    }

    pub fn object(&self, path: &ObjectPath) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(path).cloned()
    }

    /// Every put and prefix marker, in the order they happened
    pub fn writes(&self) -> Vec<ObjectPath> {
        self.writes.lock().unwrap().clone()
    }

    /// Make puts to `key` fail with a transport error
    pub fn fail_puts_to(&self, key: &str) {
        self.failing_keys.lock().unwrap().insert(key.to_string());
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get(&self, path: &ObjectPath) -> Result<Vec<u8>, TransferError> {
        self.object(path)
            .ok_or_else(|| TransferError::NotFound(path.clone()))
    }

    async fn put(&self, data: Vec<u8>, path: &ObjectPath) -> Result<(), TransferError> {
        if self.failing_keys.lock().unwrap().contains(&path.key) {
            return Err(TransferError::Transport {
                path: path.clone(),
                message: "simulated outage".into(),
            });
        }
        self.writes.lock().unwrap().push(path.clone());
        self.objects.lock().unwrap().insert(path.clone(), data);
        Ok(())
    }

    async fn create_prefix(&self, path: &ObjectPath) -> Result<(), TransferError> {
        self.put(Vec::new(), &ObjectPath::new(path.bucket.clone(), folder_key(&path.key)))
            .await
    }
}
