//! Typed publish/subscribe plumbing between a scene and its host

use crate::sampler::{SampleMailbox, VectorSampleResult};
use crate::scene::SceneSnapshot;
use field_core::{BoundingBox, Transform};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Notifications published by a scene
#[derive(Debug, Clone, PartialEq)]
pub enum SceneEvent {
    /// A vector sample request was served
    VectorLineReady(Arc<VectorSampleResult>),
    /// The visible simulation region was recomputed
    BboxChange(BoundingBox),
    /// An accepted change of the base integration time step
    IntegrationTimestepChanged(f32),
    /// Construction finished and the first frame is scheduled
    SceneReady(SceneSnapshot),
}

impl SceneEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            SceneEvent::VectorLineReady(_) => "vector-line-ready",
            SceneEvent::BboxChange(_) => "bbox-change",
            SceneEvent::IntegrationTimestepChanged(_) => "integration-timestep-changed",
            SceneEvent::SceneReady(_) => "scene-ready",
        }
    }
}

struct BroadcastInner<T> {
    next_id: u64,
    subscribers: Vec<(u64, Sender<T>)>,
}

/// Fan-out channel: every subscriber receives its own clone of each published value
pub struct Broadcast<T> {
    inner: Arc<Mutex<BroadcastInner<T>>>,
}

impl<T> Clone for Broadcast<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Broadcast<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BroadcastInner {
                next_id: 0,
                subscribers: Vec::new(),
            })),
        }
    }
}

impl<T: Clone> Broadcast<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (sender, receiver) = mpsc::channel();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push((id, sender));

        Subscription {
            id,
            receiver,
            broadcast: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `value` to every live subscriber. Returns how many received it.
    pub fn publish(&self, value: T) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        // Receivers dropped without unsubscribing are pruned here.
        inner
            .subscribers
            .retain(|(_, sender)| sender.send(value.clone()).is_ok());
        inner.subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .len()
    }
}

/// Receiving end of a [`Broadcast`]; unsubscribes when dropped
pub struct Subscription<T> {
    id: u64,
    receiver: Receiver<T>,
    broadcast: Weak<Mutex<BroadcastInner<T>>>,
}

impl<T> Subscription<T> {
    /// Next queued value without blocking.
    pub fn try_next(&self) -> Option<T> {
        match self.receiver.try_recv() {
            Ok(value) => Some(value),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Every queued value, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.receiver.try_iter().collect()
    }

    pub fn cancel(self) {}
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.broadcast.upgrade() {
            let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.subscribers.retain(|(id, _)| *id != self.id);
        }
    }
}

/// The channels a scene exchanges with its host
///
/// Create the bus first and subscribe to `events` before constructing the scene to observe
/// `SceneReady`.
#[derive(Clone, Default)]
pub struct SceneBus {
    pub events: Broadcast<SceneEvent>,
    pub transforms: Broadcast<Transform>,
    pub samples: SampleMailbox,
}

impl SceneBus {
    pub fn new() -> Self {
        Self::default()
    }
}
