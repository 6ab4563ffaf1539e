//! Mesh-wide model list accumulator.
//!
//! Each provider answers `list-models` with its own list; the
//! accumulator merges those `list-models-response` payloads, dedupes
//! by model id, and emits one compiled list after a debounce equal to
//! the auction window. Listeners subscribe before publishing the
//! `list-models` broadcast and await the compiled event.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use diiisco_types::ModelInfo;

/// Capacity of the compiled-list broadcast channel.
const COMPILED_CHANNEL_SIZE: usize = 16;

struct Inner {
    /// Models keyed by id; BTreeMap keeps the compiled list ordered.
    models: Mutex<BTreeMap<String, ModelInfo>>,
    /// Pending debounce timer, if armed.
    timer: Mutex<Option<JoinHandle<()>>>,
    sender: broadcast::Sender<Vec<ModelInfo>>,
    debounce: Duration,
}

/// Debouncing model-list accumulator.
#[derive(Clone)]
pub struct ModelAccumulator {
    inner: Arc<Inner>,
}

impl ModelAccumulator {
    /// Creates an accumulator with the given debounce window.
    pub fn new(debounce: Duration) -> Self {
        let (sender, _) = broadcast::channel(COMPILED_CHANNEL_SIZE);
        Self {
            inner: Arc::new(Inner {
                models: Mutex::new(BTreeMap::new()),
                timer: Mutex::new(None),
                sender,
                debounce,
            }),
        }
    }

    /// Subscribes to compiled-list emissions.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<ModelInfo>> {
        self.inner.sender.subscribe()
    }

    /// Merges one provider's model list; arms the debounce timer on
    /// the first contribution of a round.
    pub fn add_models(&self, list: Vec<ModelInfo>) {
        {
            let mut models = lock(&self.inner.models);
            for model in list {
                models.entry(model.id.clone()).or_insert(model);
            }
        }

        let mut timer = lock(&self.inner.timer);
        if timer.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.debounce).await;
            let compiled: Vec<ModelInfo> = {
                let mut models = lock(&inner.models);
                let out = models.values().cloned().collect();
                models.clear();
                out
            };
            tracing::debug!(count = compiled.len(), "model list compiled");
            // No receivers is fine; nobody asked this round.
            let _ = inner.sender.send(compiled);
        }));
    }

    /// Aborts a pending debounce timer.
    pub fn shutdown(&self) {
        if let Some(timer) = lock(&self.inner.timer).take() {
            timer.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
