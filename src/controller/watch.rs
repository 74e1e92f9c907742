use super::keys::{key_for, split_key, InvalidKey};
use super::queue::WorkQueue;
use crate::crds::Function;
use futures::StreamExt;
use kube::{
    runtime::{
        reflector::{self, store::Writer, ObjectRef, Store},
        watcher, WatchStreamExt,
    },
    Api, ResourceExt,
};
use std::collections::{HashMap, HashSet};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};

/// Read-only view of the watched Functions.
pub trait WatchSource: Send + Sync {
    fn get_by_key(&self, key: &str) -> Result<Option<Arc<Function>>, InvalidKey>;

    /// Whether the initial list has been received.
    fn has_synced(&self) -> bool;

    fn last_sync_resource_version(&self) -> Option<String>;
}

pub trait FunctionEventHandler: Send {
    fn on_add(&self, function: &Function);

    fn on_update(&self, old: &Function, new: &Function);

    fn on_delete(&self, function: &Function);
}

/// Pushes the key of every changed Function into the work queue.
pub struct QueueEventHandler {
    queue: Arc<WorkQueue>,
}

impl QueueEventHandler {
    pub fn new(queue: Arc<WorkQueue>) -> Self {
        Self { queue }
    }

    fn enqueue(&self, function: &Function) {
        match key_for(function) {
            Some(key) => self.queue.add(key),
            None => {
                let name = function.name_any();
                tracing::error!(%name, "Function has no namespace. Skipping.");
            }
        }
    }
}

impl FunctionEventHandler for QueueEventHandler {
    fn on_add(&self, function: &Function) {
        self.enqueue(function);
    }

    fn on_update(&self, _old: &Function, new: &Function) {
        self.enqueue(new);
    }

    fn on_delete(&self, function: &Function) {
        self.enqueue(function);
    }
}

#[derive(Debug, Default)]
struct SyncState {
    synced: AtomicBool,
    resource_version: Mutex<Option<String>>,
}

impl SyncState {
    fn observe(&self, function: &Function) {
        if let Some(version) = function.resource_version() {
            *self
                .resource_version
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(version);
        }
    }
}

/// Local cache of Functions, filled by a [`FunctionInformer`].
#[derive(Clone)]
pub struct FunctionCache {
    store: Store<Function>,
    state: Arc<SyncState>,
}

impl WatchSource for FunctionCache {
    fn get_by_key(&self, key: &str) -> Result<Option<Arc<Function>>, InvalidKey> {
        let (namespace, name) = split_key(key)?;

        Ok(self.store.get(&ObjectRef::new(name).within(namespace)))
    }

    fn has_synced(&self) -> bool {
        self.state.synced.load(Ordering::SeqCst)
    }

    fn last_sync_resource_version(&self) -> Option<String> {
        self.state
            .resource_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn object_ref(function: &Function) -> ObjectRef<Function> {
    ObjectRef::from_obj(function)
}

/// Applies watch events to the cache and notifies the handler.
pub(crate) struct EventDispatcher<H> {
    writer: Writer<Function>,
    cache: FunctionCache,
    handler: H,
}

impl<H: FunctionEventHandler> EventDispatcher<H> {
    pub(crate) fn new(handler: H) -> (Self, FunctionCache) {
        let (store, writer) = reflector::store();
        let cache = FunctionCache {
            store,
            state: Arc::new(SyncState::default()),
        };

        let dispatcher = Self {
            writer,
            cache: cache.clone(),
            handler,
        };

        (dispatcher, cache)
    }

    pub(crate) fn dispatch(&mut self, event: watcher::Event<Function>) {
        match &event {
            watcher::Event::Applied(function) => {
                let old = self.cache.store.get(&object_ref(function));
                self.writer.apply_watcher_event(&event);
                self.cache.state.observe(function);

                match old {
                    Some(old) => self.handler.on_update(&old, function),
                    None => self.handler.on_add(function),
                }
            }
            watcher::Event::Deleted(function) => {
                self.writer.apply_watcher_event(&event);
                self.cache.state.observe(function);
                self.handler.on_delete(function);
            }
            watcher::Event::Restarted(functions) => {
                let previous = self.cache.store.state();
                self.writer.apply_watcher_event(&event);

                let current: HashSet<_> = functions.iter().map(object_ref).collect();
                for old in &previous {
                    if !current.contains(&object_ref(old)) {
                        self.handler.on_delete(old);
                    }
                }

                let previous: HashMap<_, _> = previous
                    .into_iter()
                    .map(|old| (object_ref(&old), old))
                    .collect();
                for function in functions {
                    self.cache.state.observe(function);

                    match previous.get(&object_ref(function)) {
                        Some(old) => self.handler.on_update(old, function),
                        None => self.handler.on_add(function),
                    }
                }

                if !self.cache.state.synced.swap(true, Ordering::SeqCst) {
                    let count = functions.len();
                    tracing::info!(count, "Function cache synced.");
                }
            }
        }
    }
}

/// Watches Functions and keeps a [`FunctionCache`] up to date.
pub struct FunctionInformer<H> {
    api: Api<Function>,
    dispatcher: EventDispatcher<H>,
}

impl<H: FunctionEventHandler> FunctionInformer<H> {
    pub fn new(api: Api<Function>, handler: H) -> (Self, FunctionCache) {
        let (dispatcher, cache) = EventDispatcher::new(handler);

        (Self { api, dispatcher }, cache)
    }

    /// Runs until the watch stream ends.
    pub async fn run(mut self) {
        let mut stream = watcher(self.api.clone(), watcher::Config::default())
            .default_backoff()
            .boxed();

        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => self.dispatcher.dispatch(event),
                Err(error) => {
                    tracing::warn!(%error, "Watch error. Retrying.");
                }
            }
        }

        tracing::warn!("Watch stream ended.");
    }
}
