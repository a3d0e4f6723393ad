//! Registry of live queue managers on this matching host.
//!
//! Managers are created lazily on first use and remove themselves from
//! the registry when they stop (shutdown, or a lost lease). Removal is
//! idempotent: a stale entry for a stopped manager is also cleaned up
//! on the next lookup.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::client::{GetUserDataRequest, GetUserDataResponse, QueueClient};
use crate::error::Result;
use crate::namespaces::NamespaceRegistry;
use crate::queue::QueueKey;
use crate::queue_manager::{
    AddTaskParams, DescribeResponse, PollOptions, PolledTask, QueueManager,
};
use crate::settings::MatchingSettings;
use crate::store::{TaskStore, UserDataStore};

pub struct MatchingEngine {
    settings: Arc<MatchingSettings>,
    task_store: Arc<dyn TaskStore>,
    user_data_store: Arc<dyn UserDataStore>,
    client: Arc<dyn QueueClient>,
    namespaces: Arc<dyn NamespaceRegistry>,
    managers: Mutex<HashMap<QueueKey, Arc<QueueManager>>>,
    self_weak: Weak<MatchingEngine>,
}

impl MatchingEngine {
    pub fn new(
        settings: Arc<MatchingSettings>,
        task_store: Arc<dyn TaskStore>,
        user_data_store: Arc<dyn UserDataStore>,
        client: Arc<dyn QueueClient>,
        namespaces: Arc<dyn NamespaceRegistry>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            settings,
            task_store,
            user_data_store,
            client,
            namespaces,
            managers: Mutex::new(HashMap::new()),
            self_weak: self_weak.clone(),
        })
    }

    /// Get the live manager for `queue`, creating and starting one if
    /// needed.
    pub async fn manager(&self, queue: &QueueKey) -> Result<Arc<QueueManager>> {
        let mut managers = self.managers.lock().await;
        if let Some(manager) = managers.get(queue) {
            if !manager.is_stopped() {
                return Ok(Arc::clone(manager));
            }
            managers.remove(queue);
        }

        let manager = QueueManager::new(
            queue.clone(),
            Arc::clone(&self.settings),
            Arc::clone(&self.task_store),
            Arc::clone(&self.user_data_store),
            Arc::clone(&self.client),
            Arc::clone(&self.namespaces),
            unload_callback(self.self_weak.clone(), queue.clone()),
        );
        manager.start().await?;
        managers.insert(queue.clone(), Arc::clone(&manager));
        Ok(manager)
    }

    pub async fn add_task(&self, queue: &QueueKey, params: AddTaskParams) -> Result<bool> {
        self.manager(queue).await?.add_task(params).await
    }

    pub async fn get_task(
        &self,
        queue: &QueueKey,
        options: PollOptions,
    ) -> Result<Option<PolledTask>> {
        self.manager(queue).await?.get_task(options).await
    }

    pub async fn dispatch_query_task(
        &self,
        queue: &QueueKey,
        task_id: impl Into<String>,
        request: Bytes,
        forwarded_from: Option<String>,
        deadline: Option<Instant>,
    ) -> Result<Option<Bytes>> {
        self.manager(queue)
            .await?
            .dispatch_query_task(task_id, request, forwarded_from, deadline)
            .await
    }

    pub async fn handle_get_user_data_request(
        &self,
        queue: &QueueKey,
        req: GetUserDataRequest,
    ) -> Result<GetUserDataResponse> {
        self.manager(queue)
            .await?
            .user_data()
            .handle_get_user_data_request(req)
            .await
    }

    pub async fn cancel_poller(&self, queue: &QueueKey, poller_id: &str) {
        if let Some(manager) = self.managers.lock().await.get(queue) {
            manager.cancel_poller(poller_id);
        }
    }

    pub async fn describe(&self, queue: &QueueKey, include_status: bool) -> Result<DescribeResponse> {
        Ok(self.manager(queue).await?.describe(include_status))
    }

    /// Number of live managers, for tests and introspection.
    pub async fn manager_count(&self) -> usize {
        self.managers.lock().await.len()
    }

    /// Stop every manager on this host.
    pub async fn shutdown(&self) {
        let managers: Vec<Arc<QueueManager>> =
            self.managers.lock().await.values().cloned().collect();
        for manager in managers {
            manager.stop();
        }
    }
}

/// Build the unload capability handed to a manager: removes the
/// registry entry without giving the manager a reference to the engine.
fn unload_callback(engine: Weak<MatchingEngine>, queue: QueueKey) -> Arc<dyn Fn() + Send + Sync> {
    Arc::new(move || {
        let Some(engine) = engine.upgrade() else {
            return;
        };
        let queue = queue.clone();
        // The registry lock is async; stop() may run inside a task that
        // currently holds it (manager creation). Take it opportunistically
        // and fall back to a cleanup task.
        match engine.managers.try_lock() {
            Ok(mut managers) => {
                managers.remove(&queue);
            }
            Err(_) => {
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine.managers.lock().await.remove(&queue);
                });
            }
        };
    })
}
