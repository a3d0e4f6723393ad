//! Per-partition view of queue-scoped user data.
//!
//! The root workflow partition of a normal queue owns the durable copy:
//! it loads once at start, applies mutations under a lock, and bumps the
//! version on every write. Every other partition (non-root workflow,
//! activity, sticky) runs a long-poll fetch loop against its upstream
//! and keeps a read-through cache whose observed version only moves
//! forward. Children of this partition long-poll us in turn through
//! [`UserDataManager::handle_get_user_data_request`], so updates ripple
//! down the tree instead of every partition hammering the root.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{ClientError, GetUserDataRequest, GetUserDataResponse, QueueClient};
use crate::error::MatchingError;
use crate::queue::{QueueKey, QueueType};
use crate::retry::{backoff_delay, retry};
use crate::settings::MatchingSettings;
use crate::store::{StoreError, UserDataStore, VersionedUserData};

pub struct UserDataManager {
    queue: QueueKey,
    settings: Arc<MatchingSettings>,
    store: Arc<dyn UserDataStore>,
    client: Arc<dyn QueueClient>,
    /// Current value; subscribers watch this for version bumps.
    publish: watch::Sender<Option<VersionedUserData>>,
    ready: watch::Sender<bool>,
    /// Serializes mutators with the conditional store write.
    update_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl UserDataManager {
    pub fn new(
        queue: QueueKey,
        settings: Arc<MatchingSettings>,
        store: Arc<dyn UserDataStore>,
        client: Arc<dyn QueueClient>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (publish, _) = watch::channel(None);
        let (ready, _) = watch::channel(false);
        Arc::new(Self {
            queue,
            settings,
            store,
            client,
            publish,
            ready,
            update_lock: tokio::sync::Mutex::new(()),
            cancel,
            handle: Mutex::new(None),
        })
    }

    /// Whether this partition is the authority for the queue's user data.
    pub fn is_owner(&self) -> bool {
        self.queue.queue_type == QueueType::Workflow && self.queue.is_root()
    }

    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if manager.is_owner() {
                manager.load_owner_data().await;
            } else {
                manager.fetch_loop().await;
            }
        });
        *self.handle.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Latest known user data, if any. Callers that need to be sure the
    /// first fetch happened gate on [`wait_until_initialized`](Self::wait_until_initialized).
    pub fn get_user_data(&self) -> Result<Option<VersionedUserData>, MatchingError> {
        Ok(self.publish.borrow().clone())
    }

    /// Watch for version bumps. The receiver sees every published value.
    pub fn subscribe(&self) -> watch::Receiver<Option<VersionedUserData>> {
        self.publish.subscribe()
    }

    /// Resolves once the first fetch (or owner load) completed, even if
    /// it found no user data at all.
    pub async fn wait_until_initialized(&self) -> Result<(), MatchingError> {
        let mut ready = self.ready.subscribe();
        tokio::select! {
            res = ready.wait_for(|initialized| *initialized) => {
                res.map(|_| ()).map_err(|_| MatchingError::QueueClosed)
            }
            _ = self.cancel.cancelled() => Err(MatchingError::QueueClosed),
        }
    }

    pub fn initialized(&self) -> bool {
        *self.ready.subscribe().borrow()
    }

    /// Apply `mutator` to the current user data and write the result
    /// through, bumping the version. Only valid on the owner partition.
    pub async fn update_user_data<F>(&self, mutator: F) -> Result<i64, MatchingError>
    where
        F: FnOnce(Option<VersionedUserData>) -> Result<Option<Bytes>, MatchingError>,
    {
        if !self.is_owner() {
            return Err(MatchingError::UserDataNoMutateNonRoot);
        }
        let _guard = self.update_lock.lock().await;
        let current = self.publish.borrow().clone();
        let expected_version = current.as_ref().map(|d| d.version).unwrap_or(0);
        let data = mutator(current)?;
        let version = self
            .store
            .update_user_data(
                &self.queue.namespace_id,
                &self.queue.name,
                data.clone(),
                expected_version,
            )
            .await?;
        self.publish_value(VersionedUserData { version, data });
        Ok(version)
    }

    /// Serve a child partition's (or sibling sticky queue's) fetch. With
    /// `wait_new_data`, holds the request open until a strictly newer
    /// version exists or the long-poll budget runs out.
    pub async fn handle_get_user_data_request(
        &self,
        req: GetUserDataRequest,
    ) -> Result<GetUserDataResponse, MatchingError> {
        self.wait_until_initialized().await?;

        if req.wait_new_data {
            let deadline = Instant::now()
                + self
                    .settings
                    .user_data
                    .long_poll_timeout()
                    .saturating_sub(self.settings.user_data.return_budget());
            let mut rx = self.publish.subscribe();
            loop {
                let current_version = rx.borrow().as_ref().map(|d| d.version).unwrap_or(0);
                if current_version > req.last_known_version {
                    break;
                }
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = self.cancel.cancelled() => break,
                }
            }
        }

        let user_data = self
            .publish
            .borrow()
            .clone()
            .filter(|d| d.version > req.last_known_version);
        Ok(GetUserDataResponse { user_data })
    }

    fn mark_ready(&self) {
        self.ready.send_if_modified(|initialized| {
            if *initialized {
                false
            } else {
                *initialized = true;
                true
            }
        });
    }

    /// Adopt `incoming` only if strictly newer, and notify subscribers.
    fn set_if_newer(&self, incoming: VersionedUserData) {
        self.publish.send_if_modified(|current| {
            let current_version = current.as_ref().map(|d| d.version).unwrap_or(0);
            if incoming.version > current_version {
                *current = Some(incoming);
                true
            } else {
                false
            }
        });
    }

    fn publish_value(&self, value: VersionedUserData) {
        self.publish.send_replace(Some(value));
    }

    /// Owner path: one read from the durable store, retried through
    /// transient failures, then ready. All later reads are in-memory.
    async fn load_owner_data(&self) {
        let loaded = retry(
            &self.settings.user_data.retry,
            &self.cancel,
            |err: &StoreError| err.is_transient(),
            || {
                self.store
                    .get_user_data(&self.queue.namespace_id, &self.queue.name)
            },
        )
        .await;

        match loaded {
            Ok(Some(data)) => {
                self.set_if_newer(data);
                self.mark_ready();
            }
            Ok(None) => self.mark_ready(),
            Err(err) => {
                // Only reachable when cancelled mid-retry (the owner
                // retry policy has no expiration).
                warn!(queue = %self.queue, error = %err, "user data load abandoned");
            }
        }
    }

    /// Non-owner path: prime the cache, then long-poll the upstream for
    /// changes forever. The first request does not wait for new data;
    /// every later one does.
    async fn fetch_loop(&self) {
        let degree = self.settings.forwarder.max_children_per_node;
        let Some(target) = self.queue.user_data_fetch_target(degree) else {
            // Activity/sticky partitions always resolve a target; a
            // normal workflow root never reaches this loop.
            self.mark_ready();
            return;
        };

        let retry_settings = self.settings.user_data.retry.clone();
        let mut wait_new_data = false;
        let mut attempt: u32 = 0;

        while !self.cancel.is_cancelled() {
            let started = Instant::now();
            let last_known_version = self
                .publish
                .borrow()
                .as_ref()
                .map(|d| d.version)
                .unwrap_or(0);
            let request = GetUserDataRequest {
                namespace_id: self.queue.namespace_id.clone(),
                queue_name: target.rpc_name(),
                queue_type: QueueType::Workflow,
                last_known_version,
                wait_new_data,
            };

            let call = tokio::time::timeout(
                self.settings.user_data.long_poll_timeout(),
                self.client.get_user_data(request),
            );
            let result = tokio::select! {
                res = call => match res {
                    Ok(inner) => inner,
                    Err(_) => Err(ClientError::Unavailable("user data long poll timed out".into())),
                },
                _ = self.cancel.cancelled() => break,
            };

            match result {
                Ok(response) => {
                    if let Some(data) = response.user_data {
                        debug!(queue = %self.queue, version = data.version, "adopted user data");
                        self.set_if_newer(data);
                    }
                    self.mark_ready();
                    wait_new_data = true;
                    attempt = 0;

                    let min_wait = self.settings.user_data.min_wait_time();
                    let elapsed = started.elapsed();
                    if elapsed < min_wait {
                        tokio::select! {
                            _ = tokio::time::sleep(min_wait - elapsed) => {}
                            _ = self.cancel.cancelled() => break,
                        }
                    }
                }
                Err(ClientError::Unimplemented) => {
                    // Older peer: no user data exists yet as far as it
                    // is concerned. Ready, but keep priming.
                    self.mark_ready();
                    let delay = backoff_delay(&retry_settings, attempt);
                    attempt = attempt.saturating_add(1);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => break,
                    }
                }
                Err(err) => {
                    debug!(queue = %self.queue, error = %err, "user data fetch failed, backing off");
                    let delay = backoff_delay(&retry_settings, attempt);
                    attempt = attempt.saturating_add(1);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => break,
                    }
                }
            }
        }
    }
}

impl Drop for UserDataManager {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}
