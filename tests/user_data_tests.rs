
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use switchboard::client::{
    ClientError, ForwardedAddRequest, ForwardedPollRequest, ForwardedQueryRequest, ForwardedTask,
    GetUserDataRequest, GetUserDataResponse, QueueClient,
};
use switchboard::error::MatchingError;
use switchboard::queue::{QueueKey, QueueType};
use switchboard::settings::MatchingSettings;
use switchboard::store::memory::InMemoryUserDataStore;
use switchboard::store::{UserDataStore, VersionedUserData};
use switchboard::user_data::UserDataManager;

use test_helpers::{fast_settings, workflow_queue, UnreachableClient, TEST_NAMESPACE_ID};

type Handler =
    Box<dyn Fn(&GetUserDataRequest) -> Result<GetUserDataResponse, ClientError> + Send + Sync>;

/// Client answering GetUserData from a scripted handler, recording every
/// request for later assertions.
struct ScriptedUserDataClient {
    handler: Mutex<Handler>,
    requests: Mutex<Vec<GetUserDataRequest>>,
}

impl ScriptedUserDataClient {
    fn new(handler: Handler) -> Arc<Self> {
        Arc::new(Self {
            handler: Mutex::new(handler),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn set_handler(&self, handler: Handler) {
        *self.handler.lock().unwrap() = handler;
    }

    fn requests(&self) -> Vec<GetUserDataRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueueClient for ScriptedUserDataClient {
    async fn add_task(&self, _req: ForwardedAddRequest) -> Result<(), ClientError> {
        Err(ClientError::Unavailable("not under test".into()))
    }

    async fn poll_task(
        &self,
        _req: ForwardedPollRequest,
    ) -> Result<Option<ForwardedTask>, ClientError> {
        Err(ClientError::Unavailable("not under test".into()))
    }

    async fn query_task(&self, _req: ForwardedQueryRequest) -> Result<Bytes, ClientError> {
        Err(ClientError::Unavailable("not under test".into()))
    }

    async fn get_user_data(
        &self,
        req: GetUserDataRequest,
    ) -> Result<GetUserDataResponse, ClientError> {
        self.requests.lock().unwrap().push(req.clone());
        (self.handler.lock().unwrap())(&req)
    }
}

fn versioned(version: i64) -> VersionedUserData {
    VersionedUserData {
        version,
        data: Some(Bytes::from(format!("user-data-v{version}"))),
    }
}

fn user_data_settings(min_wait_ms: u64) -> Arc<MatchingSettings> {
    let mut settings = fast_settings();
    settings.user_data.long_poll_timeout_ms = 200;
    settings.user_data.min_wait_time_ms = min_wait_ms;
    settings.user_data.return_budget_ms = 10;
    settings.forwarder.max_children_per_node = 3;
    Arc::new(settings)
}

fn manager_for(
    queue: QueueKey,
    settings: Arc<MatchingSettings>,
    store: Arc<dyn UserDataStore>,
    client: Arc<dyn QueueClient>,
) -> Arc<UserDataManager> {
    UserDataManager::new(queue, settings, store, client, CancellationToken::new())
}

#[tokio::test]
async fn root_loads_user_data_once_on_start() {
    let store = Arc::new(InMemoryUserDataStore::new());
    store
        .update_user_data(TEST_NAMESPACE_ID, "test-queue", versioned(1).data, 0)
        .await
        .unwrap();

    let manager = manager_for(
        workflow_queue(0),
        user_data_settings(10),
        Arc::clone(&store) as _,
        Arc::new(UnreachableClient),
    );
    manager.start();
    with_timeout!(1_000, { manager.wait_until_initialized().await.unwrap() });

    let data = manager.get_user_data().unwrap().expect("loaded");
    assert_eq!(data.version, 1);
    assert_eq!(store.get_calls(), 1);

    // Reads are served from memory; the store is never consulted again.
    manager.get_user_data().unwrap();
    manager.get_user_data().unwrap();
    assert_eq!(store.get_calls(), 1);
    manager.stop();
}

#[tokio::test]
async fn root_is_ready_when_no_user_data_exists() {
    let store = Arc::new(InMemoryUserDataStore::new());
    let manager = manager_for(
        workflow_queue(0),
        user_data_settings(10),
        Arc::clone(&store) as _,
        Arc::new(UnreachableClient),
    );
    manager.start();
    with_timeout!(1_000, { manager.wait_until_initialized().await.unwrap() });
    assert!(manager.get_user_data().unwrap().is_none());
    assert_eq!(store.get_calls(), 1);
    manager.stop();
}

#[tokio::test]
async fn non_root_primes_then_long_polls() {
    let client = ScriptedUserDataClient::new(Box::new(|req| {
        Ok(GetUserDataResponse {
            user_data: (req.last_known_version < 1).then(|| versioned(1)),
        })
    }));

    let manager = manager_for(
        workflow_queue(1),
        user_data_settings(10),
        Arc::new(InMemoryUserDataStore::new()) as _,
        Arc::clone(&client) as _,
    );
    manager.start();
    with_timeout!(1_000, { manager.wait_until_initialized().await.unwrap() });
    assert_eq!(manager.get_user_data().unwrap().unwrap().version, 1);

    let requests = client.requests();
    assert!(!requests.is_empty());
    assert!(!requests[0].wait_new_data, "first fetch must prime");
    assert_eq!(requests[0].last_known_version, 0);
    // Partition 1 at degree 3 fetches from the root partition.
    assert_eq!(requests[0].queue_name, "test-queue");
    assert_eq!(requests[0].queue_type, QueueType::Workflow);

    eventually!(2_000, {
        let requests = client.requests();
        requests.len() >= 2 && requests[1].wait_new_data && requests[1].last_known_version == 1
    });
    manager.stop();
}

#[tokio::test]
async fn quiet_interval_bounds_the_fetch_rate() {
    let client = ScriptedUserDataClient::new(Box::new(|req| {
        Ok(GetUserDataResponse {
            user_data: (req.last_known_version < 1).then(|| versioned(1)),
        })
    }));

    let manager = manager_for(
        workflow_queue(1),
        user_data_settings(10_000),
        Arc::new(InMemoryUserDataStore::new()) as _,
        Arc::clone(&client) as _,
    );
    manager.start();
    with_timeout!(1_000, { manager.wait_until_initialized().await.unwrap() });

    // The prime succeeded; the next request waits out the quiet interval.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(client.requests().len(), 1);
    manager.stop();
}

#[tokio::test]
async fn activity_partition_fetches_newer_versions_from_workflow_root() {
    let client = ScriptedUserDataClient::new(Box::new(|req| {
        match (req.wait_new_data, req.last_known_version) {
            (false, 0) => Ok(GetUserDataResponse {
                user_data: Some(versioned(1)),
            }),
            (true, 1) => Ok(GetUserDataResponse {
                user_data: Some(versioned(2)),
            }),
            _ => Err(ClientError::Unavailable("hold on".into())),
        }
    }));

    let queue = QueueKey::normal(TEST_NAMESPACE_ID, "test-queue", QueueType::Activity, 1);
    let manager = manager_for(
        queue,
        user_data_settings(10),
        Arc::new(InMemoryUserDataStore::new()) as _,
        Arc::clone(&client) as _,
    );
    manager.start();
    with_timeout!(1_000, { manager.wait_until_initialized().await.unwrap() });

    eventually!(2_000, manager.get_user_data().unwrap().map(|d| d.version) == Some(2));

    // Activity partitions share the workflow queue's user data.
    for request in client.requests() {
        assert_eq!(request.queue_type, QueueType::Workflow);
        assert_eq!(request.queue_name, "test-queue");
    }
    manager.stop();
}

#[tokio::test]
async fn readiness_waits_out_unavailable_upstream() {
    let client = ScriptedUserDataClient::new(Box::new(|_req| {
        Err(ClientError::Unavailable("wait a sec".into()))
    }));

    let manager = manager_for(
        workflow_queue(1),
        user_data_settings(10),
        Arc::new(InMemoryUserDataStore::new()) as _,
        Arc::clone(&client) as _,
    );
    manager.start();

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!manager.initialized(), "unavailable upstream must not mark ready");
    assert!(client.requests().len() >= 2, "fetch must be retrying");

    client.set_handler(Box::new(|req| {
        Ok(GetUserDataResponse {
            user_data: (req.last_known_version < 1).then(|| versioned(1)),
        })
    }));

    with_timeout!(2_000, { manager.wait_until_initialized().await.unwrap() });
    assert_eq!(manager.get_user_data().unwrap().unwrap().version, 1);

    // Until the first success, every request is a prime, never a long poll.
    let requests = client.requests();
    let first_success = requests.iter().position(|r| r.last_known_version == 1);
    for request in &requests[..first_success.unwrap_or(requests.len())] {
        assert!(!request.wait_new_data);
    }
    manager.stop();
}

#[tokio::test]
async fn unimplemented_peer_means_ready_with_empty_data() {
    let client = ScriptedUserDataClient::new(Box::new(|_req| Err(ClientError::Unimplemented)));

    let manager = manager_for(
        workflow_queue(1),
        user_data_settings(10),
        Arc::new(InMemoryUserDataStore::new()) as _,
        Arc::clone(&client) as _,
    );
    manager.start();

    with_timeout!(1_000, { manager.wait_until_initialized().await.unwrap() });
    assert!(manager.get_user_data().unwrap().is_none());

    // An upgraded peer starts answering; the loop is still priming and
    // picks the data up.
    client.set_handler(Box::new(|req| {
        Ok(GetUserDataResponse {
            user_data: (req.last_known_version < 1).then(|| versioned(1)),
        })
    }));
    eventually!(2_000, manager.get_user_data().unwrap().map(|d| d.version) == Some(1));
    manager.stop();
}

#[tokio::test]
async fn deep_partition_fetches_one_level_up_the_tree() {
    let client = ScriptedUserDataClient::new(Box::new(|req| {
        Ok(GetUserDataResponse {
            user_data: (req.last_known_version < 1).then(|| versioned(1)),
        })
    }));

    let manager = manager_for(
        workflow_queue(31),
        user_data_settings(10_000),
        Arc::new(InMemoryUserDataStore::new()) as _,
        Arc::clone(&client) as _,
    );
    manager.start();
    with_timeout!(1_000, { manager.wait_until_initialized().await.unwrap() });

    // (31 - 1) / 3 = partition 10.
    assert_eq!(client.requests()[0].queue_name, "/_sys/test-queue/10");
    manager.stop();
}

#[tokio::test]
async fn sticky_queue_fetches_its_partner_normal_queue() {
    let client = ScriptedUserDataClient::new(Box::new(|req| {
        Ok(GetUserDataResponse {
            user_data: (req.last_known_version < 1).then(|| versioned(1)),
        })
    }));

    let sticky_name = format!("sticky-{}", uuid::Uuid::new_v4());
    let sticky = QueueKey::sticky(TEST_NAMESPACE_ID, sticky_name, "normal-queue");
    let manager = manager_for(
        sticky,
        user_data_settings(10_000),
        Arc::new(InMemoryUserDataStore::new()) as _,
        Arc::clone(&client) as _,
    );
    manager.start();
    with_timeout!(1_000, { manager.wait_until_initialized().await.unwrap() });
    assert_eq!(manager.get_user_data().unwrap().unwrap().version, 1);

    let requests = client.requests();
    assert_eq!(requests[0].queue_name, "normal-queue");
    assert_eq!(requests[0].queue_type, QueueType::Workflow);
    manager.stop();
}

#[tokio::test]
async fn update_fails_everywhere_but_the_workflow_root() {
    let store: Arc<dyn UserDataStore> = Arc::new(InMemoryUserDataStore::new());

    let non_root = manager_for(
        workflow_queue(1),
        user_data_settings(10),
        Arc::clone(&store),
        Arc::new(UnreachableClient),
    );
    let err = non_root
        .update_user_data(|current| Ok(current.and_then(|d| d.data)))
        .await
        .unwrap_err();
    assert!(matches!(err, MatchingError::UserDataNoMutateNonRoot));

    let activity_root = manager_for(
        QueueKey::normal(TEST_NAMESPACE_ID, "test-queue", QueueType::Activity, 0),
        user_data_settings(10),
        Arc::clone(&store),
        Arc::new(UnreachableClient),
    );
    let err = activity_root
        .update_user_data(|current| Ok(current.and_then(|d| d.data)))
        .await
        .unwrap_err();
    assert!(matches!(err, MatchingError::UserDataNoMutateNonRoot));

    let sticky = manager_for(
        QueueKey::sticky(TEST_NAMESPACE_ID, "sticky-1", "test-queue"),
        user_data_settings(10),
        Arc::clone(&store),
        Arc::new(UnreachableClient),
    );
    let err = sticky
        .update_user_data(|current| Ok(current.and_then(|d| d.data)))
        .await
        .unwrap_err();
    assert!(matches!(err, MatchingError::UserDataNoMutateNonRoot));
}

/// Routes GetUserData calls to the right manager in-process, dropping a
/// fraction of them to simulate an unreliable network.
struct RouterClient {
    managers: Mutex<HashMap<String, Arc<UserDataManager>>>,
    drop_rate: f64,
}

impl RouterClient {
    fn new(drop_rate: f64) -> Arc<Self> {
        Arc::new(Self {
            managers: Mutex::new(HashMap::new()),
            drop_rate,
        })
    }

    fn register(&self, rpc_name: String, manager: Arc<UserDataManager>) {
        self.managers.lock().unwrap().insert(rpc_name, manager);
    }
}

#[async_trait]
impl QueueClient for RouterClient {
    async fn add_task(&self, _req: ForwardedAddRequest) -> Result<(), ClientError> {
        Err(ClientError::Unavailable("not under test".into()))
    }

    async fn poll_task(
        &self,
        _req: ForwardedPollRequest,
    ) -> Result<Option<ForwardedTask>, ClientError> {
        Err(ClientError::Unavailable("not under test".into()))
    }

    async fn query_task(&self, _req: ForwardedQueryRequest) -> Result<Bytes, ClientError> {
        Err(ClientError::Unavailable("not under test".into()))
    }

    async fn get_user_data(
        &self,
        req: GetUserDataRequest,
    ) -> Result<GetUserDataResponse, ClientError> {
        if rand::random::<f64>() < self.drop_rate {
            return Err(ClientError::Unavailable("injected drop".into()));
        }
        let manager = self
            .managers
            .lock()
            .unwrap()
            .get(&req.queue_name)
            .cloned()
            .ok_or_else(|| ClientError::Internal(format!("no manager for {}", req.queue_name)))?;
        manager
            .handle_get_user_data_request(req)
            .await
            .map_err(|err| ClientError::Internal(err.to_string()))
    }
}

#[tokio::test]
async fn updates_propagate_to_every_partition_under_lossy_rpcs() {
    const PARTITIONS: u32 = 7;

    let settings = user_data_settings(10);
    let store: Arc<dyn UserDataStore> = Arc::new(InMemoryUserDataStore::new());
    let client = RouterClient::new(0.1);

    let mut managers = Vec::new();
    for partition in 0..PARTITIONS {
        let queue = workflow_queue(partition);
        let manager = manager_for(
            queue.clone(),
            Arc::clone(&settings),
            Arc::clone(&store),
            Arc::clone(&client) as _,
        );
        client.register(queue.rpc_name(), Arc::clone(&manager));
        managers.push(manager);
    }
    for manager in &managers {
        manager.start();
    }

    for round in 1..=3i64 {
        let version = managers[0]
            .update_user_data(|_| Ok(Some(Bytes::from(format!("round-{round}")))))
            .await
            .expect("root update");
        assert_eq!(version, round);

        eventually!(5_000, {
            managers
                .iter()
                .skip(1)
                .all(|m| m.get_user_data().unwrap().map(|d| d.version) == Some(version))
        });
    }

    for manager in &managers {
        manager.stop();
    }
}

#[tokio::test]
async fn subscribers_observe_monotonic_version_bumps() {
    let store: Arc<dyn UserDataStore> = Arc::new(InMemoryUserDataStore::new());
    let root = manager_for(
        workflow_queue(0),
        user_data_settings(10),
        Arc::clone(&store),
        Arc::new(UnreachableClient),
    );
    root.start();
    with_timeout!(1_000, { root.wait_until_initialized().await.unwrap() });

    let mut subscriber = root.subscribe();
    let mut last_seen = 0i64;

    for _ in 0..3 {
        root.update_user_data(|current| Ok(current.and_then(|d| d.data).or_else(|| Some(Bytes::from_static(b"seed")))))
            .await
            .unwrap();
        with_timeout!(1_000, { subscriber.changed().await.unwrap() });
        let version = subscriber.borrow().as_ref().unwrap().version;
        assert!(version > last_seen, "versions must be monotonic");
        last_seen = version;
    }
    assert_eq!(last_seen, 3);
}
