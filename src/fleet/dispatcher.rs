//! Command dispatcher and install status tracker
//!
//! Fans one operator command out to many devices and tracks each device's
//! [`InstallStatus`] until its batch expires. Batches live per connection
//! code. A device sits in at most one live batch: re-dispatching to it moves
//! its entry into the newest batch. Every batch is dropped wholesale
//! `window` after its own dispatch, whatever state its entries are in.
//!
//! Readers get copies. The merged map for a partition is republished on a
//! `watch` channel after every mutation, which is what [`observe`] streams.
//!
//! [`observe`]: CommandDispatcher::observe

use chrono::{DateTime, Utc};
use futures_util::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::device::ConnectionCode;
use super::registry::{DeviceRegistry, LiveDevice};
use super::tracker::{InstallStatus, Transition};
use crate::protocol::{send_message, ServerMessage};
use crate::server::metrics::STD_METRICS;

/// `deviceId -> InstallStatus` for one partition.
pub type StatusMap = BTreeMap<String, InstallStatus>;

/// What a dispatch actually did.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchHandle {
    pub batch_id: u64,
    pub command: String,
    pub requested: usize,
    pub sent_count: usize,
    /// Targets that were offline, unknown or in another partition.
    pub skipped: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl BatchHandle {
    pub fn to_ack(&self) -> ServerMessage {
        ServerMessage::CommandAck {
            batch_id: self.batch_id,
            command: self.command.clone(),
            requested: self.requested,
            sent_count: self.sent_count,
            skipped: self.skipped.clone(),
            expires_at: self.expires_at,
        }
    }
}

#[derive(Debug)]
struct Batch {
    id: u64,
    entries: StatusMap,
}

#[derive(Debug)]
struct Partition {
    batches: Vec<Batch>,
    view: watch::Sender<StatusMap>,
}

impl Partition {
    fn new() -> Self {
        let (view, _) = watch::channel(StatusMap::new());
        Self {
            batches: Vec::new(),
            view,
        }
    }

    fn merged(&self) -> StatusMap {
        self.batches
            .iter()
            .flat_map(|b| b.entries.iter())
            .map(|(id, status)| (id.clone(), status.clone()))
            .collect()
    }

    fn publish(&self) {
        self.view.send_replace(self.merged());
    }

    fn entry_mut(&mut self, device_id: &str) -> Option<&mut InstallStatus> {
        self.batches
            .iter_mut()
            .find_map(|b| b.entries.get_mut(device_id))
    }
}

#[derive(Debug, Default)]
struct DispatchState {
    next_batch: u64,
    partitions: HashMap<ConnectionCode, Partition>,
}

impl DispatchState {
    /// Remove entries whose command frame could not be queued.
    fn drop_entries(&mut self, code: &ConnectionCode, batch_id: u64, device_ids: &[&str]) {
        let Some(partition) = self.partitions.get_mut(code) else {
            return;
        };
        if let Some(batch) = partition.batches.iter_mut().find(|b| b.id == batch_id) {
            batch.entries.retain(|id, _| !device_ids.contains(&id.as_str()));
        }
        partition.batches.retain(|b| !b.entries.is_empty());
        partition.publish();
        if partition.batches.is_empty() {
            self.partitions.remove(code);
        }
    }

    fn expire(&mut self, code: &ConnectionCode, batch_id: u64) {
        let Some(partition) = self.partitions.get_mut(code) else {
            return;
        };
        let before = partition.batches.len();
        partition.batches.retain(|b| b.id != batch_id);
        if partition.batches.len() == before {
            return;
        }
        partition.publish();
        debug!(code = %code, batch_id, "batch expired");
        if partition.batches.is_empty() {
            self.partitions.remove(code);
        }
    }
}

pub struct CommandDispatcher {
    registry: Arc<DeviceRegistry>,
    window: Duration,
    state: Arc<Mutex<DispatchState>>,
}

impl CommandDispatcher {
    pub fn new(registry: Arc<DeviceRegistry>, window: Duration) -> Self {
        Self {
            registry,
            window,
            state: Arc::new(Mutex::new(DispatchState::default())),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Send `command` to every online target in `code` and start tracking it.
    ///
    /// Offline or foreign targets are skipped and get no entry. Repeated ids
    /// count once. Entries are published before any frame is queued, so a
    /// reply can never arrive ahead of its entry. Delivery is
    /// fire-and-forget: `sent_count` counts queued sends, not receipts.
    pub fn dispatch(
        &self,
        code: &ConnectionCode,
        targets: &[String],
        command: &str,
        params: Value,
    ) -> BatchHandle {
        let issued_at = Utc::now();
        let expires_at = chrono::Duration::from_std(self.window)
            .ok()
            .and_then(|window| issued_at.checked_add_signed(window))
            .unwrap_or(issued_at);

        let mut seen: HashSet<&String> = HashSet::with_capacity(targets.len());
        let unique: Vec<&String> = targets
            .iter()
            .filter(|target| seen.insert(*target))
            .collect();

        // registry lock only; the state lock is never held around it
        let live: Vec<LiveDevice> = unique
            .iter()
            .filter_map(|target| self.registry.live_link(code, target))
            .collect();

        let batch_id = {
            let mut state = self.state.lock();
            state.next_batch += 1;
            let batch_id = state.next_batch;
            if !live.is_empty() {
                let entries: StatusMap = live
                    .iter()
                    .map(|l| {
                        let device = &l.device;
                        let entry =
                            InstallStatus::pending(&device.id, device.display_name(), issued_at);
                        (device.id.clone(), entry)
                    })
                    .collect();
                let partition = state
                    .partitions
                    .entry(code.clone())
                    .or_insert_with(Partition::new);
                // latest command wins the device's entry
                for batch in partition.batches.iter_mut() {
                    batch.entries.retain(|id, _| !entries.contains_key(id));
                }
                partition.batches.retain(|b| !b.entries.is_empty());
                partition.batches.push(Batch {
                    id: batch_id,
                    entries,
                });
                partition.publish();
            }
            batch_id
        };

        let mut delivered: HashSet<&str> = HashSet::with_capacity(live.len());
        let mut failed: Vec<&str> = Vec::new();
        for l in &live {
            let msg = ServerMessage::Command {
                target_device_id: l.device.id.clone(),
                command: command.to_string(),
                params: params.clone(),
            };
            if send_message(&l.link.tx, msg) {
                delivered.insert(&l.device.id);
            } else {
                failed.push(&l.device.id);
            }
        }
        if !failed.is_empty() {
            self.state.lock().drop_entries(code, batch_id, &failed);
        }

        let skipped: Vec<String> = unique
            .iter()
            .filter(|target| !delivered.contains(&target.as_str()))
            .map(|target| target.to_string())
            .collect();
        let sent_count = delivered.len();
        for _ in 0..sent_count {
            STD_METRICS.commands_total.inc("sent");
        }
        for _ in &skipped {
            STD_METRICS.commands_total.inc("skipped");
        }

        if sent_count > 0 {
            self.schedule_expiry(code.clone(), batch_id);
        }

        info!(
            code = %code,
            batch_id,
            command,
            requested = unique.len(),
            sent = sent_count,
            "command dispatched"
        );

        BatchHandle {
            batch_id,
            command: command.to_string(),
            requested: unique.len(),
            sent_count,
            skipped,
            issued_at,
            expires_at,
        }
    }

    fn schedule_expiry(&self, code: ConnectionCode, batch_id: u64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(batch_id, "no async runtime; batch will not expire");
            return;
        };
        let state = Arc::clone(&self.state);
        let window = self.window;
        runtime.spawn(async move {
            tokio::time::sleep(window).await;
            state.lock().expire(&code, batch_id);
        });
    }

    /// Drop a batch now, as its timer would.
    pub fn expire(&self, code: &ConnectionCode, batch_id: u64) {
        self.state.lock().expire(code, batch_id);
    }

    /// Apply an interim report. Returns the updated entry, or `None` when no
    /// live entry exists or the entry is already terminal.
    pub fn on_progress(
        &self,
        device_id: &str,
        progress: Option<f64>,
        text: Option<&str>,
    ) -> Option<InstallStatus> {
        self.apply(device_id, "progress", |entry| {
            entry.apply_progress(progress, text)
        })
    }

    /// Apply a terminal report. Late results for expired batches are ignored.
    pub fn on_result(
        &self,
        device_id: &str,
        success: bool,
        text: Option<&str>,
    ) -> Option<InstallStatus> {
        let updated = self.apply(device_id, "result", |entry| {
            entry.apply_result(success, text)
        })?;
        STD_METRICS
            .command_results_total
            .inc(updated.status.as_str());
        let elapsed = (Utc::now() - updated.issued_at).num_milliseconds().max(0) as f64 / 1000.0;
        STD_METRICS.command_duration_seconds.observe(elapsed);
        Some(updated)
    }

    fn apply(
        &self,
        device_id: &str,
        kind: &str,
        f: impl FnOnce(&mut InstallStatus) -> Transition,
    ) -> Option<InstallStatus> {
        let Some(code) = self.registry.get(device_id).map(|d| d.connection_code) else {
            debug!(device_id, kind, "report from unknown device ignored");
            return None;
        };
        let mut state = self.state.lock();
        let Some(partition) = state.partitions.get_mut(&code) else {
            debug!(device_id, kind, "no active batch for report");
            return None;
        };
        let Some(entry) = partition.entry_mut(device_id) else {
            debug!(device_id, kind, "no tracker entry for report");
            return None;
        };
        match f(entry) {
            Transition::Applied => {
                let updated = entry.clone();
                partition.publish();
                Some(updated)
            }
            Transition::Ignored => {
                debug!(device_id, kind, "report for terminal entry ignored");
                None
            }
        }
    }

    /// Copy of the current tracker map for `code`.
    pub fn statuses(&self, code: &ConnectionCode) -> StatusMap {
        self.state
            .lock()
            .partitions
            .get(code)
            .map(Partition::merged)
            .unwrap_or_default()
    }

    /// Lazy stream of tracker snapshots for `code`.
    ///
    /// Yields the current map first, then one map per change. Ends after
    /// yielding an empty map (every batch expired), or when the stream is
    /// dropped. Re-call to observe a later batch.
    pub fn observe(&self, code: &ConnectionCode) -> impl Stream<Item = StatusMap> + Send + 'static {
        let mut rx = match self.state.lock().partitions.get(code) {
            Some(partition) => partition.view.subscribe(),
            // nothing tracked: a closed channel holding the empty map
            None => watch::channel(StatusMap::new()).1,
        };
        async_stream::stream! {
            loop {
                let snapshot = rx.borrow_and_update().clone();
                let done = snapshot.is_empty();
                yield snapshot;
                if done || rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::device::DeviceDescriptor;
    use crate::fleet::registry::AgentLink;
    use crate::fleet::tracker::{InstallState, MSG_INSTALLING, MSG_SENDING};
    use crate::protocol::OutboundFrame;
    use futures_util::StreamExt;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Fixture {
        registry: Arc<DeviceRegistry>,
        dispatcher: CommandDispatcher,
        code: ConnectionCode,
    }

    fn fixture(window: Duration) -> Fixture {
        let registry = Arc::new(DeviceRegistry::new());
        let dispatcher = CommandDispatcher::new(Arc::clone(&registry), window);
        Fixture {
            registry,
            dispatcher,
            code: ConnectionCode::parse("123456").unwrap(),
        }
    }

    fn connect(
        registry: &DeviceRegistry,
        code: &ConnectionCode,
        id: &str,
    ) -> mpsc::UnboundedReceiver<OutboundFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry
            .register_agent(
                code,
                DeviceDescriptor {
                    id: Some(id.to_string()),
                    hostname: format!("host-{}", id),
                    ..Default::default()
                },
                AgentLink {
                    conn_id: format!("conn-{}", id),
                    tx,
                },
            )
            .unwrap();
        rx
    }

    fn targets(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_dispatch_skips_offline_targets() {
        let f = fixture(Duration::from_secs(30));
        let mut rx_a = connect(&f.registry, &f.code, "a");
        let _rx_b = connect(&f.registry, &f.code, "b");
        f.registry.mark_offline("b");

        let params = json!({ "printerIP": "10.0.0.9", "port": 9100 });
        let handle = f.dispatcher.dispatch(
            &f.code,
            &targets(&["a", "b", "ghost"]),
            "install_printer",
            params.clone(),
        );
        assert_eq!(handle.requested, 3);
        assert_eq!(handle.sent_count, 1);
        assert_eq!(handle.skipped, targets(&["b", "ghost"]));

        match rx_a.try_recv().unwrap() {
            OutboundFrame::Message(ServerMessage::Command {
                target_device_id,
                command,
                params: sent,
            }) => {
                assert_eq!(target_device_id, "a");
                assert_eq!(command, "install_printer");
                assert_eq!(sent, params);
            }
            other => panic!("unexpected frame {:?}", other),
        }

        let statuses = f.dispatcher.statuses(&f.code);
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses["a"].status, InstallState::Pending);
        assert_eq!(statuses["a"].message, MSG_SENDING);
        assert_eq!(statuses["a"].device_name, "host-a");
    }

    #[tokio::test]
    async fn test_dispatch_never_crosses_partitions() {
        let f = fixture(Duration::from_secs(30));
        let other = ConnectionCode::parse("999999").unwrap();
        let mut rx = connect(&f.registry, &other, "foreign");

        let handle = f
            .dispatcher
            .dispatch(&f.code, &targets(&["foreign"]), "install_printer", json!({}));
        assert_eq!(handle.sent_count, 0);
        assert!(rx.try_recv().is_err());
        assert!(f.dispatcher.statuses(&f.code).is_empty());
        assert!(f.dispatcher.statuses(&other).is_empty());
    }

    #[tokio::test]
    async fn test_progress_then_result() {
        let f = fixture(Duration::from_secs(30));
        let _rx = connect(&f.registry, &f.code, "a");
        f.dispatcher
            .dispatch(&f.code, &targets(&["a"]), "install_printer", json!({}));

        let entry = f.dispatcher.on_progress("a", Some(50.0), None).unwrap();
        assert_eq!(entry.status, InstallState::Installing);
        assert_eq!(entry.progress, Some(50));
        assert_eq!(entry.message, MSG_INSTALLING);

        let entry = f.dispatcher.on_result("a", true, Some("done")).unwrap();
        assert_eq!(entry.status, InstallState::Success);
        assert_eq!(entry.message, "done");

        // terminal entries do not move again
        assert!(f.dispatcher.on_result("a", false, None).is_none());
        assert_eq!(
            f.dispatcher.statuses(&f.code)["a"].status,
            InstallState::Success
        );
    }

    #[tokio::test]
    async fn test_result_without_entry_is_noop() {
        let f = fixture(Duration::from_secs(30));
        let _rx_a = connect(&f.registry, &f.code, "a");
        let _rx_b = connect(&f.registry, &f.code, "b");
        f.dispatcher
            .dispatch(&f.code, &targets(&["a"]), "install_printer", json!({}));

        let before = f.dispatcher.statuses(&f.code);
        assert!(f.dispatcher.on_result("b", true, None).is_none());
        assert!(f.dispatcher.on_progress("nobody", Some(10.0), None).is_none());
        assert_eq!(f.dispatcher.statuses(&f.code), before);
    }

    #[tokio::test]
    async fn test_redispatch_moves_device_to_newest_batch() {
        let f = fixture(Duration::from_secs(30));
        let _rx_a = connect(&f.registry, &f.code, "a");
        let _rx_b = connect(&f.registry, &f.code, "b");

        let first = f
            .dispatcher
            .dispatch(&f.code, &targets(&["a", "b"]), "install_printer", json!({}));
        f.dispatcher.on_result("a", true, None);
        let second = f
            .dispatcher
            .dispatch(&f.code, &targets(&["a"]), "install_printer", json!({}));
        assert!(second.batch_id > first.batch_id);

        // a is pending again under the new batch
        assert_eq!(
            f.dispatcher.statuses(&f.code)["a"].status,
            InstallState::Pending
        );

        // expiring the first batch only takes b with it
        f.dispatcher.expire(&f.code, first.batch_id);
        let statuses = f.dispatcher.statuses(&f.code);
        assert_eq!(statuses.keys().collect::<Vec<_>>(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_batch_expires_after_window() {
        let f = fixture(Duration::from_millis(50));
        let _rx = connect(&f.registry, &f.code, "a");
        f.dispatcher
            .dispatch(&f.code, &targets(&["a"]), "install_printer", json!({}));
        assert_eq!(f.dispatcher.statuses(&f.code).len(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(f.dispatcher.statuses(&f.code).is_empty());
        // late replies cannot resurrect it
        assert!(f.dispatcher.on_result("a", true, None).is_none());
        assert!(f.dispatcher.statuses(&f.code).is_empty());
    }

    #[tokio::test]
    async fn test_observe_yields_updates_then_ends_empty() {
        let f = fixture(Duration::from_millis(100));
        let _rx = connect(&f.registry, &f.code, "a");
        f.dispatcher
            .dispatch(&f.code, &targets(&["a"]), "install_printer", json!({}));

        let stream = f.dispatcher.observe(&f.code);
        tokio::pin!(stream);
        let first = stream.next().await.unwrap();
        assert_eq!(first["a"].status, InstallState::Pending);

        f.dispatcher.on_progress("a", Some(30.0), None);
        let second = stream.next().await.unwrap();
        assert_eq!(second["a"].progress, Some(30));

        // the device never finishes; expiry empties the view anyway
        let last = tokio::time::timeout(Duration::from_secs(2), async {
            let mut last = None;
            while let Some(snapshot) = stream.next().await {
                last = Some(snapshot);
            }
            last
        })
        .await
        .unwrap();
        assert_eq!(last, Some(StatusMap::new()));
    }

    #[tokio::test]
    async fn test_observe_without_batch_yields_empty_once() {
        let f = fixture(Duration::from_secs(30));
        let collected: Vec<StatusMap> = f.dispatcher.observe(&f.code).collect().await;
        assert_eq!(collected, vec![StatusMap::new()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reply_racing_dispatch_is_applied() {
        let registry = Arc::new(DeviceRegistry::new());
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&registry),
            Duration::from_secs(30),
        ));
        let code = ConnectionCode::parse("123456").unwrap();
        let mut rx = connect(&registry, &code, "a");

        // the agent answers the moment its command frame lands
        let agent = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                rx.recv().await.unwrap();
                dispatcher.on_result("a", true, Some("Installed"))
            })
        };

        let mut ids = vec!["a".to_string()];
        ids.extend((0..20_000).map(|i| format!("ghost-{}", i)));
        let handle = dispatcher.dispatch(&code, &ids, "install_printer", json!({}));
        assert_eq!(handle.sent_count, 1);

        let applied = agent.await.unwrap().expect("reply found its entry");
        assert_eq!(applied.status, InstallState::Success);
        assert_eq!(
            dispatcher.statuses(&code)["a"].status,
            InstallState::Success
        );
    }

    #[tokio::test]
    async fn test_failed_send_leaves_no_entry() {
        let f = fixture(Duration::from_secs(30));
        let rx_a = connect(&f.registry, &f.code, "a");
        let mut rx_b = connect(&f.registry, &f.code, "b");
        drop(rx_a);

        let handle =
            f.dispatcher
                .dispatch(&f.code, &targets(&["a", "b"]), "install_printer", json!({}));
        assert_eq!(handle.sent_count, 1);
        assert_eq!(handle.skipped, targets(&["a"]));
        assert!(rx_b.try_recv().is_ok());

        let statuses = f.dispatcher.statuses(&f.code);
        assert_eq!(statuses.len(), 1);
        assert!(statuses.contains_key("b"));
        assert!(f.dispatcher.on_result("a", true, None).is_none());
    }

    #[tokio::test]
    async fn test_only_failed_send_drops_partition_view() {
        let f = fixture(Duration::from_secs(30));
        drop(connect(&f.registry, &f.code, "a"));

        let handle = f
            .dispatcher
            .dispatch(&f.code, &targets(&["a"]), "install_printer", json!({}));
        assert_eq!(handle.sent_count, 0);
        assert!(f.dispatcher.statuses(&f.code).is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_targets_count_once() {
        let f = fixture(Duration::from_secs(30));
        let mut rx_a = connect(&f.registry, &f.code, "a");

        let handle = f.dispatcher.dispatch(
            &f.code,
            &targets(&["a", "ghost", "a", "ghost"]),
            "install_printer",
            json!({}),
        );
        assert_eq!(handle.requested, 2);
        assert_eq!(handle.sent_count, 1);
        assert_eq!(handle.skipped, targets(&["ghost"]));

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_a.try_recv().is_err());
        assert_eq!(f.dispatcher.statuses(&f.code).len(), 1);
    }

    #[test]
    fn test_ack_mirrors_handle() {
        let now = Utc::now();
        let handle = BatchHandle {
            batch_id: 7,
            command: "install_printer".to_string(),
            requested: 2,
            sent_count: 1,
            skipped: vec!["b".to_string()],
            issued_at: now,
            expires_at: now,
        };
        let value = serde_json::to_value(handle.to_ack()).unwrap();
        assert_eq!(value["type"], "command_ack");
        assert_eq!(value["batchId"], 7);
        assert_eq!(value["sentCount"], 1);
        assert_eq!(value["skipped"][0], "b");
    }
}
