//! Device registry
//!
//! Source of truth for which devices exist, which connection code they belong
//! to, and whether they are reachable right now. All state sits behind one
//! `parking_lot::Mutex`; every read hands out copies, never references.
//!
//! Subscribers are registered per connection code and events are filtered
//! here, before delivery, so an operator can never observe another
//! partition's devices.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::device::{ConnectionCode, Device, DeviceDescriptor, DevicePatch};
use crate::protocol::{send_close, Outbox, ServerMessage, CLOSE_SUPERSEDED};
use crate::server::metrics::STD_METRICS;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("device {device_id} is registered under a different connection code")]
    PartitionMismatch { device_id: String },
}

/// Outbound half of the channel an agent is currently connected on.
#[derive(Debug, Clone)]
pub struct AgentLink {
    pub conn_id: String,
    pub tx: Outbox,
}

/// A device together with its live link, as returned to the dispatcher.
#[derive(Debug, Clone)]
pub struct LiveDevice {
    pub device: Device,
    pub link: AgentLink,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// Added, or came back online.
    Online(Device),
    Updated(Device),
    Offline { device_id: String },
}

impl From<RegistryEvent> for ServerMessage {
    fn from(event: RegistryEvent) -> Self {
        match event {
            RegistryEvent::Online(device) => ServerMessage::DeviceOnline { device },
            RegistryEvent::Updated(device) => ServerMessage::DeviceUpdate { device },
            RegistryEvent::Offline { device_id } => ServerMessage::DeviceOffline { device_id },
        }
    }
}

/// Registry events for one connection code.
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub code: ConnectionCode,
    pub events: mpsc::UnboundedReceiver<RegistryEvent>,
}

#[derive(Debug)]
struct DeviceRecord {
    device: Device,
    link: Option<AgentLink>,
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<RegistryEvent>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    devices: HashMap<String, DeviceRecord>,
    /// Device ids per code, in first-registration order.
    partitions: HashMap<ConnectionCode, Vec<String>>,
    subscribers: HashMap<ConnectionCode, Vec<Subscriber>>,
    next_subscription: u64,
}

impl RegistryInner {
    fn emit(&mut self, code: &ConnectionCode, event: RegistryEvent) {
        if let Some(subs) = self.subscribers.get_mut(code) {
            subs.retain(|sub| sub.tx.send(event.clone()).is_ok());
        }
    }

    fn online_count(&self) -> usize {
        self.devices.values().filter(|r| r.device.is_online).count()
    }
}

fn take_offline(inner: &mut RegistryInner, device_id: &str) -> Option<Device> {
    let record = inner.devices.get_mut(device_id)?;
    record.link = None;
    let was_online = std::mem::replace(&mut record.device.is_online, false);
    let device = record.device.clone();
    if was_online {
        inner.emit(
            &device.connection_code,
            RegistryEvent::Offline {
                device_id: device.id.clone(),
            },
        );
        STD_METRICS.devices_online.set(inner.online_count() as f64);
        info!(device_id = %device.id, code = %device.connection_code, "device offline");
    }
    Some(device)
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    inner: Mutex<RegistryInner>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or re-register an agent. Idempotent on the device id.
    ///
    /// A reconnect refreshes the mutable fields, flips the device online and
    /// replaces its live link; if a different channel was still attached it
    /// is told to close. A reconnect under another code is rejected and the
    /// existing record is left untouched.
    pub fn register_agent(
        &self,
        code: &ConnectionCode,
        mut descriptor: DeviceDescriptor,
        link: AgentLink,
    ) -> Result<Device, RegistryError> {
        let now = Utc::now();
        let id = descriptor
            .id
            .take()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut inner = self.inner.lock();
        let device = match inner.devices.get_mut(&id) {
            Some(record) => {
                if &record.device.connection_code != code {
                    warn!(
                        device_id = %id,
                        registered_code = %record.device.connection_code,
                        attempted_code = %code,
                        "rejected registration under a different connection code"
                    );
                    return Err(RegistryError::PartitionMismatch { device_id: id });
                }
                record.device.refresh(descriptor, now);
                if let Some(previous) = record.link.replace(link.clone()) {
                    if previous.conn_id != link.conn_id {
                        debug!(device_id = %id, stale_conn = %previous.conn_id, "superseding agent channel");
                        let _ = send_close(&previous.tx, CLOSE_SUPERSEDED, "superseded");
                    }
                }
                record.device.clone()
            }
            None => {
                let device = Device::from_descriptor(id.clone(), code.clone(), descriptor, now);
                inner.devices.insert(
                    id.clone(),
                    DeviceRecord {
                        device: device.clone(),
                        link: Some(link),
                    },
                );
                inner.partitions.entry(code.clone()).or_default().push(id);
                device
            }
        };

        inner.emit(code, RegistryEvent::Online(device.clone()));
        STD_METRICS.devices_online.set(inner.online_count() as f64);
        info!(device_id = %device.id, code = %code, hostname = %device.hostname, "device online");
        Ok(device)
    }

    /// Mark a device offline and drop its live link. The record is kept so
    /// its metadata survives a reconnect.
    pub fn mark_offline(&self, device_id: &str) -> Option<Device> {
        let mut inner = self.inner.lock();
        take_offline(&mut inner, device_id)
    }

    /// Channel-close path: marks the device offline only if `conn_id` is still
    /// its live link. A stale channel closing after a reconnect is a no-op.
    pub fn disconnect(&self, device_id: &str, conn_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let is_live = inner
            .devices
            .get(device_id)
            .and_then(|r| r.link.as_ref())
            .is_some_and(|l| l.conn_id == conn_id);
        if !is_live {
            debug!(device_id, conn_id, "ignoring close of stale agent channel");
            return false;
        }
        take_offline(&mut inner, device_id).is_some()
    }

    /// Merge an agent's field update. Last write wins.
    pub fn update_device(&self, device_id: &str, patch: DevicePatch) -> Option<Device> {
        let mut inner = self.inner.lock();
        let record = inner.devices.get_mut(device_id)?;
        record.device.apply(patch);
        let device = record.device.clone();
        inner.emit(
            &device.connection_code,
            RegistryEvent::Updated(device.clone()),
        );
        Some(device)
    }

    /// All devices, online and offline, registered under `code`.
    pub fn snapshot(&self, code: &ConnectionCode) -> Vec<Device> {
        let inner = self.inner.lock();
        inner
            .partitions
            .get(code)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.devices.get(id))
                    .map(|r| r.device.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get(&self, device_id: &str) -> Option<Device> {
        self.inner
            .lock()
            .devices
            .get(device_id)
            .map(|r| r.device.clone())
    }

    /// The device and its link, if it belongs to `code` and is online.
    pub fn live_link(&self, code: &ConnectionCode, device_id: &str) -> Option<LiveDevice> {
        let inner = self.inner.lock();
        let record = inner.devices.get(device_id)?;
        if &record.device.connection_code != code || !record.device.is_online {
            return None;
        }
        let link = record.link.clone()?;
        Some(LiveDevice {
            device: record.device.clone(),
            link,
        })
    }

    pub fn subscribe(&self, code: &ConnectionCode) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        inner.next_subscription += 1;
        let id = inner.next_subscription;
        inner
            .subscribers
            .entry(code.clone())
            .or_default()
            .push(Subscriber { id, tx });
        Subscription {
            id,
            code: code.clone(),
            events: rx,
        }
    }

    pub fn unsubscribe(&self, code: &ConnectionCode, subscription_id: u64) {
        let mut inner = self.inner.lock();
        if let Some(subs) = inner.subscribers.get_mut(code) {
            subs.retain(|s| s.id != subscription_id);
            if subs.is_empty() {
                inner.subscribers.remove(code);
            }
        }
    }

    pub fn online_count(&self) -> usize {
        self.inner.lock().online_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OutboundFrame;

    fn code(raw: &str) -> ConnectionCode {
        ConnectionCode::parse(raw).unwrap()
    }

    fn link(conn_id: &str) -> (AgentLink, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            AgentLink {
                conn_id: conn_id.to_string(),
                tx,
            },
            rx,
        )
    }

    fn descriptor(id: &str, hostname: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            id: Some(id.to_string()),
            hostname: hostname.to_string(),
            os: "Windows 11".to_string(),
            ip: Some("192.168.1.20".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_register_new_device_is_online() {
        let registry = DeviceRegistry::new();
        let (l, _rx) = link("c1");
        let device = registry
            .register_agent(&code("123456"), descriptor("pc-1", "front"), l)
            .unwrap();
        assert!(device.is_online);
        assert_eq!(device.connection_code, code("123456"));
        assert_eq!(registry.online_count(), 1);
    }

    #[test]
    fn test_register_assigns_id_when_missing() {
        let registry = DeviceRegistry::new();
        let (l, _rx) = link("c1");
        let mut d = descriptor("", "front");
        d.id = None;
        let device = registry.register_agent(&code("123456"), d, l).unwrap();
        assert!(!device.id.is_empty());
        assert!(registry.get(&device.id).is_some());
    }

    #[test]
    fn test_reconnect_is_idempotent_on_id() {
        let registry = DeviceRegistry::new();
        let c = code("123456");
        let (l1, _rx1) = link("c1");
        let first = registry
            .register_agent(&c, descriptor("pc-1", "old-name"), l1)
            .unwrap();
        registry.mark_offline("pc-1");

        let (l2, _rx2) = link("c2");
        let second = registry
            .register_agent(&c, descriptor("pc-1", "new-name"), l2)
            .unwrap();
        assert_eq!(first.id, second.id);
        assert!(second.is_online);
        assert_eq!(second.hostname, "new-name");
        assert_eq!(registry.snapshot(&c).len(), 1);
    }

    #[test]
    fn test_connection_code_is_immutable() {
        let registry = DeviceRegistry::new();
        let (l1, _rx1) = link("c1");
        registry
            .register_agent(&code("123456"), descriptor("pc-1", "front"), l1)
            .unwrap();

        let (l2, _rx2) = link("c2");
        let err = registry
            .register_agent(&code("999999"), descriptor("pc-1", "evil"), l2)
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::PartitionMismatch {
                device_id: "pc-1".to_string()
            }
        );
        let device = registry.get("pc-1").unwrap();
        assert_eq!(device.connection_code, code("123456"));
        assert_eq!(device.hostname, "front");
        assert!(registry.snapshot(&code("999999")).is_empty());
    }

    #[test]
    fn test_snapshot_is_partitioned() {
        let registry = DeviceRegistry::new();
        let codes = ["111111", "222222", "333333"];
        for (i, raw) in codes.iter().cycle().take(9).enumerate() {
            let (l, _rx) = link(&format!("c{}", i));
            registry
                .register_agent(&code(raw), descriptor(&format!("pc-{}", i), "h"), l)
                .unwrap();
        }
        for raw in codes {
            let snapshot = registry.snapshot(&code(raw));
            assert_eq!(snapshot.len(), 3);
            assert!(snapshot.iter().all(|d| d.connection_code == code(raw)));
        }
        assert!(registry.snapshot(&code("444444")).is_empty());
    }

    #[test]
    fn test_snapshot_keeps_registration_order_and_offline_devices() {
        let registry = DeviceRegistry::new();
        let c = code("123456");
        for id in ["b", "a", "c"] {
            let (l, _rx) = link(id);
            registry.register_agent(&c, descriptor(id, id), l).unwrap();
        }
        registry.mark_offline("a");
        let ids: Vec<_> = registry.snapshot(&c).into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert!(!registry.get("a").unwrap().is_online);
    }

    #[test]
    fn test_mark_offline_retains_record_and_drops_link() {
        let registry = DeviceRegistry::new();
        let c = code("123456");
        let (l, _rx) = link("c1");
        registry.register_agent(&c, descriptor("pc-1", "front"), l).unwrap();
        assert!(registry.live_link(&c, "pc-1").is_some());

        let device = registry.mark_offline("pc-1").unwrap();
        assert!(!device.is_online);
        assert!(registry.live_link(&c, "pc-1").is_none());
        assert!(registry.mark_offline("missing").is_none());
    }

    #[test]
    fn test_live_link_requires_matching_code() {
        let registry = DeviceRegistry::new();
        let (l, _rx) = link("c1");
        registry
            .register_agent(&code("123456"), descriptor("pc-1", "front"), l)
            .unwrap();
        assert!(registry.live_link(&code("654321"), "pc-1").is_none());
        assert!(registry.live_link(&code("123456"), "nope").is_none());
    }

    #[test]
    fn test_stale_disconnect_does_not_mark_offline() {
        let registry = DeviceRegistry::new();
        let c = code("123456");
        let (l1, mut rx1) = link("old");
        registry.register_agent(&c, descriptor("pc-1", "front"), l1).unwrap();
        let (l2, _rx2) = link("new");
        registry.register_agent(&c, descriptor("pc-1", "front"), l2).unwrap();

        // the old channel was told to go away
        assert!(matches!(
            rx1.try_recv(),
            Ok(OutboundFrame::Close { code: CLOSE_SUPERSEDED, .. })
        ));

        assert!(!registry.disconnect("pc-1", "old"));
        assert!(registry.get("pc-1").unwrap().is_online);

        assert!(registry.disconnect("pc-1", "new"));
        assert!(!registry.get("pc-1").unwrap().is_online);
    }

    #[test]
    fn test_update_device_merges_fields() {
        let registry = DeviceRegistry::new();
        let (l, _rx) = link("c1");
        registry
            .register_agent(&code("123456"), descriptor("pc-1", "front"), l)
            .unwrap();
        let updated = registry
            .update_device(
                "pc-1",
                DevicePatch {
                    printers: Some(vec!["Brother HL".to_string()]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.printers, vec!["Brother HL".to_string()]);
        assert_eq!(updated.hostname, "front");
        assert!(registry.update_device("missing", DevicePatch::default()).is_none());
    }

    #[test]
    fn test_subscription_only_sees_own_partition() {
        let registry = DeviceRegistry::new();
        let mine = code("123456");
        let theirs = code("654321");
        let mut sub = registry.subscribe(&mine);

        let (l1, _rx1) = link("c1");
        registry.register_agent(&theirs, descriptor("other", "x"), l1).unwrap();
        let (l2, _rx2) = link("c2");
        registry.register_agent(&mine, descriptor("pc-1", "front"), l2).unwrap();
        registry.update_device(
            "other",
            DevicePatch {
                hostname: Some("y".to_string()),
                ..Default::default()
            },
        );
        registry.mark_offline("other");
        registry.mark_offline("pc-1");

        let first = sub.events.try_recv().unwrap();
        assert!(matches!(first, RegistryEvent::Online(ref d) if d.id == "pc-1"));
        assert_eq!(
            sub.events.try_recv().unwrap(),
            RegistryEvent::Offline {
                device_id: "pc-1".to_string()
            }
        );
        assert!(sub.events.try_recv().is_err());
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let registry = DeviceRegistry::new();
        let c = code("123456");
        let mut sub = registry.subscribe(&c);
        registry.unsubscribe(&c, sub.id);
        let (l, _rx) = link("c1");
        registry.register_agent(&c, descriptor("pc-1", "front"), l).unwrap();
        assert!(sub.events.try_recv().is_err());
    }

    #[test]
    fn test_registry_event_to_message() {
        let msg: ServerMessage = RegistryEvent::Offline {
            device_id: "pc-1".to_string(),
        }
        .into();
        assert_eq!(
            msg,
            ServerMessage::DeviceOffline {
                device_id: "pc-1".to_string()
            }
        );
    }
}
