use std::collections::HashSet;
use std::sync::Arc;

use connect_transport::Descriptor;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::device::{Device, DeviceContext, RunOptions};
use crate::error::ConnectResult;
use crate::events::Notification;

/// Devices currently visible on the transport.
pub struct DeviceList {
    ctx: Arc<DeviceContext>,
    devices: RwLock<Vec<Arc<Device>>>,
    refreshing: tokio::sync::Mutex<()>,
}

impl DeviceList {
    pub fn new(ctx: Arc<DeviceContext>) -> Self {
        Self {
            ctx,
            devices: RwLock::new(Vec::new()),
            refreshing: tokio::sync::Mutex::new(()),
        }
    }

    pub fn all(&self) -> Vec<Arc<Device>> {
        self.devices.read().clone()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    pub fn find(&self, connect_id: &str) -> Option<Arc<Device>> {
        self.devices
            .read()
            .iter()
            .find(|device| device.connect_id() == connect_id)
            .cloned()
    }

    /// Devices not held by another client.
    pub fn devices_with_access(&self) -> Vec<Arc<Device>> {
        self.devices
            .read()
            .iter()
            .filter(|device| device.descriptor().session.is_none() || device.is_used_here())
            .cloned()
            .collect()
    }

    fn find_by_path(&self, path: &str) -> Option<Arc<Device>> {
        self.devices
            .read()
            .iter()
            .find(|device| device.path() == path)
            .cloned()
    }

    /// Raw enumeration, leaving the list untouched.
    pub async fn enumerate(&self) -> ConnectResult<Vec<Descriptor>> {
        let _guard = self.refreshing.lock().await;
        Ok(self.ctx.transport.enumerate().await?)
    }

    /// Re-enumerates the transport and reconciles the list.
    ///
    /// Concurrent callers are serialized. New devices are handshaken once so
    /// their features are known; devices flashing firmware are kept even when
    /// they briefly vanish.
    pub async fn refresh(&self) -> ConnectResult<Vec<Arc<Device>>> {
        let _guard = self.refreshing.lock().await;
        let descriptors = self.ctx.transport.enumerate().await?;
        debug!(count = descriptors.len(), "transport enumerated");

        let seen: HashSet<String> = descriptors.iter().map(|d| d.path.clone()).collect();
        for descriptor in descriptors {
            match self.find_by_path(&descriptor.path) {
                Some(device) => merge_descriptor(&device, descriptor),
                None => self.add(descriptor).await,
            }
        }

        let vanished: Vec<Arc<Device>> = {
            let mut devices = self.devices.write();
            let (kept, gone) = devices.drain(..).partition(|device: &Arc<Device>| {
                seen.contains(&device.path()) || device.is_updating_firmware()
            });
            *devices = kept;
            gone
        };
        for device in vanished {
            info!(connect_id = %device.connect_id(), "device disconnected");
            device.interrupt_from_outside();
            self.ctx.events.emit(Notification::DeviceDisconnect {
                device: device.summary(),
            });
        }
        Ok(self.all())
    }

    async fn add(&self, descriptor: Descriptor) {
        let device = Device::new(self.ctx.clone(), descriptor);
        let result = device
            .run(RunOptions::default(), Some(async { Ok(()) }))
            .await;
        if let Err(error) = result {
            warn!(connect_id = %device.connect_id(), "initial handshake failed: {error}");
        }
        info!(connect_id = %device.connect_id(), "device connected");
        self.devices.write().push(device.clone());
        self.ctx.events.emit(Notification::DeviceConnect {
            device: device.summary(),
        });
    }

    /// Drops every device without touching the transport.
    pub fn clear(&self) {
        for device in self.devices.write().drain(..) {
            device.interrupt_from_outside();
        }
    }
}

fn merge_descriptor(device: &Device, fresh: Descriptor) {
    let mut descriptor = device.descriptor();
    descriptor.session = fresh.session;
    if fresh.id.is_some() {
        descriptor.id = fresh.id;
    }
    if fresh.name.is_some() {
        descriptor.name = fresh.name;
    }
    device.set_descriptor(descriptor);
}
