//! The table of live media process hosts, one slot per kind.
//!
//! Owned by the IO loop; every lookup and mutation goes through `&mut self`.

use std::sync::Arc;

use mediaproc_transport::{CauseForMediaLaunch, ChannelEvent, HostId, Message};
use tracing::{debug, info, warn};

use crate::host::{HostEvent, LaunchContext, MediaProcessHost, MediaProcessKind};

pub struct MediaProcessRegistry {
    hosts: [Option<MediaProcessHost>; MediaProcessKind::COUNT],
    last_host_id: HostId,
    ctx: LaunchContext,
}

impl MediaProcessRegistry {
    pub fn new(ctx: LaunchContext) -> Self {
        Self {
            hosts: [None, None],
            last_host_id: 0,
            ctx,
        }
    }

    /// The host for `kind`, launching one unless `cause` is `NoLaunch`.
    pub fn get(&mut self, kind: MediaProcessKind, cause: CauseForMediaLaunch) -> Option<&mut MediaProcessHost> {
        let slot = kind.index();
        if self.validate_slot(slot) {
            return self.hosts[slot].as_mut();
        }
        if cause == CauseForMediaLaunch::NoLaunch {
            return None;
        }

        self.last_host_id += 1;
        let host_id = self.last_host_id;
        let mut host = MediaProcessHost::new(host_id, kind, self.ctx.clone());
        if let Err(e) = host.init() {
            warn!(host_id, ?kind, ?cause, error = %e, "registry: media process host init failed");
            return None;
        }
        info!(host_id, ?kind, ?cause, "registry: media process host created");
        self.hosts[slot] = Some(host);
        self.hosts[slot].as_mut()
    }

    /// Validated lookup by id.
    pub fn from_id(&mut self, host_id: HostId) -> Option<&mut MediaProcessHost> {
        let slot = self.slot_of(host_id)?;
        if self.validate_slot(slot) {
            self.hosts[slot].as_mut()
        } else {
            None
        }
    }

    fn slot_of(&self, host_id: HostId) -> Option<usize> {
        self.hosts
            .iter()
            .position(|h| h.as_ref().is_some_and(|h| h.host_id() == host_id))
    }

    /// A host in an in-process mode is always valid; otherwise it is valid
    /// until its channel fails. Invalid hosts are shut down and removed.
    fn validate_slot(&mut self, slot: usize) -> bool {
        let Some(host) = self.hosts[slot].as_mut() else {
            return false;
        };
        if host.in_process() || host.is_valid() {
            return true;
        }
        host.force_shutdown();
        self.hosts[slot] = None;
        false
    }

    /// Send to the host for `kind`, launching it if needed. Dropped when no
    /// host can be had.
    pub fn send_to(&mut self, kind: MediaProcessKind, cause: CauseForMediaLaunch, message: Message) -> bool {
        match self.get(kind, cause) {
            Some(host) => host.send(message),
            None => {
                debug!(?kind, kind_name = message.name(), "registry: no host, message dropped");
                false
            }
        }
    }

    /// Pids of the valid hosts.
    pub fn process_ids(&mut self) -> Vec<u32> {
        let mut pids = Vec::new();
        for slot in 0..MediaProcessKind::COUNT {
            if !self.validate_slot(slot) {
                continue;
            }
            if let Some(pid) = self.hosts[slot].as_ref().and_then(MediaProcessHost::pid) {
                pids.push(pid);
            }
        }
        pids
    }

    pub fn host_count(&self) -> usize {
        self.hosts.iter().flatten().count()
    }

    pub fn handle_event(&mut self, event: HostEvent) {
        let HostEvent { host_id, event } = event;
        let Some(slot) = self.slot_of(host_id) else {
            debug!(host_id, "registry: event for a host that is gone");
            return;
        };
        match event {
            ChannelEvent::Connected { peer_pid } => {
                if let Some(host) = self.hosts[slot].as_mut() {
                    host.on_channel_connected(peer_pid);
                }
            }
            ChannelEvent::Message(message) => {
                if let Some(host) = self.hosts[slot].as_mut() {
                    host.on_message_received(message);
                }
            }
            ChannelEvent::Error => {
                let Some(mut host) = self.hosts[slot].take() else {
                    return;
                };
                host.on_channel_error();
                // The slot is free already; reaping runs off the loop and the
                // host is dropped after its exit is reported.
                let data_manager = Arc::clone(&self.ctx.data_manager);
                self.ctx.io.spawn(async move {
                    let status = host.reap().await;
                    if status.is_crash() {
                        warn!(host_id, ?status, "registry: media process crashed");
                        data_manager.process_crashed(status);
                    } else {
                        info!(host_id, ?status, "registry: media process went away");
                    }
                    drop(host);
                });
            }
        }
    }

    /// Drop every host.
    pub fn shutdown(&mut self) {
        for slot in self.hosts.iter_mut() {
            if let Some(mut host) = slot.take() {
                host.force_shutdown();
            }
        }
    }
}
