//! Background propagation of server-list updates.
//!
//! A single thread owns a pool of RPC slots and drives every UP member
//! that accepts pushes to the current cluster version. The pool grows by
//! one slot when a sweep finds every slot busy, and gives one back when
//! more than one slot sat idle, so the in-flight RPC count tracks demand.
//! Members that were never updated receive a full list; everyone else
//! receives the one delta that takes them from their acknowledged version
//! to the next.
//!
//! Slot selection runs under the directory lock; RPC polling does not.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::directory::{storage_services, DirectoryState, Shared};
use crate::error::Error;
use crate::ids::ServerId;
use crate::transport::UpdateRpc;
use crate::wire::ServerListMessage;

/// One pooled RPC. `original_version` is what the member had acknowledged
/// when the push started; a cancelled or failed push restores it.
struct UpdateSlot {
    rpc: Option<Box<dyn UpdateRpc>>,
    server_id: ServerId,
    original_version: u64,
    started: Instant,
}

impl UpdateSlot {
    fn idle() -> Self {
        Self {
            rpc: None,
            server_id: ServerId::INVALID,
            original_version: 0,
            started: Instant::now(),
        }
    }
}

/// Work item handed from the directory to an update slot.
pub(crate) struct LoadedUpdate {
    pub(crate) server_id: ServerId,
    pub(crate) locator: String,
    pub(crate) original_version: u64,
    pub(crate) message: ServerListMessage,
}

impl Shared {
    /// Drop queued deltas at or below `version`; they have been applied by
    /// every member that needs them.
    pub(crate) fn prune_updates(&self, state: &mut DirectoryState, version: u64) {
        debug_assert!(version <= state.version);
        while state
            .updates
            .front()
            .is_some_and(|update| update.version <= version)
        {
            state.updates.pop_front();
        }
        if state.updates.is_empty() {
            self.list_up_to_date.notify_all();
        }
    }

    /// One round-robin sweep for a member that is behind and not already
    /// being pushed to. Leaves the cursor on the found slot. Tracks the
    /// minimum version any member still needs and prunes the delta queue
    /// against it at wrap-around.
    ///
    /// Entries with an RPC in flight are skipped, so `false` here does not
    /// imply the cluster is up to date.
    pub(crate) fn has_updates(&self, state: &mut DirectoryState) -> bool {
        if state.scan.no_updates_found || state.slots.is_empty() {
            return false;
        }

        let len = state.slots.len();
        let start = state.scan.search_index;
        let mut i = start;
        loop {
            if i == 0 {
                let min_version = state.scan.min_version;
                self.prune_updates(state, min_version);
                state.scan.min_version = 0;
            }

            if let Some(entry) = state.slots[i].entry.as_ref() {
                if entry.has_membership() && entry.status == crate::entry::ServerStatus::Up {
                    let entry_min = if entry.list_version != 0 {
                        entry.list_version
                    } else {
                        entry.being_updated
                    };
                    if state.scan.min_version == 0
                        || (entry_min > 0 && entry_min < state.scan.min_version)
                    {
                        state.scan.min_version = entry_min;
                    }

                    if entry.list_version != state.version && entry.being_updated == 0 {
                        state.scan.search_index = i;
                        state.scan.no_updates_found = false;
                        return true;
                    }
                }
            }

            i = (i + 1) % len;
            if i == start {
                break;
            }
        }

        state.scan.no_updates_found = true;
        false
    }

    /// Pick the next member needing a push and build its payload: the full
    /// list for a member that has never been updated, otherwise the delta
    /// for its next version. Marks the entry in flight; the caller must
    /// report back through `update_entry_version` whether the RPC
    /// succeeds, fails, or is cancelled.
    pub(crate) fn load_next_update(&self) -> Option<LoadedUpdate> {
        let mut state = self.state.lock().unwrap();
        if !self.has_updates(&mut state) {
            return None;
        }

        let index = state.scan.search_index;
        state.scan.search_index = (index + 1) % state.slots.len();
        let version = state.version;

        let entry = state.slots[index].entry.as_ref()?;
        let server_id = entry.server_id;
        let locator = entry.locator.clone();
        let original_version = entry.list_version;

        let (message, target_version) = if original_version == 0 {
            (state.serialize(storage_services()), version)
        } else {
            let target = original_version + 1;
            debug_assert!(!state.updates.is_empty());
            let head = state.updates.front()?.version;
            let message = state.updates.get(target.checked_sub(head)? as usize)?.clone();
            (message, target)
        };

        state.slots[index].entry.as_mut()?.being_updated = target_version;
        Some(LoadedUpdate {
            server_id,
            locator,
            original_version,
            message,
        })
    }

    /// Record the list version a member now has and clear its in-flight
    /// mark. Acks for servers that were removed mid-push are ignored.
    pub(crate) fn update_entry_version(&self, server_id: ServerId, version: u64) {
        let mut state = self.state.lock().unwrap();
        let current_version = state.version;
        let known = match state.entry_mut(server_id) {
            Ok(entry) => {
                debug!(
                    server_id = %server_id,
                    from = entry.list_version,
                    to = version,
                    "member list version updated"
                );
                entry.list_version = version;
                entry.being_updated = 0;
                true
            }
            Err(_) => {
                debug!(server_id = %server_id, "version ack for a server no longer listed");
                false
            }
        };
        if known && version < current_version {
            state.scan.no_updates_found = false;
        }
    }
}

/// Body of the updater thread. Exits when the directory sets the stop
/// flag, cancelling whatever is in flight. A panic is logged and
/// re-raised; the thread dies and `sync` callers stay blocked until the
/// updater is halted and restarted.
pub(crate) fn update_loop(shared: Arc<Shared>) {
    let inner = Arc::clone(&shared);
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || run(inner)));
    if let Err(panic) = result {
        tracing::error!("fatal error in membership updater");
        std::panic::resume_unwind(panic);
    }
}

fn run(shared: Arc<Shared>) {
    let mut slots: Vec<UpdateSlot> = Vec::new();
    let mut in_use: Vec<usize> = Vec::new();
    let mut free: Vec<usize> = Vec::new();
    for i in 0..shared.config.initial_concurrent_rpcs.max(1) {
        slots.push(UpdateSlot::idle());
        in_use.push(i);
    }

    loop {
        if shared.state.lock().unwrap().stop_updater {
            break;
        }

        let mut live_rpcs = 0;
        let mut last_free = None;
        for position in 0..in_use.len() {
            if dispatch(&shared, &mut slots[in_use[position]]) {
                live_rpcs += 1;
            } else {
                last_free = Some(position);
            }
        }

        if live_rpcs == in_use.len() && last_free.is_none() {
            // Every slot carried work for the whole sweep: add one.
            let index = free.pop().unwrap_or_else(|| {
                slots.push(UpdateSlot::idle());
                slots.len() - 1
            });
            in_use.push(index);
        } else if in_use.len() > live_rpcs + 1 {
            // More than one slot sat idle: give one back.
            if let Some(position) = last_free {
                let index = in_use.remove(position);
                free.push(index);
            }
        }

        if live_rpcs == 0 {
            let mut state = shared.state.lock().unwrap();
            while !shared.has_updates(&mut state) && !state.stop_updater {
                debug_assert!(state.is_cluster_up_to_date());
                shared.list_up_to_date.notify_all();
                state = shared.has_updates_or_stop.wait(state).unwrap();
            }
        } else {
            std::thread::yield_now();
        }
    }

    // Cancel in-flight pushes and restore their members' versions so a
    // restarted updater retries them.
    for index in in_use {
        let slot = &mut slots[index];
        if slot.rpc.take().is_some() {
            shared.update_entry_version(slot.server_id, slot.original_version);
        }
    }
}

/// Settle the slot's RPC if it has one (completion, failure, timeout),
/// then try to load fresh work. Returns whether the slot carries a live
/// RPC afterwards.
fn dispatch(shared: &Shared, slot: &mut UpdateSlot) -> bool {
    if let Some(rpc) = slot.rpc.as_mut() {
        match rpc.poll() {
            Some(outcome) => {
                let acked = match outcome {
                    Ok(version) => version,
                    Err(Error::ServerNotUp) => {
                        info!(
                            server_id = %slot.server_id,
                            "member was downed while its update was in flight"
                        );
                        slot.original_version
                    }
                    Err(err) => {
                        warn!(
                            server_id = %slot.server_id,
                            error = %err,
                            "membership push failed; retrying later"
                        );
                        slot.original_version
                    }
                };
                slot.rpc = None;
                shared.update_entry_version(slot.server_id, acked);
            }
            None => {
                if let Some(timeout) = shared.config.rpc_timeout {
                    if slot.started.elapsed() > timeout {
                        info!(
                            server_id = %slot.server_id,
                            ?timeout,
                            "membership push timed out; retrying later"
                        );
                        // Dropping the handle cancels the RPC.
                        slot.rpc = None;
                        shared.update_entry_version(slot.server_id, slot.original_version);
                    }
                }
            }
        }
    }

    if slot.rpc.is_some() {
        return true;
    }

    match shared.load_next_update() {
        Some(update) => {
            slot.server_id = update.server_id;
            slot.original_version = update.original_version;
            slot.started = Instant::now();
            slot.rpc = Some(shared.transport.start_update(
                update.server_id,
                &update.locator,
                update.message,
            ));
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::testing::*;
    use crate::directory::DirectoryConfig;
    use crate::ids::{Service, ServiceMask};
    use crate::wire::ListKind;
    use std::sync::Arc;
    use std::time::Duration;

    fn member_services() -> ServiceMask {
        ServiceMask::of(&[Service::Master, Service::Membership])
    }

    /// Cluster with the updater thread stopped so tests can single-step
    /// the scan machinery.
    fn halted_cluster() -> TestCluster {
        let cluster = test_cluster(DirectoryConfig::default());
        cluster.directory.halt_updater();
        cluster
    }

    #[test]
    fn never_updated_member_gets_the_full_list() {
        let cluster = halted_cluster();
        let id = cluster
            .directory
            .enlist_server(crate::ids::ServerId::INVALID, member_services(), 0, "tcp:1")
            .unwrap();

        let update = cluster.directory.shared().load_next_update().unwrap();
        assert_eq!(update.server_id, id);
        assert_eq!(update.original_version, 0);
        assert_eq!(update.message.kind, ListKind::FullList);
        assert_eq!(update.message.version, 1);

        let state = cluster.directory.shared().state.lock().unwrap();
        assert_eq!(state.entry(id).unwrap().being_updated, 1);
    }

    #[test]
    fn caught_up_member_gets_the_next_delta() {
        let cluster = halted_cluster();
        let shared = cluster.directory.shared();
        let member = cluster
            .directory
            .enlist_server(crate::ids::ServerId::INVALID, member_services(), 0, "tcp:1")
            .unwrap();
        shared.update_entry_version(member, 1);

        cluster
            .directory
            .enlist_server(
                crate::ids::ServerId::INVALID,
                ServiceMask::of(&[Service::Master]),
                0,
                "tcp:2",
            )
            .unwrap();

        let update = shared.load_next_update().unwrap();
        assert_eq!(update.server_id, member);
        assert_eq!(update.original_version, 1);
        assert_eq!(update.message.kind, ListKind::Update);
        assert_eq!(update.message.version, 2);
    }

    #[test]
    fn member_in_flight_is_not_selected_twice() {
        let cluster = halted_cluster();
        let shared = cluster.directory.shared();
        cluster
            .directory
            .enlist_server(crate::ids::ServerId::INVALID, member_services(), 0, "tcp:1")
            .unwrap();

        assert!(shared.load_next_update().is_some());
        assert!(shared.load_next_update().is_none());
    }

    #[test]
    fn ack_below_current_version_reopens_the_scan() {
        let cluster = halted_cluster();
        let shared = cluster.directory.shared();
        let member = cluster
            .directory
            .enlist_server(crate::ids::ServerId::INVALID, member_services(), 0, "tcp:1")
            .unwrap();
        cluster
            .directory
            .enlist_server(
                crate::ids::ServerId::INVALID,
                ServiceMask::of(&[Service::Master]),
                0,
                "tcp:2",
            )
            .unwrap();

        // The member acknowledges version 1 while the list has moved on to
        // version 2: it is still behind.
        let update = shared.load_next_update().unwrap();
        assert_eq!(update.server_id, member);
        shared.update_entry_version(member, 1);

        let next = shared.load_next_update().unwrap();
        assert_eq!(next.server_id, member);
        assert_eq!(next.message.version, 2);
        shared.update_entry_version(member, 2);
        assert!(shared.load_next_update().is_none());
        assert!(cluster.directory.cluster_up_to_date());
    }

    #[test]
    fn wrap_around_prunes_applied_deltas() {
        let cluster = halted_cluster();
        let shared = cluster.directory.shared();
        let member = cluster
            .directory
            .enlist_server(crate::ids::ServerId::INVALID, member_services(), 0, "tcp:1")
            .unwrap();

        let update = shared.load_next_update().unwrap();
        shared.update_entry_version(member, update.message.version);

        // The sweep after the ack records the member's version but the
        // applied delta survives until a wrap-around observes that floor.
        {
            let mut state = shared.state.lock().unwrap();
            assert!(!shared.has_updates(&mut state));
            assert_eq!(state.updates.len(), 1);
        }

        // The next commit reopens the scan; its wrap past index 0 prunes
        // the delta every member has applied.
        cluster
            .directory
            .enlist_server(
                crate::ids::ServerId::INVALID,
                ServiceMask::of(&[Service::Master]),
                0,
                "tcp:2",
            )
            .unwrap();
        let mut state = shared.state.lock().unwrap();
        assert!(shared.has_updates(&mut state));
        let retained: Vec<u64> = state.updates.iter().map(|u| u.version).collect();
        assert_eq!(retained, vec![2]);
    }

    #[test]
    fn prune_keeps_versions_the_slowest_member_needs() {
        let cluster = halted_cluster();
        let shared = cluster.directory.shared();
        let slow = cluster
            .directory
            .enlist_server(crate::ids::ServerId::INVALID, member_services(), 0, "tcp:1")
            .unwrap();
        let fast = cluster
            .directory
            .enlist_server(crate::ids::ServerId::INVALID, member_services(), 0, "tcp:2")
            .unwrap();

        shared.update_entry_version(slow, 1);
        shared.update_entry_version(fast, 2);

        // The slow member's pending push is the version-2 delta.
        let update = shared.load_next_update().unwrap();
        assert_eq!(update.server_id, slow);
        assert_eq!(update.message.version, 2);

        // The follow-up sweep wraps and prunes version 1, which everyone
        // has, while version 2 stays for the in-flight slow member.
        assert!(shared.load_next_update().is_none());
        let state = shared.state.lock().unwrap();
        let retained: Vec<u64> = state.updates.iter().map(|u| u.version).collect();
        assert_eq!(retained, vec![2]);
    }

    #[test]
    fn timed_out_push_is_cancelled_and_retried() {
        let transport = Arc::new(PendingTransport::default());
        let cancelled = Arc::clone(&transport.cancelled);
        let directory = test_directory(
            DirectoryConfig {
                rpc_timeout: Some(Duration::from_millis(1)),
                ..DirectoryConfig::default()
            },
            Arc::clone(&transport) as _,
            Arc::new(crate::durable_log::MemoryLog::new()),
            Arc::new(RecordingRecovery::default()),
        );
        directory.halt_updater();
        let member = directory
            .enlist_server(crate::ids::ServerId::INVALID, member_services(), 0, "tcp:1")
            .unwrap();

        let mut slot = UpdateSlot::idle();
        assert!(dispatch(directory.shared(), &mut slot));
        assert_eq!(*transport.started.lock().unwrap(), 1);

        std::thread::sleep(Duration::from_millis(5));
        // The stalled push is cancelled, the member's version restored,
        // and the slot immediately reloads the same member.
        assert!(dispatch(directory.shared(), &mut slot));
        assert_eq!(*cancelled.lock().unwrap(), 1);
        assert_eq!(*transport.started.lock().unwrap(), 2);

        let state = directory.shared().state.lock().unwrap();
        let entry = state.entry(member).unwrap();
        assert_eq!(entry.list_version, 0);
        assert_eq!(entry.being_updated, 1);
    }

    #[test]
    fn server_not_up_keeps_the_original_version() {
        let transport = Arc::new(NotUpTransport::default());
        let directory = test_directory(
            DirectoryConfig::default(),
            Arc::clone(&transport) as _,
            Arc::new(crate::durable_log::MemoryLog::new()),
            Arc::new(RecordingRecovery::default()),
        );
        directory.halt_updater();
        let member = directory
            .enlist_server(crate::ids::ServerId::INVALID, member_services(), 0, "tcp:1")
            .unwrap();

        let mut slot = UpdateSlot::idle();
        assert!(dispatch(directory.shared(), &mut slot));
        // First dispatch started the push; the next poll observes
        // ServerNotUp and restores version 0, then reloads.
        assert!(dispatch(directory.shared(), &mut slot));
        assert_eq!(*transport.started.lock().unwrap(), 2);

        let state = directory.shared().state.lock().unwrap();
        assert_eq!(state.entry(member).unwrap().list_version, 0);
        assert!(!state.is_cluster_up_to_date());
    }

    #[test]
    fn ack_for_removed_server_is_swallowed() {
        let cluster = halted_cluster();
        let shared = cluster.directory.shared();
        // Never listed; must not panic or error.
        shared.update_entry_version(crate::ids::ServerId::new(8, 1), 3);
    }
}
