//! Coordinator membership directory.
//!
//! The directory owns the authoritative, versioned list of cluster servers:
//! it issues identities, drives the UP -> CRASHED -> DOWN lifecycle, forms
//! backup replication groups, verifies suspected failures, and batches
//! per-entry deltas that a background updater pushes to every member (see
//! `updater`). Every mutation writes a typed record to the durable log
//! before its in-memory effects become authoritative, so a restarted
//! coordinator can fast-forward operations from whatever it finds logged.
//!
//! One mutex guards all directory state. Internal helpers are methods on
//! `DirectoryState`; holding `&mut DirectoryState` is the proof that the
//! lock is held.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::durable_log::{DurableLog, LogEntryId, LogRecord};
use crate::entry::{ServerEntry, ServerStatus};
use crate::error::{Error, Result};
use crate::ids::{Service, ServerId, ServiceMask};
use crate::tracker::{ServerChange, ServerTracker};
use crate::transport::{MasterRecovery, PingTransport, UpdateTransport};
use crate::updater;
use crate::wire::{ListKind, ServerListMessage};

/// Tuning for the directory and its background updater.
#[derive(Clone, Debug)]
pub struct DirectoryConfig {
    /// Per-RPC deadline for membership pushes; `None` waits forever.
    pub rpc_timeout: Option<Duration>,
    /// How long the failure detector waits for a ping response.
    pub ping_timeout: Duration,
    /// Starting size of the updater's RPC slot pool.
    pub initial_concurrent_rpcs: usize,
    /// Backups per replication group.
    pub replicas_per_group: usize,
    /// Test hook: skip the ping and treat every suspect as dead.
    pub assume_dead_for_testing: bool,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: None,
            ping_timeout: Duration::from_millis(250),
            initial_concurrent_rpcs: 5,
            replicas_per_group: 3,
            assume_dead_for_testing: false,
        }
    }
}

/// One row of the slot vector. `next_generation` survives the entry so a
/// reissued index always carries a fresh generation.
pub(crate) struct Slot {
    pub(crate) next_generation: u32,
    pub(crate) entry: Option<ServerEntry>,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            next_generation: 1,
            entry: None,
        }
    }
}

/// Round-robin cursor state for the updater's sweep over the slot vector.
#[derive(Default)]
pub(crate) struct ScanCursor {
    pub(crate) search_index: usize,
    /// Smallest version any member still needs, gathered per sweep; feeds
    /// update-queue pruning at wrap-around.
    pub(crate) min_version: u64,
    /// Short-circuits sweeps until the next commit or version regression.
    pub(crate) no_updates_found: bool,
}

/// Everything the directory mutex guards.
pub(crate) struct DirectoryState {
    pub(crate) slots: Vec<Slot>,
    pub(crate) num_masters: u32,
    pub(crate) num_backups: u32,
    /// Monotonic version of the list as a whole; bumped once per committed
    /// non-empty delta.
    pub(crate) version: u64,
    /// Per-entry change records accumulated since the last commit.
    pub(crate) pending: Vec<crate::wire::WireEntry>,
    /// Committed deltas, oldest first, retained until every member that
    /// needs them has acknowledged.
    pub(crate) updates: VecDeque<ServerListMessage>,
    pub(crate) scan: ScanCursor,
    pub(crate) next_replication_id: u64,
    pub(crate) stop_updater: bool,
    pub(crate) trackers: Vec<Arc<dyn ServerTracker>>,
}

impl DirectoryState {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            num_masters: 0,
            num_backups: 0,
            version: 0,
            pending: Vec::new(),
            updates: VecDeque::new(),
            scan: ScanCursor::default(),
            next_replication_id: 1,
            stop_updater: true,
            trackers: Vec::new(),
        }
    }

    /// Entry for `id` if the slot currently holds exactly that identity.
    pub(crate) fn get_by_id(&self, id: ServerId) -> Option<&ServerEntry> {
        self.slots
            .get(id.index() as usize)
            .and_then(|slot| slot.entry.as_ref())
            .filter(|entry| entry.server_id == id)
    }

    pub(crate) fn entry(&self, id: ServerId) -> Result<&ServerEntry> {
        self.get_by_id(id).ok_or(Error::UnknownServer(id))
    }

    pub(crate) fn entry_mut(&mut self, id: ServerId) -> Result<&mut ServerEntry> {
        self.slots
            .get_mut(id.index() as usize)
            .and_then(|slot| slot.entry.as_mut())
            .filter(|entry| entry.server_id == id)
            .ok_or(Error::UnknownServer(id))
    }

    /// Smallest unoccupied index >= 1, growing the vector when full.
    /// Index 0 is reserved and never returned.
    fn first_free_index(&mut self) -> u32 {
        let mut index = 1;
        while index < self.slots.len() && self.slots[index].entry.is_some() {
            index += 1;
        }
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, Slot::default);
        }
        index as u32
    }

    /// Issue a fresh identity and reserve its slot with a placeholder entry
    /// so concurrent generation cannot hand out the same index. The
    /// reservation is consumed by the `add` carrying this id, or released
    /// by a remove.
    pub(crate) fn generate_unique_id(&mut self) -> ServerId {
        let index = self.first_free_index();
        let slot = &mut self.slots[index as usize];
        let id = ServerId::new(index, slot.next_generation);
        slot.next_generation += 1;
        slot.entry = Some(ServerEntry::placeholder(id));
        id
    }

    /// Install an UP entry for `id`, count it, append its delta, and notify
    /// trackers. Overwrites whatever the slot holds (the reservation
    /// placeholder in normal operation).
    pub(crate) fn add(
        &mut self,
        id: ServerId,
        locator: String,
        services: ServiceMask,
        read_mbps: u32,
    ) {
        let index = id.index() as usize;
        // Recovery replays adds for pre-known ids, so the vector may not
        // have grown past this index yet.
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, Slot::default);
        }

        let mut entry = ServerEntry::new(id, locator, services);
        if services.has(Service::Master) {
            self.num_masters += 1;
        }
        if services.has(Service::Backup) {
            self.num_backups += 1;
            entry.expected_read_mbps = read_mbps;
        }

        let slot = &mut self.slots[index];
        slot.next_generation = id.generation().wrapping_add(1);
        let snapshot = entry.clone();
        slot.entry = Some(entry);

        self.pending.push(snapshot.to_wire());
        self.notify_trackers(&snapshot, ServerChange::Added);
    }

    /// UP -> CRASHED. No-op when already crashed; a DOWN entry is treated
    /// as unknown. Master/backup counters drop here, not at DOWN.
    pub(crate) fn crashed(&mut self, id: ServerId) -> Result<()> {
        let entry = self.entry_mut(id)?;
        match entry.status {
            ServerStatus::Crashed => return Ok(()),
            ServerStatus::Down => return Err(Error::UnknownServer(id)),
            ServerStatus::Up => {}
        }
        entry.status = ServerStatus::Crashed;
        let snapshot = entry.clone();

        if snapshot.is_master() {
            self.num_masters = self.num_masters.saturating_sub(1);
        }
        if snapshot.is_backup() {
            self.num_backups = self.num_backups.saturating_sub(1);
        }

        self.pending.push(snapshot.to_wire());
        self.notify_trackers(&snapshot, ServerChange::Crashed);
        Ok(())
    }

    /// CRASHED -> DOWN, destroying the slot's entry. Runs `crashed` first
    /// so a direct removal of an UP server emits both transitions. For a
    /// replacement enlist the caller must remove before re-adding, within
    /// one delta batch, so members apply the removal first.
    pub(crate) fn remove(&mut self, id: ServerId) -> Result<()> {
        self.entry(id)?;
        self.crashed(id)?;

        let slot = &mut self.slots[id.index() as usize];
        let mut entry = slot.entry.take().ok_or(Error::UnknownServer(id))?;
        entry.status = ServerStatus::Down;

        self.pending.push(entry.to_wire());
        self.notify_trackers(&entry, ServerChange::Removed);
        Ok(())
    }

    /// Record a replication-group assignment. Only UP entries take the new
    /// id; anything else is left untouched. Members learn of the change
    /// through the appended delta.
    pub(crate) fn set_replication_id(&mut self, id: ServerId, replication_id: u64) -> Result<()> {
        let entry = self.entry_mut(id)?;
        if entry.status != ServerStatus::Up {
            return Ok(());
        }
        entry.replication_id = replication_id;
        let wire = entry.to_wire();
        self.pending.push(wire);
        Ok(())
    }

    /// Give every listed backup the same replication id. The assignment is
    /// all-or-nothing: when any member is not retrievable the group keeps
    /// its previous ids.
    fn assign_replication_group(&mut self, replication_id: u64, members: &[ServerId]) -> bool {
        if members.iter().any(|id| self.get_by_id(*id).is_none()) {
            return false;
        }
        for id in members {
            let _ = self.set_replication_id(*id, replication_id);
        }
        true
    }

    /// Partition ungrouped UP backups into fresh groups of
    /// `replicas_per_group`, in slot order. Leftovers stay ungrouped until
    /// enough peers enlist.
    pub(crate) fn create_replication_groups(&mut self, replicas_per_group: usize) {
        let mut free: Vec<ServerId> = self
            .slots
            .iter()
            .filter_map(|slot| slot.entry.as_ref())
            .filter(|e| e.is_backup() && e.status == ServerStatus::Up && e.replication_id == 0)
            .map(|e| e.server_id)
            .collect();

        while free.len() >= replicas_per_group {
            let group: Vec<ServerId> = free.drain(..replicas_per_group).collect();
            let replication_id = self.next_replication_id;
            if self.assign_replication_group(replication_id, &group) {
                self.next_replication_id += 1;
            }
        }
    }

    /// Reset every UP backup carrying `group_id` back to ungrouped.
    /// Group 0 is the unassigned default and is never "removed".
    pub(crate) fn remove_replication_group(&mut self, group_id: u64) {
        if group_id == 0 {
            return;
        }
        let members: Vec<ServerId> = self
            .slots
            .iter()
            .filter_map(|slot| slot.entry.as_ref())
            .filter(|e| e.is_backup() && e.replication_id == group_id)
            .map(|e| e.server_id)
            .collect();
        if !members.is_empty() {
            self.assign_replication_group(0, &members);
        }
    }

    /// Serialize the list for dissemination: every entry whose services
    /// intersect `mask`, in slot order, stamped with the current version.
    pub(crate) fn serialize(&self, mask: ServiceMask) -> ServerListMessage {
        let servers = self
            .slots
            .iter()
            .filter_map(|slot| slot.entry.as_ref())
            .filter(|e| e.services.intersects(mask))
            .map(|e| e.to_wire())
            .collect();
        ServerListMessage {
            version: self.version,
            kind: ListKind::FullList,
            servers,
        }
    }

    /// True when every UP member that accepts pushes has acknowledged the
    /// current version and nothing is in flight toward it.
    pub(crate) fn is_cluster_up_to_date(&self) -> bool {
        self.slots
            .iter()
            .filter_map(|slot| slot.entry.as_ref())
            .all(|e| {
                !(e.has_membership()
                    && e.status == ServerStatus::Up
                    && (e.list_version != self.version || e.being_updated != 0))
            })
    }

    fn notify_trackers(&self, entry: &ServerEntry, change: ServerChange) {
        for tracker in &self.trackers {
            tracker.server_changed(entry, change);
        }
    }
}

/// State shared between the directory handle and the updater thread.
pub(crate) struct Shared {
    pub(crate) state: Mutex<DirectoryState>,
    /// Signaled on commit and on shutdown; the updater waits here when the
    /// cluster is quiescent.
    pub(crate) has_updates_or_stop: Condvar,
    /// Signaled whenever the update queue drains; `sync` waits here.
    pub(crate) list_up_to_date: Condvar,
    pub(crate) log: Arc<dyn DurableLog>,
    pub(crate) transport: Arc<dyn UpdateTransport>,
    pub(crate) ping: Arc<dyn PingTransport>,
    pub(crate) recovery: Arc<dyn MasterRecovery>,
    pub(crate) config: DirectoryConfig,
}

impl Shared {
    /// Stamp the pending delta with the next version, queue it for the
    /// updater, and wake it. Committing with nothing pending leaves the
    /// version untouched.
    pub(crate) fn commit_update(&self, state: &mut DirectoryState) {
        if state.pending.is_empty() {
            return;
        }
        state.version += 1;
        let message = ServerListMessage {
            version: state.version,
            kind: ListKind::Update,
            servers: std::mem::take(&mut state.pending),
        };
        state.updates.push_back(message);
        state.scan.no_updates_found = false;
        self.has_updates_or_stop.notify_one();
    }
}

/// Default dissemination filter: the storage-facing services.
pub(crate) fn storage_services() -> ServiceMask {
    ServiceMask::of(&[Service::Master, Service::Backup])
}

/// Two-phase enlistment. `execute` reserves an id and logs the intent;
/// `complete` installs the entry, forms replication groups, and logs the
/// superseding enlisted record. Recovery replays `complete` directly.
struct EnlistServer<'a> {
    shared: &'a Shared,
    id: ServerId,
    services: ServiceMask,
    read_mbps: u32,
    locator: String,
}

impl EnlistServer<'_> {
    fn execute(mut self, state: &mut DirectoryState) -> Result<ServerId> {
        self.id = state.generate_unique_id();

        let record = LogRecord::ServerEnlisting {
            server_id: self.id,
            services: self.services.bits(),
            read_mbps: self.read_mbps,
            locator: self.locator.clone(),
        };
        let entry_id = self.shared.log.append(&record, &[])?;
        state.entry_mut(self.id)?.info_log_id = entry_id;
        debug!(entry_id, server_id = %self.id, "logged ServerEnlisting");

        self.complete(state, entry_id)
    }

    fn complete(self, state: &mut DirectoryState, entry_id: LogEntryId) -> Result<ServerId> {
        state.add(
            self.id,
            self.locator.clone(),
            self.services,
            self.read_mbps,
        );

        info!(
            server_id = %self.id,
            locator = %self.locator,
            services = %self.services,
            "enlisting new server"
        );

        if self.services.has(Service::Backup) {
            debug!(server_id = %self.id, read_mbps = self.read_mbps, "backup read speed");
            state.create_replication_groups(self.shared.config.replicas_per_group);
        }

        let record = LogRecord::ServerEnlisted {
            server_id: self.id,
            services: self.services.bits(),
            read_mbps: self.read_mbps,
            locator: self.locator.clone(),
        };
        let new_entry_id = self.shared.log.append(&record, &[entry_id])?;
        state.entry_mut(self.id)?.info_log_id = new_entry_id;
        debug!(entry_id = new_entry_id, server_id = %self.id, "logged ServerEnlisted");

        Ok(self.id)
    }
}

/// Two-phase forced removal of a suspected-dead server.
struct ForceServerDown<'a> {
    shared: &'a Shared,
    id: ServerId,
}

impl ForceServerDown<'_> {
    fn execute(self, state: &mut DirectoryState) -> Result<()> {
        let record = LogRecord::ForceServerDown { server_id: self.id };
        let entry_id = self.shared.log.append(&record, &[])?;
        debug!(entry_id, server_id = %self.id, "logged ForceServerDown");
        self.complete(state, entry_id)
    }

    fn complete(self, state: &mut DirectoryState, entry_id: LogEntryId) -> Result<()> {
        // Read the log bookkeeping before the entry goes away so the
        // superseded records can be invalidated afterwards.
        let entry = state.entry(self.id)?;
        let info_log_id = entry.info_log_id;
        let update_log_id = entry.update_log_id;
        let snapshot = entry.clone();

        state.crashed(self.id)?;
        // A server without a master triggers no recovery, and recovery is
        // what normally retires crashed entries; take it to DOWN now.
        if !snapshot.is_master() {
            state.remove(self.id)?;
        }

        self.shared.recovery.start_master_recovery(&snapshot);

        state.remove_replication_group(snapshot.replication_id);
        state.create_replication_groups(self.shared.config.replicas_per_group);

        let mut invalidates = vec![info_log_id, entry_id];
        if update_log_id != 0 {
            invalidates.push(update_log_id);
        }
        invalidates.retain(|id| *id != 0);
        self.shared.log.invalidate(&invalidates)?;
        Ok(())
    }
}

/// Two-phase master-recovery-info write. A prior `ServerUpdate` record for
/// the id is read back, extended, and superseded.
struct SetMasterRecoveryInfo<'a> {
    shared: &'a Shared,
    id: ServerId,
    info: Vec<u8>,
}

impl SetMasterRecoveryInfo<'_> {
    fn execute(self, state: &mut DirectoryState) -> Result<()> {
        let previous_entry_id = state.entry(self.id)?.update_log_id;

        let mut invalidates = Vec::new();
        let record = if previous_entry_id != 0 {
            let existing = self.shared.log.read(previous_entry_id)?;
            let LogRecord::ServerUpdate { server_id, .. } = existing else {
                return Err(Error::DurableLog(format!(
                    "record {previous_entry_id} is not a ServerUpdate"
                )));
            };
            invalidates.push(previous_entry_id);
            LogRecord::ServerUpdate {
                server_id,
                master_recovery_info: self.info.clone(),
            }
        } else {
            LogRecord::ServerUpdate {
                server_id: self.id,
                master_recovery_info: self.info.clone(),
            }
        };

        let entry_id = self.shared.log.append(&record, &invalidates)?;
        self.complete(state, entry_id)
    }

    fn complete(self, state: &mut DirectoryState, entry_id: LogEntryId) -> Result<()> {
        match state.entry_mut(self.id) {
            Ok(entry) => {
                entry.update_log_id = entry_id;
                entry.master_recovery_info = self.info;
                Ok(())
            }
            Err(err) => {
                warn!(server_id = %self.id, "recovery info target no longer exists");
                self.shared.log.invalidate(&[entry_id])?;
                Err(err)
            }
        }
    }
}

/// Handle to the coordinator's membership directory. Cheap accessors copy
/// entries out under the lock; mutating operations run their durable saga
/// and commit one versioned delta before returning.
pub struct MembershipDirectory {
    shared: Arc<Shared>,
    updater_thread: Mutex<Option<JoinHandle<()>>>,
}

impl MembershipDirectory {
    /// Build a directory around its collaborators and start the background
    /// updater.
    pub fn new(
        config: DirectoryConfig,
        log: Arc<dyn DurableLog>,
        transport: Arc<dyn UpdateTransport>,
        ping: Arc<dyn PingTransport>,
        recovery: Arc<dyn MasterRecovery>,
    ) -> Self {
        let directory = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(DirectoryState::new()),
                has_updates_or_stop: Condvar::new(),
                list_up_to_date: Condvar::new(),
                log,
                transport,
                ping,
                recovery,
                config,
            }),
            updater_thread: Mutex::new(None),
        };
        directory.start_updater();
        directory
    }

    /// Register an observer for membership changes. Callbacks run under
    /// the directory lock in commit order.
    pub fn register_tracker(&self, tracker: Arc<dyn ServerTracker>) {
        self.shared.state.lock().unwrap().trackers.push(tracker);
    }

    /// Enlist a server, optionally replacing a failed predecessor. When
    /// `replaces` is still listed, it is forced down and fully retired
    /// first so the removal and the re-addition land in the same committed
    /// delta, removal first. Returns the id issued to the newcomer.
    pub fn enlist_server(
        &self,
        replaces: ServerId,
        services: ServiceMask,
        read_mbps: u32,
        locator: &str,
    ) -> Result<ServerId> {
        let mut state = self.shared.state.lock().unwrap();

        if state.get_by_id(replaces).is_some() {
            info!(
                locator,
                replaces = %replaces,
                "enlisting server claims to replace a listed id; taking its word for it"
            );
            ForceServerDown {
                shared: &self.shared,
                id: replaces,
            }
            .execute(&mut state)?;
            // A replaced master stays CRASHED pending recovery, but the
            // newcomer takes over its slot: retire it within this batch.
            if state.get_by_id(replaces).is_some() {
                state.remove(replaces)?;
            }
        }

        let new_id = EnlistServer {
            shared: &self.shared,
            id: ServerId::INVALID,
            services,
            read_mbps,
            locator: locator.to_string(),
        }
        .execute(&mut state)?;

        if replaces.is_valid() {
            info!(new_id = %new_id, replaces = %replaces, "newly enlisted server replaces old id");
        }

        self.shared.commit_update(&mut state);
        Ok(new_id)
    }

    /// Investigate a crash report. Unknown or non-UP ids count as already
    /// down. A verified failure is forced down and committed; a false
    /// positive leaves the list untouched and returns `false`.
    pub fn hint_server_down(&self, id: ServerId) -> Result<bool> {
        let mut state = self.shared.state.lock().unwrap();

        let locator = match state.get_by_id(id) {
            Some(entry) if entry.status == ServerStatus::Up => entry.locator.clone(),
            _ => {
                info!(server_id = %id, "spurious crash report on unknown server id");
                return Ok(true);
            }
        };

        info!(server_id = %id, locator = %locator, "checking suspected server");
        if !self.verify_server_failure(id, &locator) {
            return Ok(false);
        }

        info!(server_id = %id, "server crashed; notifying cluster and starting recovery");
        ForceServerDown {
            shared: &self.shared,
            id,
        }
        .execute(&mut state)?;
        self.shared.commit_update(&mut state);
        Ok(true)
    }

    /// Store the opaque blob master recovery needs to handle `id` safely.
    /// Does not bump the cluster version; the blob is not part of the
    /// disseminated list.
    pub fn set_master_recovery_info(&self, id: ServerId, info: &[u8]) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        state.entry_mut(id)?.master_recovery_info = info.to_vec();
        SetMasterRecoveryInfo {
            shared: &self.shared,
            id,
            info: info.to_vec(),
        }
        .execute(&mut state)
    }

    /// Copy of the entry for `id`, if that exact identity is listed.
    pub fn get(&self, id: ServerId) -> Option<ServerEntry> {
        self.shared.state.lock().unwrap().get_by_id(id).cloned()
    }

    /// Copy of whatever occupies `index`; `None` for a vacant slot inside
    /// the vector, an error past its end.
    pub fn get_index(&self, index: u32) -> Result<Option<ServerEntry>> {
        let state = self.shared.state.lock().unwrap();
        match state.slots.get(index as usize) {
            Some(slot) => Ok(slot.entry.clone()),
            None => Err(Error::IndexOutOfRange(index)),
        }
    }

    pub fn locator(&self, id: ServerId) -> Result<String> {
        Ok(self.shared.state.lock().unwrap().entry(id)?.locator.clone())
    }

    /// UP masters; crashed servers are not counted.
    pub fn master_count(&self) -> u32 {
        self.shared.state.lock().unwrap().num_masters
    }

    /// UP backups; crashed servers are not counted.
    pub fn backup_count(&self) -> u32 {
        self.shared.state.lock().unwrap().num_backups
    }

    /// First index at or after `start` whose entry offers the master
    /// service.
    pub fn next_master_index(&self, start: u32) -> Option<u32> {
        self.next_index_with(start, |entry| entry.is_master())
    }

    /// First index at or after `start` whose entry offers the backup
    /// service.
    pub fn next_backup_index(&self, start: u32) -> Option<u32> {
        self.next_index_with(start, |entry| entry.is_backup())
    }

    fn next_index_with(&self, start: u32, pred: impl Fn(&ServerEntry) -> bool) -> Option<u32> {
        let state = self.shared.state.lock().unwrap();
        (start as usize..state.slots.len())
            .find(|i| state.slots[*i].entry.as_ref().is_some_and(&pred))
            .map(|i| i as u32)
    }

    pub fn version(&self) -> u64 {
        self.shared.state.lock().unwrap().version
    }

    /// True when every UP member with the membership service has
    /// acknowledged the current version with nothing in flight.
    pub fn cluster_up_to_date(&self) -> bool {
        self.shared.state.lock().unwrap().is_cluster_up_to_date()
    }

    /// Snapshot of the list restricted to servers whose services intersect
    /// `mask`.
    pub fn serialize(&self, mask: ServiceMask) -> ServerListMessage {
        self.shared.state.lock().unwrap().serialize(mask)
    }

    /// Snapshot of the storage servers (masters and backups), the default
    /// dissemination filter.
    pub fn full_list(&self) -> ServerListMessage {
        self.serialize(storage_services())
    }

    /// Block until every eligible member is at the current version.
    pub fn sync(&self) {
        self.start_updater();
        let mut state = self.shared.state.lock().unwrap();
        while !state.is_cluster_up_to_date() {
            state = self.shared.list_up_to_date.wait(state).unwrap();
        }
    }

    /// Start the background updater if it is not already running, and poke
    /// it regardless.
    pub fn start_updater(&self) {
        let mut handle = self.updater_thread.lock().unwrap();
        if handle.is_none() {
            self.shared.state.lock().unwrap().stop_updater = false;
            let shared = Arc::clone(&self.shared);
            *handle = Some(std::thread::spawn(move || updater::update_loop(shared)));
        }
        self.shared.has_updates_or_stop.notify_one();
    }

    /// Stop the background updater, cancelling in-flight pushes and
    /// leaving the cluster possibly out of date. Call `sync` first to
    /// force a synchronization point.
    pub fn halt_updater(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.stop_updater = true;
        }
        self.shared.has_updates_or_stop.notify_one();

        let handle = self.updater_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Replay an interrupted enlistment from its `ServerEnlisting` record.
    pub fn enlist_server_recover(
        &self,
        record: &LogRecord,
        entry_id: LogEntryId,
    ) -> Result<ServerId> {
        let LogRecord::ServerEnlisting {
            server_id,
            services,
            read_mbps,
            locator,
        } = record
        else {
            return Err(Error::DurableLog("expected a ServerEnlisting record".into()));
        };
        debug!(server_id = %server_id, "replaying enlistment");
        let mut state = self.shared.state.lock().unwrap();
        let id = EnlistServer {
            shared: &self.shared,
            id: *server_id,
            services: ServiceMask::from_bits(*services),
            read_mbps: *read_mbps,
            locator: locator.clone(),
        }
        .complete(&mut state, entry_id)?;
        self.shared.commit_update(&mut state);
        Ok(id)
    }

    /// Re-add a server whose enlistment had fully completed before the
    /// previous coordinator failed. The cluster already saw this server,
    /// so no fresh update is committed for it; the entry's delta simply
    /// rides along with the next commit.
    pub fn enlisted_server_recover(&self, record: &LogRecord) -> Result<ServerId> {
        let LogRecord::ServerEnlisted {
            server_id,
            services,
            read_mbps,
            locator,
        } = record
        else {
            return Err(Error::DurableLog("expected a ServerEnlisted record".into()));
        };
        debug!(server_id = %server_id, "restoring enlisted server");
        let mut state = self.shared.state.lock().unwrap();
        state.add(
            *server_id,
            locator.clone(),
            ServiceMask::from_bits(*services),
            *read_mbps,
        );
        Ok(*server_id)
    }

    /// Replay an interrupted forced removal from its `ForceServerDown`
    /// record.
    pub fn force_server_down_recover(
        &self,
        record: &LogRecord,
        entry_id: LogEntryId,
    ) -> Result<()> {
        let LogRecord::ForceServerDown { server_id } = record else {
            return Err(Error::DurableLog("expected a ForceServerDown record".into()));
        };
        debug!(server_id = %server_id, "replaying forced server down");
        let mut state = self.shared.state.lock().unwrap();
        ForceServerDown {
            shared: &self.shared,
            id: *server_id,
        }
        .complete(&mut state, entry_id)
    }

    /// Replay an interrupted recovery-info write from its `ServerUpdate`
    /// record.
    pub fn set_master_recovery_info_recover(
        &self,
        record: &LogRecord,
        entry_id: LogEntryId,
    ) -> Result<()> {
        let LogRecord::ServerUpdate {
            server_id,
            master_recovery_info,
        } = record
        else {
            return Err(Error::DurableLog("expected a ServerUpdate record".into()));
        };
        debug!(server_id = %server_id, "replaying recovery info write");
        let mut state = self.shared.state.lock().unwrap();
        SetMasterRecoveryInfo {
            shared: &self.shared,
            id: *server_id,
            info: master_recovery_info.clone(),
        }
        .complete(&mut state, entry_id)
    }

    /// Skip the real ping when configured to, otherwise ask the ping
    /// service and give the suspect `ping_timeout` to answer.
    fn verify_server_failure(&self, id: ServerId, locator: &str) -> bool {
        if self.shared.config.assume_dead_for_testing {
            return true;
        }
        if self
            .shared
            .ping
            .ping(id, locator, self.shared.config.ping_timeout)
        {
            info!(server_id = %id, locator, "false positive crash report");
            false
        } else {
            info!(server_id = %id, locator, "verified host failure");
            true
        }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for MembershipDirectory {
    fn drop(&mut self) {
        self.halt_updater();
    }
}
