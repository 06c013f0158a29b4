//! The DHT engine: lookups, replication, eviction and maintenance.
//!
//! [`Dht`] is a cheap-to-clone handle; every clone shares the same routing
//! table, stores and background tasks. Inbound requests are answered by a
//! [`DhtNode`](crate::node::DhtNode) built from the same handle.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::bucket::KBucket;
use crate::config::DhtConfig;
use crate::contact::Contact;
use crate::download::OnlineContacts;
use crate::error::SnapshotError;
use crate::id::{BucketRange, Identifier};
use crate::node::DhtNode;
use crate::routing::{AddOutcome, RoutingTable};
use crate::rpc::{RpcClient, RpcError, Transport};
use crate::storage::{StoredValue, ValueStore};

// ─────────────────────────────────────────────────────────────────────────────
// Results
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of an iterative lookup.
#[derive(Clone, Debug, Default)]
pub struct LookupResult {
    /// Whether a value was found (value lookups only).
    pub found: bool,
    /// Up to `k` contacts closest to the key, nearest first.
    pub contacts: Vec<Contact>,
    /// The contact that returned the value.
    pub found_by: Option<Contact>,
    pub value: Option<String>,
}

/// Which local store a value lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreKind {
    /// Values this node stored through [`Dht::store`].
    Originator,
    /// Values other nodes asked us to hold.
    Republish,
    /// Copies placed by other nodes' lookups.
    Cache,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LookupMode {
    Node,
    Value,
}

struct LookupState {
    result: LookupResult,
    /// Queried contacts that answered without the value, nearest first.
    without_value: Vec<Contact>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// Everything needed to bring a node back after a restart.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DhtSnapshot {
    pub our_contact: Contact,
    pub config: DhtConfig,
    pub buckets: Vec<KBucket>,
    pub originator: ValueStore,
    pub republish: ValueStore,
    pub cache: ValueStore,
    #[serde(default)]
    pub pending: Vec<Contact>,
    #[serde(default)]
    pub evictions: HashMap<Identifier, u32>,
}

impl DhtSnapshot {
    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let raw = std::fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

/// Kademlia engine over a [`Transport`].
pub struct Dht<T: Transport> {
    our_contact: Contact,
    config: Arc<DhtConfig>,
    routing: Arc<Mutex<RoutingTable>>,
    originator: Arc<Mutex<ValueStore>>,
    republish: Arc<Mutex<ValueStore>>,
    cache: Arc<Mutex<ValueStore>>,
    /// Contacts waiting for a slot in a full bucket, oldest first.
    pending: Arc<Mutex<VecDeque<Contact>>>,
    /// Consecutive RPC failures per contact.
    evictions: Arc<Mutex<HashMap<Identifier, u32>>>,
    rpc: RpcClient<T>,
    /// Bounds background pings of stale contacts.
    stale_checks: Arc<Semaphore>,
    cancel: CancellationToken,
    tasks: Arc<std::sync::Mutex<Vec<JoinHandle<()>>>>,
}

impl<T: Transport> Clone for Dht<T> {
    fn clone(&self) -> Self {
        Self {
            our_contact: self.our_contact.clone(),
            config: self.config.clone(),
            routing: self.routing.clone(),
            originator: self.originator.clone(),
            republish: self.republish.clone(),
            cache: self.cache.clone(),
            pending: self.pending.clone(),
            evictions: self.evictions.clone(),
            rpc: self.rpc.clone(),
            stale_checks: self.stale_checks.clone(),
            cancel: self.cancel.clone(),
            tasks: self.tasks.clone(),
        }
    }
}

impl<T: Transport> Dht<T> {
    /// A fresh node with an empty routing table and empty stores.
    pub fn new(our_contact: Contact, transport: Arc<T>, config: DhtConfig) -> Self {
        let routing = RoutingTable::new(our_contact.clone(), config.k, config.b);
        let capacity = config.store_capacity;
        Self::assemble(
            our_contact,
            transport,
            config,
            routing,
            [
                ValueStore::new(capacity),
                ValueStore::new(capacity),
                ValueStore::new(capacity),
            ],
            VecDeque::new(),
            HashMap::new(),
        )
    }

    fn assemble(
        our_contact: Contact,
        transport: Arc<T>,
        config: DhtConfig,
        routing: RoutingTable,
        [originator, republish, cache]: [ValueStore; 3],
        pending: VecDeque<Contact>,
        evictions: HashMap<Identifier, u32>,
    ) -> Self {
        let rpc = RpcClient::new(transport, &our_contact, config.rpc_timeouts);
        let stale_checks = Arc::new(Semaphore::new(config.max_parallelism.max(1)));
        Self {
            our_contact,
            config: Arc::new(config),
            routing: Arc::new(Mutex::new(routing)),
            originator: Arc::new(Mutex::new(originator)),
            republish: Arc::new(Mutex::new(republish)),
            cache: Arc::new(Mutex::new(cache)),
            pending: Arc::new(Mutex::new(pending)),
            evictions: Arc::new(Mutex::new(evictions)),
            rpc,
            stale_checks,
            cancel: CancellationToken::new(),
            tasks: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn our_contact(&self) -> &Contact {
        &self.our_contact
    }

    pub fn our_id(&self) -> Identifier {
        self.our_contact.id
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn rpc(&self) -> &RpcClient<T> {
        &self.rpc
    }

    /// Concurrent RPCs allowed for one fan-out.
    fn parallelism(&self) -> usize {
        self.config.max_parallelism.max(1)
    }

    /// Request handlers sharing this engine's state.
    pub fn node(&self) -> DhtNode<T> {
        DhtNode::new(self.clone())
    }

    /// Run `f` against the routing table under its lock.
    pub async fn with_routing<R>(&self, f: impl FnOnce(&RoutingTable) -> R) -> R {
        let rt = self.routing.lock().await;
        f(&rt)
    }

    /// Every contact in the routing table.
    pub async fn contacts(&self) -> Vec<Contact> {
        self.routing.lock().await.all_contacts()
    }

    pub async fn pending_contacts(&self) -> Vec<Contact> {
        self.pending.lock().await.iter().cloned().collect()
    }

    /// Consecutive failures recorded against `id`.
    pub async fn eviction_count(&self, id: &Identifier) -> u32 {
        self.evictions.lock().await.get(id).copied().unwrap_or(0)
    }

    /// Peek at a local store entry without touching recency.
    pub async fn stored_value(&self, kind: StoreKind, key: &Identifier) -> Option<StoredValue> {
        self.store_for(kind).lock().await.entry(key).cloned()
    }

    pub(crate) fn store_for(&self, kind: StoreKind) -> &Arc<Mutex<ValueStore>> {
        match kind {
            StoreKind::Originator => &self.originator,
            StoreKind::Republish => &self.republish,
            StoreKind::Cache => &self.cache,
        }
    }

    // ── contacts and eviction ───────────────────────────────────────────────

    /// Insert or refresh `contact` after it answered us, clearing its
    /// failure count.
    ///
    /// When its bucket is full and may not split, the least recently seen
    /// contact is pinged in the background: if it answers, the newcomer is
    /// parked in the pending list; if not, the failure counts towards its
    /// eviction.
    pub async fn add_contact(&self, contact: Contact) -> AddOutcome {
        let outcome = self.routing.lock().await.add_contact(contact);
        if let Some(stored) = outcome.stored() {
            self.evictions.lock().await.remove(&stored.id);
            trace!(peer = %stored.id, "contact stored");
        }
        self.check_full(&outcome);
        outcome
    }

    /// Insert a contact that another peer returned in a lookup reply.
    ///
    /// Known peers keep their place and their failure count.
    pub async fn learn_contact(&self, contact: Contact) -> AddOutcome {
        let outcome = self.routing.lock().await.learn_contact(contact);
        if let AddOutcome::Added(stored) = &outcome {
            trace!(peer = %stored.id, "learned contact");
        }
        self.check_full(&outcome);
        outcome
    }

    fn check_full(&self, outcome: &AddOutcome) {
        if let AddOutcome::Full {
            candidate,
            least_recent,
        } = outcome
        {
            self.spawn_stale_check(candidate.clone(), least_recent.clone());
        }
    }

    /// Ping the stale end of a full bucket off the caller's path.
    fn spawn_stale_check(&self, candidate: Contact, least_recent: Contact) {
        let dht = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = dht.stale_checks.clone().acquire_owned().await else {
                return;
            };
            match dht.rpc.ping(&least_recent).await {
                Ok(()) => {
                    dht.routing.lock().await.add_contact(least_recent.clone());
                    dht.evictions.lock().await.remove(&least_recent.id);
                    dht.add_pending(candidate).await;
                }
                Err(err) => {
                    debug!(peer = %least_recent.id, error = %err, "stale contact did not answer ping");
                    dht.delay_eviction(&least_recent, Some(candidate)).await;
                }
            }
        });
    }

    /// Record an RPC failure against `contact`.
    pub async fn handle_error(&self, err: &RpcError, contact: &Contact) {
        debug!(peer = %contact.id, endpoint = %contact.endpoint, error = %err, "rpc failed");
        self.delay_eviction(contact, None).await;
    }

    /// Count a failure against `to_evict`, parking `to_replace` as pending.
    ///
    /// Once the count reaches the eviction limit the contact is removed and
    /// the most recently seen pending contact for the same bucket takes its
    /// place.
    pub async fn delay_eviction(&self, to_evict: &Contact, to_replace: Option<Contact>) {
        if let Some(candidate) = to_replace {
            self.add_pending(candidate).await;
        }
        let count = {
            let mut counts = self.evictions.lock().await;
            let count = counts.entry(to_evict.id).or_insert(0);
            *count += 1;
            *count
        };
        if count >= self.config.eviction_limit {
            self.replace_contact(to_evict).await;
        }
    }

    async fn replace_contact(&self, to_evict: &Contact) {
        self.evictions.lock().await.remove(&to_evict.id);
        let mut rt = self.routing.lock().await;
        if rt.evict(&to_evict.id).is_none() {
            return;
        }
        info!(peer = %to_evict.id, "evicted unresponsive contact");

        let bucket = rt.bucket_index(&to_evict.id);
        let mut pending = self.pending.lock().await;
        let newest = pending
            .iter()
            .enumerate()
            .filter(|(_, c)| rt.bucket_index(&c.id) == bucket)
            .max_by_key(|(_, c)| c.last_seen)
            .map(|(idx, _)| idx);
        if let Some(contact) = newest.and_then(|idx| pending.remove(idx)) {
            let id = contact.id;
            if rt.insert_if_room(contact) {
                debug!(peer = %id, "promoted pending contact");
            }
        }
    }

    async fn add_pending(&self, contact: Contact) {
        if contact.id == self.our_contact.id {
            return;
        }
        let mut pending = self.pending.lock().await;
        pending.retain(|c| c.id != contact.id);
        pending.push_back(contact);
        while pending.len() > self.config.max_pending_contacts.max(1) {
            pending.pop_front();
        }
    }

    // ── lookups ─────────────────────────────────────────────────────────────

    /// Iterative FIND_NODE towards `key`.
    pub async fn lookup(&self, key: Identifier) -> LookupResult {
        self.run_lookup(key, LookupMode::Node).await.result
    }

    /// Iterative lookup.
    ///
    /// 1. seed the shortlist with the `k` closest known contacts
    /// 2. query `alpha` unqueried contacts in parallel
    /// 3. merge what they return and keep the `k` closest
    /// 4. when a round brings nothing closer, query every remaining
    ///    unqueried contact once; stop if that round does not improve either
    ///
    /// Value lookups stop as soon as any contact returns the value.
    async fn run_lookup(&self, key: Identifier, mode: LookupMode) -> LookupState {
        let k = self.config.k.max(1);
        let alpha = self.config.alpha.max(1);
        let mut shortlist = {
            let rt = self.routing.lock().await;
            rt.close_contacts(&key, None)
        };
        let mut state = LookupState {
            result: LookupResult::default(),
            without_value: Vec::new(),
        };
        if shortlist.is_empty() {
            return state;
        }

        let mut seen: HashSet<Identifier> = shortlist.iter().map(|c| c.id).collect();
        seen.insert(self.our_contact.id);
        let mut queried: HashSet<Identifier> = HashSet::new();
        let mut best = shortlist[0].id.distance(&key);
        let mut final_round = false;

        loop {
            let width = if final_round { k } else { alpha };
            let batch: Vec<Contact> = shortlist
                .iter()
                .filter(|c| !queried.contains(&c.id))
                .take(width)
                .cloned()
                .collect();
            if batch.is_empty() {
                break;
            }
            queried.extend(batch.iter().map(|c| c.id));

            let replies: Vec<_> = stream::iter(batch)
                .map(|contact| async move {
                    let reply = match mode {
                        LookupMode::Node => self
                            .rpc
                            .find_node(&contact, key)
                            .await
                            .map(|contacts| (None, contacts)),
                        LookupMode::Value => self.rpc.find_value(&contact, key).await,
                    };
                    (contact, reply)
                })
                .buffer_unordered(self.parallelism())
                .collect()
                .await;

            for (contact, reply) in replies {
                match reply {
                    Ok((value, returned)) => {
                        self.add_contact(contact.clone()).await;
                        if let Some(value) = value {
                            if state.result.found_by.is_none() {
                                state.result.found = true;
                                state.result.value = Some(value);
                                state.result.found_by = Some(contact);
                            }
                            continue;
                        }
                        state.without_value.push(contact);
                        for discovered in returned {
                            if seen.insert(discovered.id) {
                                self.learn_contact(discovered.clone()).await;
                                shortlist.push(discovered);
                            }
                        }
                    }
                    Err(err) => {
                        self.handle_error(&err, &contact).await;
                        shortlist.retain(|c| c.id != contact.id);
                    }
                }
            }

            shortlist.sort_by_key(|c| c.id.distance(&key));
            shortlist.truncate(k);
            if state.result.found {
                break;
            }

            match shortlist.first().map(|c| c.id.distance(&key)) {
                Some(nearest) if nearest < best => {
                    best = nearest;
                    final_round = false;
                }
                Some(_) if !final_round => final_round = true,
                _ => break,
            }
        }

        state.without_value.sort_by_key(|c| c.id.distance(&key));
        state.result.contacts = shortlist;
        state
    }

    // ── store / find ────────────────────────────────────────────────────────

    /// Store `value` under `key` as its originator and replicate it to the
    /// `k` closest contacts. Returns how many of them accepted it.
    pub async fn store(&self, key: Identifier, value: &str) -> usize {
        {
            let mut rt = self.routing.lock().await;
            rt.touch_bucket_with_key(&key);
        }
        self.originator
            .lock()
            .await
            .set(key, value, self.config.expiration_secs);

        let lookup = self.lookup(key).await;
        let stored = self
            .store_on(&lookup.contacts, key, value, false, self.config.expiration_secs)
            .await;
        debug!(key = %key, replicas = stored, "stored value");
        stored
    }

    /// Find the value under `key`: local stores first, then the network.
    ///
    /// A value found remotely is also cached at the closest queried contact
    /// that did not have it, with a lifetime halved for every bucket between
    /// us and that contact.
    pub async fn find_value(&self, key: Identifier) -> LookupResult {
        {
            let mut rt = self.routing.lock().await;
            rt.touch_bucket_with_key(&key);
        }
        for kind in [StoreKind::Originator, StoreKind::Republish, StoreKind::Cache] {
            if let Some(value) = self.store_for(kind).lock().await.get(&key) {
                return LookupResult {
                    found: true,
                    contacts: Vec::new(),
                    found_by: None,
                    value: Some(value),
                };
            }
        }

        let state = self.run_lookup(key, LookupMode::Value).await;
        if let (Some(value), Some(target)) = (&state.result.value, state.without_value.first()) {
            let separating = {
                let rt = self.routing.lock().await;
                rt.separating_buckets(&target.id)
            };
            let ttl = self
                .config
                .expiration_secs
                .checked_shr(separating as u32)
                .unwrap_or(0)
                .max(1);
            if let Err(err) = self.rpc.store(target, key, value, true, ttl).await {
                self.handle_error(&err, target).await;
            } else {
                trace!(key = %key, peer = %target.id, ttl, "cached value on lookup path");
            }
        }
        state.result
    }

    /// Send STORE to every contact concurrently; failures feed eviction.
    async fn store_on(
        &self,
        contacts: &[Contact],
        key: Identifier,
        value: &str,
        is_cached: bool,
        expiration_secs: u64,
    ) -> usize {
        let results: Vec<_> = stream::iter(contacts.iter().cloned())
            .map(|contact| async move {
                let result = self
                    .rpc
                    .store(&contact, key, value, is_cached, expiration_secs)
                    .await;
                (contact, result)
            })
            .buffer_unordered(self.parallelism())
            .collect()
            .await;

        let mut stored = 0;
        for (contact, result) in results {
            match result {
                Ok(()) => {
                    self.add_contact(contact.clone()).await;
                    stored += 1;
                }
                Err(err) => self.handle_error(&err, &contact).await,
            }
        }
        stored
    }

    /// Hand a newly seen peer the values it is now closest to.
    ///
    /// For every originated or republished key, the newcomer gets a copy when
    /// it is closer to the key than every other contact we know.
    pub(crate) async fn push_values_to(&self, newcomer: Contact) {
        let mut entries: Vec<(Identifier, StoredValue)> = Vec::new();
        for kind in [StoreKind::Originator, StoreKind::Republish] {
            let store = self.store_for(kind).lock().await;
            for key in store.keys() {
                if let Some(entry) = store.entry(&key) {
                    entries.push((key, entry.clone()));
                }
            }
        }
        if entries.is_empty() {
            return;
        }

        let mut sent = 0usize;
        for (key, entry) in entries {
            let nearest_other = {
                let rt = self.routing.lock().await;
                rt.close_contacts(&key, Some(&newcomer.id))
                    .first()
                    .map(|c| c.id.distance(&key))
            };
            let theirs = newcomer.id.distance(&key);
            if nearest_other.is_some_and(|d| d <= theirs) {
                continue;
            }
            match self
                .rpc
                .store(&newcomer, key, &entry.value, false, self.config.expiration_secs)
                .await
            {
                Ok(()) => sent += 1,
                Err(err) => {
                    self.handle_error(&err, &newcomer).await;
                    return;
                }
            }
        }
        if sent > 0 {
            debug!(peer = %newcomer.id, values = sent, "pushed values to new contact");
        }
    }

    // ── bootstrap ───────────────────────────────────────────────────────────

    /// Join the network through `known`.
    ///
    /// Asks `known` for the contacts closest to our id, adds everything it
    /// returns, then refreshes every bucket other than the one holding
    /// `known`. Returns the number of contacts learned.
    pub async fn bootstrap(&self, known: Contact) -> Result<usize, RpcError> {
        let returned = match self.rpc.find_node(&known, self.our_contact.id).await {
            Ok(contacts) => contacts,
            Err(err) => {
                self.handle_error(&err, &known).await;
                return Err(err);
            }
        };
        self.add_contact(known.clone()).await;
        let learned = returned.len();
        for contact in returned {
            self.learn_contact(contact).await;
        }

        let (known_range, others) = {
            let rt = self.routing.lock().await;
            let known_range = *rt.get_kbucket(&known.id).range();
            let others: Vec<(BucketRange, Vec<Contact>)> = rt
                .buckets()
                .iter()
                .filter(|b| *b.range() != known_range)
                .map(|b| (*b.range(), b.contacts().to_vec()))
                .collect();
            (known_range, others)
        };
        trace!(range = ?known_range, buckets = others.len(), "refreshing buckets after bootstrap");
        for (range, contacts) in others {
            self.refresh_bucket(range, contacts).await;
        }
        info!(via = %known.id, learned, "bootstrapped");
        Ok(learned)
    }

    /// Look up a random id inside `range` through each of its contacts.
    async fn refresh_bucket(&self, range: BucketRange, contacts: Vec<Contact>) {
        let target = range.random_id();
        let replies: Vec<_> = stream::iter(contacts)
            .map(|contact| async move {
                let reply = self.rpc.find_node(&contact, target).await;
                (contact, reply)
            })
            .buffer_unordered(self.parallelism())
            .collect()
            .await;
        for (contact, reply) in replies {
            match reply {
                Ok(returned) => {
                    self.add_contact(contact).await;
                    for discovered in returned {
                        self.learn_contact(discovered).await;
                    }
                }
                Err(err) => self.handle_error(&err, &contact).await,
            }
        }
        self.routing.lock().await.touch_range(&range);
    }

    // ── maintenance ─────────────────────────────────────────────────────────

    /// Refresh every bucket not looked up within the refresh interval.
    pub async fn refresh_stale_buckets(&self) {
        let before = Utc::now() - chrono_duration(self.config.bucket_refresh_interval);
        let stale = self.routing.lock().await.stale_buckets(before);
        if !stale.is_empty() {
            debug!(buckets = stale.len(), "refreshing stale buckets");
        }
        for (range, contacts) in stale {
            self.refresh_bucket(range, contacts).await;
        }
    }

    /// Re-replicate stored values not republished within the interval.
    pub async fn republish_values(&self) {
        let before = Utc::now() - chrono_duration(self.config.republish_interval);
        let due = self.republish.lock().await.untouched_since(before);
        for (key, entry) in due {
            let lookup = self.lookup(key).await;
            self.store_on(&lookup.contacts, key, &entry.value, false, self.config.expiration_secs)
                .await;
            self.republish.lock().await.touch(&key);
        }
    }

    /// Re-send originated values to the closest known contacts.
    pub async fn republish_originated(&self) {
        let before = Utc::now() - chrono_duration(self.config.originator_republish_interval);
        let due = self.originator.lock().await.untouched_since(before);
        for (key, entry) in due {
            let contacts = self.routing.lock().await.close_contacts(&key, None);
            self.store_on(&contacts, key, &entry.value, false, self.config.expiration_secs)
                .await;
            self.originator.lock().await.touch(&key);
        }
    }

    /// Drop expired republished and cached values.
    pub async fn expire_values(&self) {
        let now = Utc::now();
        let republished = self.republish.lock().await.remove_expired(now);
        let cached = self.cache.lock().await.remove_expired(now);
        if !republished.is_empty() || !cached.is_empty() {
            debug!(
                republished = republished.len(),
                cached = cached.len(),
                "expired values"
            );
        }
    }

    /// Start the periodic maintenance tasks.
    pub fn start(&self) {
        let config = self.config.clone();
        self.spawn_periodic(config.bucket_refresh_interval, |dht| async move {
            dht.refresh_stale_buckets().await
        });
        self.spawn_periodic(config.republish_interval, |dht| async move {
            dht.republish_values().await
        });
        self.spawn_periodic(config.originator_republish_interval, |dht| async move {
            dht.republish_originated().await
        });
        self.spawn_periodic(config.expiry_check_interval, |dht| async move {
            dht.expire_values().await
        });
    }

    /// Run `job` every `period` until shutdown. The first tick is skipped.
    fn spawn_periodic<F, Fut>(&self, period: Duration, job: F)
    where
        F: Fn(Dht<T>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let dht = self.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => job(dht.clone()).await,
                }
            }
        });
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }

    /// Stop the maintenance tasks and wait for them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "maintenance task ended abnormally");
            }
        }
    }

    // ── persistence ─────────────────────────────────────────────────────────

    /// Capture routing state, stores and eviction bookkeeping.
    pub async fn snapshot(&self) -> DhtSnapshot {
        let buckets = self.routing.lock().await.buckets().to_vec();
        DhtSnapshot {
            our_contact: self.our_contact.clone(),
            config: (*self.config).clone(),
            buckets,
            originator: self.originator.lock().await.clone(),
            republish: self.republish.lock().await.clone(),
            cache: self.cache.lock().await.clone(),
            pending: self.pending.lock().await.iter().cloned().collect(),
            evictions: self.evictions.lock().await.clone(),
        }
    }

    /// Rebuild an engine from a snapshot and restart its maintenance tasks.
    pub fn restore(snapshot: DhtSnapshot, transport: Arc<T>) -> Result<Self, SnapshotError> {
        let config = snapshot.config;
        let routing = RoutingTable::from_buckets(
            snapshot.our_contact.clone(),
            config.k,
            config.b,
            snapshot.buckets,
        )?;
        let dht = Self::assemble(
            snapshot.our_contact,
            transport,
            config,
            routing,
            [snapshot.originator, snapshot.republish, snapshot.cache],
            snapshot.pending.into_iter().collect(),
            snapshot.evictions,
        );
        dht.start();
        Ok(dht)
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

#[async_trait]
impl<T: Transport> OnlineContacts for Dht<T> {
    async fn online_contacts(&self) -> Vec<Contact> {
        self.contacts().await
    }
}
