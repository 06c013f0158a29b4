//! Routing table: an ordered list of k-buckets tiling the identifier space.
//!
//! The table starts with a single bucket covering everything and grows only
//! by halving full buckets. A full bucket may split when it covers our own
//! id, or when the prefix its contacts share is not a multiple of `b`; that
//! keeps fine resolution around our id while letting distant crowded ranges
//! split a little.

use tracing::trace;

use crate::bucket::KBucket;
use crate::contact::Contact;
use crate::error::SnapshotError;
use crate::id::{BucketRange, Identifier};

/// Result of inserting a contact into the table.
#[derive(Clone, Debug)]
pub enum AddOutcome {
    /// Stored in a bucket with free room.
    Added(Contact),
    /// The same peer was already known; its record was refreshed.
    Replaced(Contact),
    /// The owning bucket is full and may not split. The caller should ping
    /// `least_recent` and apply the delayed-eviction policy.
    Full {
        candidate: Contact,
        least_recent: Contact,
    },
    /// Our own contact; never stored.
    Ignored,
}

impl AddOutcome {
    /// The canonical stored record, when the contact made it into the table.
    pub fn stored(&self) -> Option<&Contact> {
        match self {
            AddOutcome::Added(c) | AddOutcome::Replaced(c) => Some(c),
            AddOutcome::Full { .. } | AddOutcome::Ignored => None,
        }
    }
}

/// Kademlia routing table with dynamically split buckets.
///
/// All mutation goes through `&mut self`; the engine wraps the table in a
/// single mutex so every insert, split and eviction is serialized.
#[derive(Debug)]
pub struct RoutingTable {
    our_contact: Contact,
    k: usize,
    b: usize,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    /// Create a table holding one empty bucket over the whole space.
    pub fn new(our_contact: Contact, k: usize, b: usize) -> Self {
        Self {
            our_contact,
            k,
            b: b.max(1),
            buckets: vec![KBucket::new(BucketRange::full(), k)],
        }
    }

    /// Rebuild a table from previously saved buckets.
    ///
    /// Fails unless the buckets exactly tile the identifier space.
    pub fn from_buckets(
        our_contact: Contact,
        k: usize,
        b: usize,
        mut buckets: Vec<KBucket>,
    ) -> Result<Self, SnapshotError> {
        buckets.sort_by_key(|bucket| bucket.range().low());
        let mut expected_low = Some(Identifier::ZERO);
        for bucket in &buckets {
            if Some(bucket.range().low()) != expected_low {
                return Err(SnapshotError::InvalidBuckets);
            }
            if bucket.contacts().iter().any(|c| !bucket.has_in_range(&c.id)) {
                return Err(SnapshotError::InvalidBuckets);
            }
            expected_low = bucket.range().high();
        }
        if buckets.is_empty() || expected_low.is_some() {
            return Err(SnapshotError::InvalidBuckets);
        }
        Ok(Self {
            our_contact,
            k,
            b: b.max(1),
            buckets,
        })
    }

    pub fn our_id(&self) -> Identifier {
        self.our_contact.id
    }

    pub fn our_contact(&self) -> &Contact {
        &self.our_contact
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn buckets(&self) -> &[KBucket] {
        &self.buckets
    }

    /// Total number of stored contacts.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or refresh a contact that just answered us.
    ///
    /// 1. refresh the same peer if its bucket already holds it
    /// 2. append when the bucket has room
    /// 3. split and retry when splitting is permitted
    /// 4. otherwise report [`AddOutcome::Full`] with the stale end of the bucket
    pub fn add_contact(&mut self, mut contact: Contact) -> AddOutcome {
        if self.is_ours(&contact) {
            return AddOutcome::Ignored;
        }
        contact.touch();
        self.insert(contact)
    }

    /// Insert a contact another peer told us about.
    ///
    /// A peer already in the table is left where it is: only a direct answer
    /// moves it away from the stale end of its bucket.
    pub fn learn_contact(&mut self, contact: Contact) -> AddOutcome {
        if self.is_ours(&contact) || self.knows_peer(&contact) {
            return AddOutcome::Ignored;
        }
        self.insert(contact)
    }

    /// Whether any bucket holds the same peer.
    pub fn knows_peer(&self, contact: &Contact) -> bool {
        self.buckets.iter().any(|b| b.contains_peer(contact))
    }

    fn insert(&mut self, contact: Contact) -> AddOutcome {
        loop {
            let idx = self.bucket_index(&contact.id);
            if self.buckets[idx].contains_peer(&contact) {
                if let Some(stored) = self.buckets[idx].replace_contact(&contact) {
                    return AddOutcome::Replaced(stored);
                }
            }

            let bucket = &mut self.buckets[idx];
            // In range by construction of `bucket_index`.
            if !bucket.is_full() && bucket.add_contact(contact.clone()).is_ok() {
                return match self.take_relocated(idx, &contact) {
                    Some(stored) => AddOutcome::Replaced(stored),
                    None => AddOutcome::Added(contact),
                };
            }

            if self.can_split(idx) && self.split_bucket(idx) {
                continue;
            }

            let least_recent = match self.buckets[idx].least_recently_seen() {
                Some(c) => c.clone(),
                None => return AddOutcome::Ignored,
            };
            return AddOutcome::Full {
                candidate: contact,
                least_recent,
            };
        }
    }

    /// Fold stale records of the same machine held in other buckets into the
    /// record just stored in bucket `target_idx`. This happens when a peer
    /// restarts with a new id.
    fn take_relocated(&mut self, target_idx: usize, contact: &Contact) -> Option<Contact> {
        if contact.machine_id.is_empty() {
            return None;
        }
        let mut stored = None;
        for idx in 0..self.buckets.len() {
            if idx == target_idx {
                continue;
            }
            let stale: Vec<Identifier> = self.buckets[idx]
                .contacts()
                .iter()
                .filter(|c| c.same_peer(contact))
                .map(|c| c.id)
                .collect();
            for id in stale {
                let Some(mut old) = self.buckets[idx].evict_contact(&id) else {
                    continue;
                };
                trace!(peer = %id, new_id = %contact.id, "relocating restarted peer");
                old.id = contact.id;
                old.endpoint = contact.endpoint.clone();
                stored = self.buckets[target_idx].replace_contact(&old).or(stored);
            }
        }
        stored
    }

    fn is_ours(&self, contact: &Contact) -> bool {
        contact.id == self.our_contact.id
            || (!contact.machine_id.is_empty() && contact.machine_id == self.our_contact.machine_id)
    }

    fn can_split(&self, idx: usize) -> bool {
        let bucket = &self.buckets[idx];
        bucket.has_in_range(&self.our_contact.id) || bucket.depth() % self.b != 0
    }

    /// Replace bucket `idx` with its two halves. Returns false at full depth.
    fn split_bucket(&mut self, idx: usize) -> bool {
        let Some((lower, upper)) = self.buckets[idx].split() else {
            return false;
        };
        trace!(
            low = %lower.range().low(),
            prefix_len = lower.range().prefix_len(),
            "splitting bucket"
        );
        self.buckets[idx] = lower;
        self.buckets.insert(idx + 1, upper);
        true
    }

    /// Index of the bucket whose range contains `id`.
    ///
    /// A linear scan; the bucket count is bounded by the identifier width.
    pub fn bucket_index(&self, id: &Identifier) -> usize {
        self.buckets
            .iter()
            .position(|bucket| bucket.has_in_range(id))
            .unwrap_or(0)
    }

    /// The bucket whose range contains `id`.
    pub fn get_kbucket(&self, id: &Identifier) -> &KBucket {
        &self.buckets[self.bucket_index(id)]
    }

    /// Mark the bucket owning `key` as recently used.
    pub fn touch_bucket_with_key(&mut self, key: &Identifier) {
        let idx = self.bucket_index(key);
        self.buckets[idx].touch();
    }

    /// Up to `k` contacts closest to `key`, excluding `exclude`.
    ///
    /// Brute force over every bucket; ties keep table order.
    pub fn close_contacts(&self, key: &Identifier, exclude: Option<&Identifier>) -> Vec<Contact> {
        let mut all: Vec<Contact> = self
            .buckets
            .iter()
            .flat_map(|b| b.contacts().iter())
            .filter(|c| Some(&c.id) != exclude)
            .cloned()
            .collect();
        all.sort_by_key(|c| c.id.distance(key));
        all.truncate(self.k);
        all
    }

    /// Whether any bucket stores `id`.
    pub fn contact_exists(&self, id: &Identifier) -> bool {
        self.get_kbucket(id).contains_id(id)
    }

    /// The stored record for `id`.
    pub fn contact(&self, id: &Identifier) -> Option<Contact> {
        self.get_kbucket(id)
            .contacts()
            .iter()
            .find(|c| &c.id == id)
            .cloned()
    }

    /// Every stored contact, bucket by bucket.
    pub fn all_contacts(&self) -> Vec<Contact> {
        self.buckets
            .iter()
            .flat_map(|b| b.contacts().iter().cloned())
            .collect()
    }

    /// Remove `id` from its bucket.
    pub fn evict(&mut self, id: &Identifier) -> Option<Contact> {
        let idx = self.bucket_index(id);
        self.buckets[idx].evict_contact(id)
    }

    /// Insert into the bucket owning `contact` only if it has room.
    ///
    /// Used when promoting a pending contact into a slot freed by eviction;
    /// never splits.
    pub fn insert_if_room(&mut self, mut contact: Contact) -> bool {
        if self.is_ours(&contact) {
            return false;
        }
        let idx = self.bucket_index(&contact.id);
        let bucket = &mut self.buckets[idx];
        if bucket.contains_peer(&contact) {
            return bucket.replace_contact(&contact).is_some();
        }
        contact.touch();
        bucket.add_contact(contact).is_ok()
    }

    /// Number of buckets between the bucket holding our id and the one
    /// holding `id`.
    pub fn separating_buckets(&self, id: &Identifier) -> usize {
        let ours = self.bucket_index(&self.our_contact.id);
        let theirs = self.bucket_index(id);
        ours.abs_diff(theirs)
    }

    /// Ranges and contacts of buckets not touched since `before`.
    pub fn stale_buckets(
        &self,
        before: chrono::DateTime<chrono::Utc>,
    ) -> Vec<(BucketRange, Vec<Contact>)> {
        self.buckets
            .iter()
            .filter(|b| b.last_touched() < before)
            .map(|b| (*b.range(), b.contacts().to_vec()))
            .collect()
    }

    /// Mark the bucket with exactly this range as refreshed.
    pub fn touch_range(&mut self, range: &BucketRange) {
        if let Some(bucket) = self.buckets.iter_mut().find(|b| b.range() == range) {
            bucket.touch();
        }
    }
}
