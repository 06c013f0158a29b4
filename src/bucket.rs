//! A single k-bucket covering one contiguous range of the identifier space.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::contact::Contact;
use crate::error::BucketError;
use crate::id::{BucketRange, Identifier, ID_BITS};

/// Up to `k` contacts whose ids fall inside `range`.
///
/// Contacts are kept in recency order: the front is the least recently seen,
/// the back the most recent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KBucket {
    range: BucketRange,
    contacts: Vec<Contact>,
    /// Last time the bucket was looked up or refreshed.
    last_touched: DateTime<Utc>,
    k: usize,
}

impl KBucket {
    /// An empty bucket for `range`.
    pub fn new(range: BucketRange, k: usize) -> Self {
        Self {
            range,
            contacts: Vec::with_capacity(k),
            last_touched: Utc::now(),
            k,
        }
    }

    pub fn range(&self) -> &BucketRange {
        &self.range
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.contacts.len() >= self.k
    }

    pub fn last_touched(&self) -> DateTime<Utc> {
        self.last_touched
    }

    /// Mark the bucket as refreshed now.
    pub fn touch(&mut self) {
        self.last_touched = Utc::now();
    }

    /// `low <= id < high`.
    pub fn has_in_range(&self, id: &Identifier) -> bool {
        self.range.contains(id)
    }

    /// Whether a contact with this id is stored here.
    pub fn contains_id(&self, id: &Identifier) -> bool {
        self.contacts.iter().any(|c| &c.id == id)
    }

    /// Whether the same peer (by machine identity or id) is stored here.
    pub fn contains_peer(&self, contact: &Contact) -> bool {
        self.contacts.iter().any(|c| is_same(c, contact))
    }

    /// Append a contact at the most-recent end.
    pub fn add_contact(&mut self, contact: Contact) -> Result<(), BucketError> {
        if !self.range.contains(&contact.id) {
            return Err(BucketError::OutOfRange);
        }
        if self.is_full() {
            return Err(BucketError::BucketFull);
        }
        self.contacts.push(contact);
        Ok(())
    }

    /// Refresh the stored record of the same peer with `contact`'s id and
    /// endpoint and move it to the most-recent end.
    ///
    /// Returns the canonical stored record, or `None` if the peer is absent.
    pub fn replace_contact(&mut self, contact: &Contact) -> Option<Contact> {
        let pos = self.contacts.iter().position(|c| is_same(c, contact))?;
        let mut stored = self.contacts.remove(pos);
        stored.id = contact.id;
        stored.endpoint = contact.endpoint.clone();
        if !contact.machine_id.is_empty() {
            stored.machine_id = contact.machine_id.clone();
        }
        stored.buckets.extend(contact.buckets.iter().cloned());
        stored.last_seen = contact.last_seen.max(stored.last_seen);
        self.contacts.push(stored.clone());
        Some(stored)
    }

    /// Remove a contact wherever it sits in the recency order.
    pub fn evict_contact(&mut self, id: &Identifier) -> Option<Contact> {
        let pos = self.contacts.iter().position(|c| &c.id == id)?;
        Some(self.contacts.remove(pos))
    }

    /// The contact at the stale end of the recency order.
    pub fn least_recently_seen(&self) -> Option<&Contact> {
        self.contacts.first()
    }

    /// Number of leading bits shared by every contact's id.
    ///
    /// `0` for an empty bucket.
    pub fn depth(&self) -> usize {
        let mut iter = self.contacts.iter();
        let Some(first) = iter.next() else {
            return 0;
        };
        iter.fold(ID_BITS, |depth, c| depth.min(first.id.shared_prefix_len(&c.id)))
    }

    /// Split into the two halves of this bucket's range.
    ///
    /// Every contact lands in the half containing its id; recency order is
    /// preserved within each half. `None` when the range cannot be halved.
    pub fn split(&self) -> Option<(KBucket, KBucket)> {
        let (lower_range, upper_range) = self.range.split()?;
        let mut lower = KBucket::new(lower_range, self.k);
        let mut upper = KBucket::new(upper_range, self.k);
        lower.last_touched = self.last_touched;
        upper.last_touched = self.last_touched;
        for contact in &self.contacts {
            if lower_range.contains(&contact.id) {
                lower.contacts.push(contact.clone());
            } else {
                upper.contacts.push(contact.clone());
            }
        }
        Some((lower, upper))
    }
}

fn is_same(stored: &Contact, incoming: &Contact) -> bool {
    stored.id == incoming.id || stored.same_peer(incoming)
}
