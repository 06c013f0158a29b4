//! Inbound DHT request handlers.
//!
//! Every handler first records the sender in the routing table. A sender we
//! had not seen before is also handed, in the background, any values it is
//! now the closest known node for.

use tracing::trace;

use crate::contact::Contact;
use crate::dht::{Dht, StoreKind};
use crate::id::Identifier;
use crate::rpc::Transport;

/// Reply to FIND_VALUE: the value, or contacts closer to the key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FindValueReply {
    pub value: Option<String>,
    pub contacts: Vec<Contact>,
}

/// Answers PING, STORE, FIND_NODE and FIND_VALUE for one [`Dht`].
pub struct DhtNode<T: Transport> {
    dht: Dht<T>,
}

impl<T: Transport> Clone for DhtNode<T> {
    fn clone(&self) -> Self {
        Self {
            dht: self.dht.clone(),
        }
    }
}

impl<T: Transport> DhtNode<T> {
    pub fn new(dht: Dht<T>) -> Self {
        Self { dht }
    }

    pub fn dht(&self) -> &Dht<T> {
        &self.dht
    }

    pub fn our_contact(&self) -> &Contact {
        self.dht.our_contact()
    }

    /// Record `sender`; if it is new to us, push it the values it now owns.
    async fn accept_sender(&self, sender: Contact) {
        if sender.id == self.dht.our_id() {
            return;
        }
        let known = self
            .dht
            .with_routing(|rt| rt.contact_exists(&sender.id))
            .await;
        let stored = self.dht.add_contact(sender).await;
        if known {
            return;
        }
        if let Some(contact) = stored.stored().cloned() {
            let dht = self.dht.clone();
            tokio::spawn(async move { dht.push_values_to(contact).await });
        }
    }

    pub async fn ping(&self, sender: Contact) {
        self.accept_sender(sender).await;
    }

    /// Hold `key -> value`. Cached copies go to the cache store with the
    /// sender's TTL; everything else is kept for republishing.
    pub async fn store(
        &self,
        sender: Contact,
        key: Identifier,
        value: String,
        is_cached: bool,
        expiration_secs: u64,
    ) {
        let from = sender.id;
        self.accept_sender(sender).await;
        let (kind, ttl) = if is_cached {
            (StoreKind::Cache, expiration_secs)
        } else if expiration_secs > 0 {
            (StoreKind::Republish, expiration_secs)
        } else {
            (StoreKind::Republish, self.dht.config().expiration_secs)
        };
        trace!(key = %key, from = %from, ?kind, ttl, "store request");
        self.dht.store_for(kind).lock().await.set(key, value, ttl);
    }

    /// Up to `k` contacts closest to `key`, never including the sender.
    pub async fn find_node(&self, sender: Contact, key: Identifier) -> Vec<Contact> {
        let from = sender.id;
        self.accept_sender(sender).await;
        self.dht
            .with_routing(|rt| rt.close_contacts(&key, Some(&from)))
            .await
    }

    /// The value under `key` from the originator, republish or cache store,
    /// in that order; otherwise the closest contacts.
    pub async fn find_value(&self, sender: Contact, key: Identifier) -> FindValueReply {
        let from = sender.id;
        self.accept_sender(sender).await;
        for kind in [StoreKind::Originator, StoreKind::Republish, StoreKind::Cache] {
            if let Some(value) = self.dht.store_for(kind).lock().await.get(&key) {
                return FindValueReply {
                    value: Some(value),
                    contacts: Vec::new(),
                };
            }
        }
        let contacts = self
            .dht
            .with_routing(|rt| rt.close_contacts(&key, Some(&from)))
            .await;
        FindValueReply {
            value: None,
            contacts,
        }
    }
}
