//! Identifier alias table and the linked↔phone mapping.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use courier_types::ident;

/// Bidirectional-enough map from raw identifiers to canonical ones.
///
/// Invariants: a canonical identifier is never itself a key (resolution is
/// single-hop), and entries are rewritten — not chained — when two
/// identifiers are discovered to be equivalent.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AliasTable {
    map: HashMap<String, String>,
    #[serde(skip)]
    version: u64,
}

impl AliasTable {
    pub fn get(&self, raw: &str) -> Option<&str> {
        self.map.get(raw).map(String::as_str)
    }

    pub fn set(&mut self, raw: &str, canonical: &str) {
        if raw == canonical {
            return;
        }
        if self.map.get(raw).map(String::as_str) == Some(canonical) {
            return;
        }
        self.map.insert(raw.to_string(), canonical.to_string());
        self.version += 1;
    }

    /// Rewrite every entry targeting `loser` to target `winner`, add the
    /// `loser -> winner` entry itself, and drop any entry keyed by
    /// `winner`. After this call no alias points at an alias.
    pub fn repoint(&mut self, loser: &str, winner: &str) {
        if loser == winner {
            return;
        }
        for target in self.map.values_mut() {
            if target == loser {
                *target = winner.to_string();
            }
        }
        self.map.remove(winner);
        self.map.insert(loser.to_string(), winner.to_string());
        self.version += 1;
    }

    /// All raw identifiers currently resolving to `canonical`.
    pub fn raw_ids_for(&self, canonical: &str) -> Vec<String> {
        self.map
            .iter()
            .filter(|(_, target)| target.as_str() == canonical)
            .map(|(raw, _)| raw.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        if !self.map.is_empty() {
            self.map.clear();
            self.version += 1;
        }
    }

    /// Monotonic mutation counter, used to notice when a persisted
    /// snapshot is stale.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn replace(&mut self, map: HashMap<String, String>) {
        self.map = map;
        self.version += 1;
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.map.clone()
    }
}

/// Explicitly evidenced equivalences between privacy-preserving linked
/// identifiers and phone identifiers. Never populated by heuristic: only
/// a protocol event carrying both forms, or a persisted alias read back at
/// startup, may assert a pair. Pairs are never expired, even if a phone
/// number is later reassigned.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct LinkedPhoneMap {
    linked_to_phone: HashMap<String, String>,
    phone_to_linked: HashMap<String, String>,
    #[serde(skip)]
    version: u64,
}

impl LinkedPhoneMap {
    /// Record that `linked` and `phone` address the same contact. The
    /// phone side is stored suffixless.
    pub fn assert_pair(&mut self, linked: &str, phone: &str) {
        let phone = ident::strip_device_suffix(phone);
        if self.linked_to_phone.get(linked) == Some(&phone) {
            return;
        }
        self.linked_to_phone
            .insert(linked.to_string(), phone.clone());
        self.phone_to_linked.insert(phone, linked.to_string());
        self.version += 1;
    }

    pub fn phone_for(&self, linked: &str) -> Option<&str> {
        self.linked_to_phone.get(linked).map(String::as_str)
    }

    pub fn linked_for(&self, phone: &str) -> Option<&str> {
        self.phone_to_linked.get(phone).map(String::as_str)
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.linked_to_phone
            .iter()
            .map(|(l, p)| (l.as_str(), p.as_str()))
    }

    pub fn clear(&mut self) {
        if !self.linked_to_phone.is_empty() {
            self.linked_to_phone.clear();
            self.phone_to_linked.clear();
            self.version += 1;
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}
