//! Canonical identity resolution.
//!
//! `resolve` decides which canonical identifier a raw protocol identifier
//! belongs to. It is total — every input maps to something — and its only
//! side effects are the alias/merge writes needed to extend the table when
//! a new equivalence is discovered. Equivalence between a linked
//! identifier and a phone identifier is never guessed; it must already be
//! present in the store's linked↔phone map.

use courier_types::ident::{self, IdClass};

use crate::store::DeviceStore;

/// Resolve a raw identifier to its canonical form, extending the alias
/// table and merging conversation records as required.
pub fn resolve(store: &mut DeviceStore, raw: &str) -> String {
    if let Some(canonical) = store.aliases.get(raw) {
        return canonical.to_string();
    }

    match ident::classify(raw) {
        // groups are always canonical, never merged
        IdClass::Group | IdClass::Broadcast | IdClass::Other => raw.to_string(),

        IdClass::Linked => {
            let phone = store.linked_phone.phone_for(raw).map(str::to_string);
            match phone {
                // no phone evidence: the linked form is its own canonical id
                None => raw.to_string(),
                Some(phone) => {
                    store.merge(raw, &phone);
                    phone
                }
            }
        }

        IdClass::Phone { suffixed } => {
            let base = if suffixed {
                let base = ident::strip_device_suffix(raw);
                store.merge(raw, &base);
                base
            } else {
                raw.to_string()
            };

            // a linked identifier already known to map here may still own
            // the conversation record; fold it in
            let linked = store.linked_phone.linked_for(&base).map(str::to_string);
            if let Some(linked) = linked {
                if store.conversations.contains_key(&linked)
                    && !store.conversations.contains_key(&base)
                {
                    store.merge(&linked, &base);
                }
            }
            base
        }
    }
}
