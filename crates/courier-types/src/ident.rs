//! Protocol identifier shapes.
//!
//! The messaging protocol addresses conversations with string identifiers
//! whose domain suffix tells us what they are:
//!
//! - `<digits>@msg` — a phone-based contact. The user part may carry a
//!   device-instance suffix (`<digits>:<n>@msg`); the suffixless form is
//!   the base identifier.
//! - `<opaque>@linked` — a privacy-preserving contact identifier that does
//!   not reveal a phone number.
//! - `<opaque>@group` — a group conversation.
//! - `status@broadcast` — the protocol's system pseudo-conversation.

pub const PHONE_DOMAIN: &str = "@msg";
pub const LINKED_DOMAIN: &str = "@linked";
pub const GROUP_DOMAIN: &str = "@group";
pub const BROADCAST_ID: &str = "status@broadcast";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdClass {
    Group,
    Phone { suffixed: bool },
    Linked,
    Broadcast,
    Other,
}

pub fn classify(id: &str) -> IdClass {
    if id == BROADCAST_ID {
        return IdClass::Broadcast;
    }
    if id.ends_with(GROUP_DOMAIN) {
        return IdClass::Group;
    }
    if id.ends_with(LINKED_DOMAIN) {
        return IdClass::Linked;
    }
    if let Some(user) = id.strip_suffix(PHONE_DOMAIN) {
        return IdClass::Phone {
            suffixed: user.contains(':'),
        };
    }
    IdClass::Other
}

pub fn is_group(id: &str) -> bool {
    matches!(classify(id), IdClass::Group)
}

pub fn is_broadcast(id: &str) -> bool {
    matches!(classify(id), IdClass::Broadcast)
}

/// Strip the device-instance suffix from a phone identifier.
/// `4915550001:3@msg` becomes `4915550001@msg`; anything else is returned
/// unchanged.
pub fn strip_device_suffix(id: &str) -> String {
    match id.strip_suffix(PHONE_DOMAIN) {
        Some(user) => match user.split_once(':') {
            Some((base, _)) => format!("{}{}", base, PHONE_DOMAIN),
            None => id.to_string(),
        },
        None => id.to_string(),
    }
}

/// The digits of a phone identifier's user part, used as the key when
/// deciding whether two durable conversation rows describe the same
/// contact. `None` for non-phone identifiers.
pub fn normalized_phone_key(id: &str) -> Option<String> {
    let user = id.strip_suffix(PHONE_DOMAIN)?;
    let base = user.split_once(':').map(|(b, _)| b).unwrap_or(user);
    let digits: String = base.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() { None } else { Some(digits) }
}

/// Rank used when a new equivalence between two identifiers is first
/// asserted: lower is more canonical.
fn canonical_rank(id: &str) -> u8 {
    match classify(id) {
        IdClass::Group => 0,
        IdClass::Phone { suffixed: false } => 1,
        IdClass::Phone { suffixed: true } => 2,
        IdClass::Linked => 3,
        IdClass::Broadcast | IdClass::Other => 4,
    }
}

/// Which of two equivalent identifiers becomes canonical.
/// Group beats phone-without-suffix beats phone-with-suffix beats linked;
/// remaining ties go to the shorter string.
pub fn preferred_canonical<'a>(a: &'a str, b: &'a str) -> &'a str {
    match canonical_rank(a).cmp(&canonical_rank(b)) {
        std::cmp::Ordering::Less => a,
        std::cmp::Ordering::Greater => b,
        std::cmp::Ordering::Equal => {
            if a.len() <= b.len() { a } else { b }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_shapes() {
        assert_eq!(classify("123@group"), IdClass::Group);
        assert_eq!(classify("4915550001@msg"), IdClass::Phone { suffixed: false });
        assert_eq!(classify("4915550001:12@msg"), IdClass::Phone { suffixed: true });
        assert_eq!(classify("a9f3c@linked"), IdClass::Linked);
        assert_eq!(classify("status@broadcast"), IdClass::Broadcast);
        assert_eq!(classify("whatever"), IdClass::Other);
    }

    #[test]
    fn suffix_stripping() {
        assert_eq!(strip_device_suffix("4915550001:3@msg"), "4915550001@msg");
        assert_eq!(strip_device_suffix("4915550001@msg"), "4915550001@msg");
        assert_eq!(strip_device_suffix("a9f3c@linked"), "a9f3c@linked");
    }

    #[test]
    fn phone_key() {
        assert_eq!(normalized_phone_key("4915550001:3@msg").as_deref(), Some("4915550001"));
        assert_eq!(normalized_phone_key("+49-1555-0001@msg").as_deref(), Some("4915550001"));
        assert_eq!(normalized_phone_key("abc@linked"), None);
    }

    #[test]
    fn tie_break_order() {
        assert_eq!(preferred_canonical("g@group", "1234@msg"), "g@group");
        assert_eq!(preferred_canonical("1234@msg", "1234:2@msg"), "1234@msg");
        assert_eq!(preferred_canonical("1234:2@msg", "abcdef@linked"), "1234:2@msg");
        // same rank: shorter string wins
        assert_eq!(preferred_canonical("12@msg", "1234@msg"), "12@msg");
    }
}
