//! Physical key encoding for topic co-location.
//!
//! Backends with no native topic concept store entries under
//! `{table.topic}.key`. The curly braces group the routing-hash input to the
//! table+topic pair so that all entries of one tenant in one table land on
//! the same cluster slot, which makes topic-scoped enumeration a single-node
//! pattern scan. The encoding is a storage convention other tooling may
//! parse, so it must stay stable.

/// Reserved table holding one unique-key counter entry per table.
pub const UNIQUE_KEY_TABLE: &str = "unique_key";

/// Reserved topic under which entries and notifications are grouped when
/// topic selectivity is off or the caller supplies no topic.
pub const SEND_ALL_TOPIC: &str = "all_topics";

/// Resolve an optional topic to its effective value.
pub fn effective_topic(topic: Option<&str>) -> &str {
    match topic {
        Some(t) if !t.is_empty() => t,
        _ => SEND_ALL_TOPIC,
    }
}

/// Encode the physical key for an entry: `{table.topic}.key`.
pub fn physical_key(table: &str, key: &str, topic: Option<&str>) -> String {
    format!("{{{}.{}}}.{}", table, effective_topic(topic), key)
}

/// Prefix shared by every entry of one table+topic pair: `{table.topic}.`.
///
/// Suffixing `*` yields the pattern for a topic-scoped scan.
pub fn table_prefix(table: &str, topic: Option<&str>) -> String {
    format!("{{{}.{}}}.", table, effective_topic(topic))
}

/// Extract the brace-grouped substring a cluster routes on.
///
/// For keys without a brace group the whole key is the hash input, matching
/// the slot-routing wire convention.
pub fn hashtag(physical: &str) -> &str {
    if let Some(open) = physical.find('{') {
        if let Some(close) = physical[open + 1..].find('}') {
            if close > 0 {
                return &physical[open + 1..open + 1 + close];
            }
        }
    }
    physical
}

/// Split a physical key back into `(table, topic, key)`.
///
/// Returns `None` for keys that do not follow the encoding.
pub fn split_physical(physical: &str) -> Option<(&str, &str, &str)> {
    let rest = physical.strip_prefix('{')?;
    let close = rest.find('}')?;
    let group = &rest[..close];
    let key = rest[close + 1..].strip_prefix('.')?;
    let dot = group.find('.')?;
    Some((&group[..dot], &group[dot + 1..], key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_with_topic() {
        assert_eq!(
            physical_key("lport", "p1", Some("tenant-a")),
            "{lport.tenant-a}.p1"
        );
    }

    #[test]
    fn encode_without_topic_uses_send_all() {
        assert_eq!(physical_key("lport", "p1", None), "{lport.all_topics}.p1");
        assert_eq!(physical_key("lport", "p1", Some("")), "{lport.all_topics}.p1");
    }

    #[test]
    fn prefix_matches_encoded_keys() {
        let prefix = table_prefix("lport", Some("tenant-a"));
        let key = physical_key("lport", "p1", Some("tenant-a"));
        assert!(key.starts_with(&prefix));
    }

    #[test]
    fn hashtag_extracts_group() {
        assert_eq!(hashtag("{lport.tenant-a}.p1"), "lport.tenant-a");
        // No group: whole key hashes.
        assert_eq!(hashtag("plainkey"), "plainkey");
        // Empty group is not a group.
        assert_eq!(hashtag("{}.p1"), "{}.p1");
    }

    #[test]
    fn split_round_trip() {
        let physical = physical_key("lrouter", "r1", Some("tenant-b"));
        let (table, topic, key) = split_physical(&physical).unwrap();
        assert_eq!(table, "lrouter");
        assert_eq!(topic, "tenant-b");
        assert_eq!(key, "r1");
    }

    #[test]
    fn split_rejects_foreign_keys() {
        assert!(split_physical("plainkey").is_none());
        assert!(split_physical("{nogroup.p1").is_none());
        assert!(split_physical("{nodot}.p1").is_none());
    }

    #[test]
    fn keys_with_dots_survive() {
        let physical = physical_key("chassis", "host.example.com", Some("t"));
        let (_, _, key) = split_physical(&physical).unwrap();
        assert_eq!(key, "host.example.com");
    }
}
