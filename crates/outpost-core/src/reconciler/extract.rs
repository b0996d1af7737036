//! Resolving a task-state event back to its dispatch id.
//!
//! The runner embeds the id redundantly; extraction tries each carrier in
//! a fixed order and only then does the caller fall back to the task-ARN
//! index lookup.

use uuid::Uuid;

use crate::platform::types::TaskStateEvent;

/// Extract the dispatch id embedded in an event, if any.
///
/// Order: container-override env var `DISPATCH_ID`, task group
/// (`dispatch:{uuid}` or any embedded UUID), a `dispatch_id`-style tag,
/// then a UUID embedded in `started_by`.
pub fn dispatch_id_from_event(event: &TaskStateEvent) -> Option<Uuid> {
    if let Some(overrides) = &event.overrides {
        for container in &overrides.container_overrides {
            for pair in &container.environment {
                if pair.name == "DISPATCH_ID" {
                    if let Ok(id) = Uuid::parse_str(pair.value.trim()) {
                        return Some(id);
                    }
                }
            }
        }
    }

    if let Some(group) = &event.group {
        if let Some(rest) = group.strip_prefix("dispatch:") {
            if let Ok(id) = Uuid::parse_str(rest.trim()) {
                return Some(id);
            }
        }
        if let Some(id) = find_embedded_uuid(group) {
            return Some(id);
        }
    }

    for tag in &event.tags {
        if matches!(tag.key.as_str(), "dispatch_id" | "dispatchId" | "DISPATCH_ID") {
            if let Ok(id) = Uuid::parse_str(tag.value.trim()) {
                return Some(id);
            }
        }
    }

    if let Some(started_by) = &event.started_by {
        if let Some(id) = find_embedded_uuid(started_by) {
            return Some(id);
        }
    }

    None
}

/// Scan a string for the first embedded hyphenated UUID.
fn find_embedded_uuid(s: &str) -> Option<Uuid> {
    const UUID_LEN: usize = 36;
    let bytes = s.as_bytes();
    if bytes.len() < UUID_LEN {
        return None;
    }
    for start in 0..=bytes.len() - UUID_LEN {
        // UUIDs are pure ASCII, so any candidate window that crosses a
        // multi-byte character cannot parse; skip those slices safely.
        let Some(candidate) = s.get(start..start + UUID_LEN) else {
            continue;
        };
        if let Ok(id) = Uuid::parse_str(candidate) {
            return Some(id);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::types::{ContainerOverride, EnvPair, TaskOverrides, TaskTag};

    fn id() -> Uuid {
        Uuid::parse_str("0a361a70-71c1-4b5c-9d96-c7a3806ecb63").unwrap()
    }

    #[test]
    fn env_var_wins() {
        let event = TaskStateEvent {
            overrides: Some(TaskOverrides {
                container_overrides: vec![ContainerOverride {
                    name: Some("worker".to_string()),
                    environment: vec![EnvPair {
                        name: "DISPATCH_ID".to_string(),
                        value: id().to_string(),
                    }],
                }],
            }),
            group: Some("dispatch:ffffffff-ffff-ffff-ffff-ffffffffffff".to_string()),
            ..Default::default()
        };
        assert_eq!(dispatch_id_from_event(&event), Some(id()));
    }

    #[test]
    fn group_prefix_form() {
        let event = TaskStateEvent {
            group: Some(format!("dispatch:{}", id())),
            ..Default::default()
        };
        assert_eq!(dispatch_id_from_event(&event), Some(id()));
    }

    #[test]
    fn group_embedded_uuid() {
        let event = TaskStateEvent {
            group: Some(format!("family:outpost-agent-claude-{}", id())),
            ..Default::default()
        };
        assert_eq!(dispatch_id_from_event(&event), Some(id()));
    }

    #[test]
    fn tag_key_variants() {
        for key in ["dispatch_id", "dispatchId", "DISPATCH_ID"] {
            let event = TaskStateEvent {
                tags: vec![TaskTag {
                    key: key.to_string(),
                    value: id().to_string(),
                }],
                ..Default::default()
            };
            assert_eq!(dispatch_id_from_event(&event), Some(id()), "key: {key}");
        }
    }

    #[test]
    fn started_by_embedded_uuid() {
        let event = TaskStateEvent {
            started_by: Some(format!("outpost:{}", id())),
            ..Default::default()
        };
        assert_eq!(dispatch_id_from_event(&event), Some(id()));
    }

    #[test]
    fn no_carrier_yields_none() {
        let event = TaskStateEvent {
            group: Some("service:web".to_string()),
            started_by: Some("deployer".to_string()),
            ..Default::default()
        };
        assert_eq!(dispatch_id_from_event(&event), None);
    }

    #[test]
    fn embedded_uuid_survives_multibyte_neighbors() {
        let s = format!("émis-par-{}-fin", id());
        assert_eq!(find_embedded_uuid(&s), Some(id()));
    }
}
