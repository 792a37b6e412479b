//! Structured ID handling for tasks and epics.
//!
//! ID formats are part of the public contract:
//! - Task: `{ROLE3}-{PRIORITY1}-{NNNN}` (e.g., "ENG-H-0042")
//! - Epic: `EPC-{PRIORITY1}-{NNNN}` (e.g., "EPC-H-0001")
//!
//! `NNNN` is a zero-padded 4-digit sequence, allocated per prefix by the
//! storage layer's counter table. Numbers are never reused, even across
//! aborted entities.

use crate::models::{Priority, Role};
use crate::{Error, Result};

/// Reserved prefix for epic IDs.
pub const EPIC_PREFIX: &str = "EPC";

/// Highest sequence number a prefix can hold.
pub const MAX_SEQUENCE: u32 = 9999;

/// Format a task ID from its components.
pub fn format_task_id(role: Role, priority: Priority, number: u32) -> Result<String> {
    if number == 0 || number > MAX_SEQUENCE {
        return Err(Error::InvalidId(format!(
            "sequence number must be between 1 and {}, got {}",
            MAX_SEQUENCE, number
        )));
    }
    Ok(format!(
        "{}-{}-{:04}",
        role.prefix(),
        priority.code(),
        number
    ))
}

/// Format an epic ID from its components.
pub fn format_epic_id(priority: Priority, number: u32) -> Result<String> {
    if number == 0 || number > MAX_SEQUENCE {
        return Err(Error::InvalidId(format!(
            "sequence number must be between 1 and {}, got {}",
            MAX_SEQUENCE, number
        )));
    }
    Ok(format!("{}-{}-{:04}", EPIC_PREFIX, priority.code(), number))
}

/// The ID-allocation prefix for a task (e.g., "ENG-H").
pub fn task_prefix(role: Role, priority: Priority) -> String {
    format!("{}-{}", role.prefix(), priority.code())
}

/// The ID-allocation prefix for an epic (e.g., "EPC-H").
pub fn epic_prefix(priority: Priority) -> String {
    format!("{}-{}", EPIC_PREFIX, priority.code())
}

/// Split an ID of the shape `XXX-P-NNNN` into its raw pieces.
fn split_id(id: &str) -> Result<(&str, char, u32)> {
    let parts: Vec<&str> = id.split('-').collect();
    let &[prefix, code, number] = parts.as_slice() else {
        return Err(Error::InvalidId(format!(
            "expected PREFIX-PRIORITY-NUMBER (e.g., ENG-H-0001), got: {}",
            id
        )));
    };

    if prefix.len() != 3 || !prefix.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(Error::InvalidId(format!(
            "prefix must be 3 uppercase letters, got: {}",
            prefix
        )));
    }

    let mut code_chars = code.chars();
    let (Some(code_char), None) = (code_chars.next(), code_chars.next()) else {
        return Err(Error::InvalidId(format!(
            "priority code must be a single letter, got: {}",
            code
        )));
    };

    if number.len() != 4 || !number.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::InvalidId(format!(
            "sequence must be 4 digits, got: {}",
            number
        )));
    }
    let seq: u32 = number
        .parse()
        .map_err(|_| Error::InvalidId(format!("invalid sequence number: {}", number)))?;
    if seq == 0 {
        return Err(Error::InvalidId(format!(
            "sequence must be between 0001 and {}, got: {}",
            MAX_SEQUENCE, number
        )));
    }

    Ok((prefix, code_char, seq))
}

/// Parse a task ID into (role, priority, sequence).
pub fn parse_task_id(id: &str) -> Result<(Role, Priority, u32)> {
    let (prefix, code, seq) = split_id(id)?;
    if prefix == EPIC_PREFIX {
        return Err(Error::InvalidId(format!(
            "'{}' is an epic ID, not a task ID",
            id
        )));
    }
    let role = Role::from_prefix(prefix)
        .map_err(|_| Error::InvalidId(format!("unknown role prefix '{}' in: {}", prefix, id)))?;
    let priority = Priority::from_code(code)
        .map_err(|_| Error::InvalidId(format!("unknown priority code '{}' in: {}", code, id)))?;
    Ok((role, priority, seq))
}

/// Parse an epic ID into (priority, sequence).
pub fn parse_epic_id(id: &str) -> Result<(Priority, u32)> {
    let (prefix, code, seq) = split_id(id)?;
    if prefix != EPIC_PREFIX {
        return Err(Error::InvalidId(format!(
            "epic IDs start with '{}', got: {}",
            EPIC_PREFIX, id
        )));
    }
    let priority = Priority::from_code(code)
        .map_err(|_| Error::InvalidId(format!("unknown priority code '{}' in: {}", code, id)))?;
    Ok((priority, seq))
}

/// Validate a task ID without caring about its components.
pub fn validate_task_id(id: &str) -> Result<()> {
    parse_task_id(id).map(|_| ())
}

/// Validate an epic ID without caring about its components.
pub fn validate_epic_id(id: &str) -> Result<()> {
    parse_epic_id(id).map(|_| ())
}

/// Canonical sort key for task IDs: priority (CRITICAL first), then role
/// prefix, then sequence. IDs that fail to parse sort last.
pub fn task_sort_key(id: &str) -> (u8, String, u32) {
    match parse_task_id(id) {
        Ok((role, priority, seq)) => (priority.rank(), role.prefix().to_string(), seq),
        Err(_) => (u8::MAX, id.to_string(), u32::MAX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_task_id() {
        let id = format_task_id(Role::Engineer, Priority::High, 42).unwrap();
        assert_eq!(id, "ENG-H-0042");
        assert!(format_task_id(Role::Engineer, Priority::High, 0).is_err());
        assert!(format_task_id(Role::Engineer, Priority::High, 10_000).is_err());
    }

    #[test]
    fn test_format_epic_id() {
        assert_eq!(
            format_epic_id(Priority::Critical, 1).unwrap(),
            "EPC-C-0001"
        );
    }

    #[test]
    fn test_parse_task_id() {
        let (role, priority, seq) = parse_task_id("OPR-C-0007").unwrap();
        assert_eq!(role, Role::Operator);
        assert_eq!(priority, Priority::Critical);
        assert_eq!(seq, 7);
    }

    #[test]
    fn test_parse_task_id_rejects_bad_input() {
        assert!(parse_task_id("").is_err());
        assert!(parse_task_id("ENG-H-1").is_err());
        assert!(parse_task_id("ENG-H-00001").is_err());
        assert!(parse_task_id("eng-H-0001").is_err());
        assert!(parse_task_id("ZZZ-H-0001").is_err());
        assert!(parse_task_id("ENG-X-0001").is_err());
        assert!(parse_task_id("ENG-H-0000").is_err());
        // Epic IDs are not task IDs
        assert!(parse_task_id("EPC-H-0001").is_err());
    }

    #[test]
    fn test_parse_epic_id() {
        let (priority, seq) = parse_epic_id("EPC-M-0012").unwrap();
        assert_eq!(priority, Priority::Medium);
        assert_eq!(seq, 12);
        assert!(parse_epic_id("ENG-M-0012").is_err());
    }

    #[test]
    fn test_all_role_prefixes_round_trip() {
        for role in Role::all() {
            let id = format_task_id(*role, Priority::Low, 1).unwrap();
            let (parsed, _, _) = parse_task_id(&id).unwrap();
            assert_eq!(parsed, *role);
        }
    }

    #[test]
    fn test_task_sort_key_ordering() {
        let mut ids = vec!["ENG-L-0001", "ARC-C-0002", "ENG-C-0003", "TST-H-0001"];
        ids.sort_by_key(|id| task_sort_key(id));
        assert_eq!(ids, vec!["ARC-C-0002", "ENG-C-0003", "TST-H-0001", "ENG-L-0001"]);
    }
}
