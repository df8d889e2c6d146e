//! Input validation for text crossing the bridge and for command arguments.

/// Validation failures with operator-readable reasons
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Message text is empty")]
    Empty,

    #[error("Message text is too long ({len} characters, maximum {max})")]
    TooLong { len: usize, max: usize },

    #[error("Message text contains control characters: {chars}")]
    ControlCharacters { chars: String },

    #[error("Invalid node id '{id}': {reason}")]
    InvalidNodeId { id: String, reason: &'static str },

    #[error("Search query must be between 1 and {max} characters")]
    InvalidQuery { max: usize },
}

/// Longest accepted search pattern
pub const MAX_QUERY_LEN: usize = 64;

/// Validate message text before it is persisted or sent to the mesh.
///
/// Length is counted in characters (not bytes) against `max_chars`. Text is
/// never truncated here; oversize text is rejected with its actual length so
/// the caller can tell the user how much to cut. Newlines and tabs are the
/// only control characters accepted.
pub fn validate_message_text(text: &str, max_chars: usize) -> Result<&str, ValidationError> {
    if text.trim().is_empty() {
        return Err(ValidationError::Empty);
    }

    let controls: Vec<String> = text
        .chars()
        .filter(|c| c.is_control() && *c != '\n' && *c != '\t')
        .map(|c| format!("\\u{{{:04x}}}", c as u32))
        .collect();
    if !controls.is_empty() {
        return Err(ValidationError::ControlCharacters {
            chars: controls.join(", "),
        });
    }

    let len = text.chars().count();
    if len > max_chars {
        return Err(ValidationError::TooLong { len, max: max_chars });
    }
    Ok(text)
}

/// Validate a mesh node id in either `!hex8` or bare decimal form.
pub fn validate_node_id(id: &str) -> Result<&str, ValidationError> {
    let invalid = |reason| ValidationError::InvalidNodeId {
        id: id.to_string(),
        reason,
    };
    if let Some(hex) = id.strip_prefix('!') {
        if hex.is_empty() || hex.len() > 8 {
            return Err(invalid("expected 1 to 8 hex digits after '!'"));
        }
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid("non-hex digit"));
        }
        return Ok(id);
    }
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) && id.parse::<u32>().is_ok() {
        return Ok(id);
    }
    Err(invalid("expected !hex or decimal node number"))
}

/// Canonical `!xxxxxxxx` form of a node id accepted by [`validate_node_id`].
pub fn normalize_node_id(id: &str) -> Result<String, ValidationError> {
    let id = validate_node_id(id.trim())?;
    let num = match id.strip_prefix('!') {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => id.parse::<u32>(),
    };
    num.map(node_id_from_num).map_err(|_| ValidationError::InvalidNodeId {
        id: id.to_string(),
        reason: "out of range",
    })
}

/// Trim and length-check a free text search pattern.
pub fn validate_search_query(query: &str) -> Result<&str, ValidationError> {
    let trimmed = query.trim();
    if trimmed.is_empty() || trimmed.chars().count() > MAX_QUERY_LEN {
        return Err(ValidationError::InvalidQuery { max: MAX_QUERY_LEN });
    }
    Ok(trimmed)
}

/// Canonical `!xxxxxxxx` form of a numeric node number.
pub fn node_id_from_num(num: u32) -> String {
    format!("!{:08x}", num)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_text_validation() {
        assert!(validate_message_text("hello mesh", 225).is_ok());
        assert!(validate_message_text("line1\nline2\tok", 225).is_ok());
        assert_eq!(validate_message_text("   ", 225), Err(ValidationError::Empty));

        match validate_message_text("bad\u{7}bell", 225) {
            Err(ValidationError::ControlCharacters { chars }) => assert_eq!(chars, "\\u{0007}"),
            other => panic!("unexpected {:?}", other),
        }

        let long = "a".repeat(226);
        assert_eq!(
            validate_message_text(&long, 225),
            Err(ValidationError::TooLong { len: 226, max: 225 })
        );
        // Counted in characters, not bytes
        let wide = "é".repeat(225);
        assert!(validate_message_text(&wide, 225).is_ok());
    }

    #[test]
    fn test_node_id_validation() {
        assert!(validate_node_id("!a1b2c3d4").is_ok());
        assert!(validate_node_id("42").is_ok());
        assert!(validate_node_id("!").is_err());
        assert!(validate_node_id("!zzzz").is_err());
        assert!(validate_node_id("!123456789").is_err());
        assert!(validate_node_id("node42").is_err());
        assert!(validate_node_id("99999999999").is_err());
    }

    #[test]
    fn test_search_query_validation() {
        assert_eq!(validate_search_query("  hello ").unwrap(), "hello");
        assert!(validate_search_query("").is_err());
        assert!(validate_search_query(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_node_id_from_num() {
        assert_eq!(node_id_from_num(42), "!0000002a");
        assert_eq!(node_id_from_num(0xdeadbeef), "!deadbeef");
    }

    #[test]
    fn test_normalize_node_id() {
        assert_eq!(normalize_node_id("42").unwrap(), "!0000002a");
        assert_eq!(normalize_node_id(" !2A ").unwrap(), "!0000002a");
        assert!(normalize_node_id("!xyz").is_err());
    }
}
