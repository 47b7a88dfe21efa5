use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;

/// Escapes `identifier` for use between backticks.
///
/// Empty identifiers and identifiers with control characters are rejected. `context` names
/// the identifier in the error detail.
pub fn sanitize_identifier(identifier: &str, context: &str) -> EtlResult<String> {
    if identifier.is_empty() {
        return Err(etl_error!(
            ErrorKind::DestinationTableNameInvalid,
            "Invalid warehouse identifier",
            format!("{context} cannot be empty")
        ));
    }

    if identifier.chars().any(char::is_control) {
        return Err(etl_error!(
            ErrorKind::DestinationTableNameInvalid,
            "Invalid warehouse identifier",
            format!("{context} `{}` contains control characters", identifier.escape_debug())
        ));
    }

    let mut escaped = String::with_capacity(identifier.len());
    for ch in identifier.chars() {
        match ch {
            '`' => escaped.push_str("\\`"),
            '\\' => escaped.push_str("\\\\"),
            _ => escaped.push(ch),
        }
    }

    Ok(escaped)
}

/// Sanitizes `identifier` and wraps it in backticks.
pub fn quote_identifier(identifier: &str, context: &str) -> EtlResult<String> {
    Ok(format!("`{}`", sanitize_identifier(identifier, context)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_identifier_escapes_backticks_and_backslashes() {
        assert_eq!(quote_identifier("orders", "table").unwrap(), "`orders`");
        assert_eq!(quote_identifier("we`ird\\", "column").unwrap(), "`we\\`ird\\\\`");
    }

    #[test]
    fn test_sanitize_identifier_rejects_empty_and_control_chars() {
        let err = sanitize_identifier("", "table").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DestinationTableNameInvalid);

        let err = sanitize_identifier("bad\nname", "column").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DestinationTableNameInvalid);
        assert!(err.detail().unwrap().contains("bad\\nname"));
    }
}
