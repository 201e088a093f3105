//! Shell escaping and quoting utilities.

/// Escape a value for use inside single quotes.
/// Replaces `'` with `'\''` (end quote, escaped quote, start quote).
pub fn escape_single_quote_content(value: &str) -> String {
    value.replace('\'', "'\\''")
}

/// Quote a single argument for shell execution.
/// - Empty strings become `''`
/// - Strings with shell metacharacters are wrapped in single quotes
/// - Embedded single quotes are escaped
pub fn quote_arg(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }

    // Characters that require quoting
    const SHELL_META: &[char] = &[
        ' ', '\t', '\n', '\'', '"', '\\', '$', '`', '!', '*', '?', '[', ']', '(', ')', '{', '}',
        '<', '>', '|', '&', ';', '#', '~',
    ];

    if !arg.contains(SHELL_META) {
        return arg.to_string();
    }

    format!("'{}'", escape_single_quote_content(arg))
}

/// Quote a filesystem path for remote shell execution.
pub fn quote_path(path: &str) -> String {
    quote_arg(path)
}

/// Render `KEY="value"` prefixes for a remote command line, escaping embedded
/// double quotes. Order follows the input slice.
pub fn env_prefix(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| format!("{}=\"{}\"", key, value.replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_args_pass_through() {
        assert_eq!(quote_arg("abc-123"), "abc-123");
    }

    #[test]
    fn metacharacters_are_quoted() {
        assert_eq!(quote_arg("a b"), "'a b'");
        assert_eq!(quote_arg("it's"), "'it'\\''s'");
        assert_eq!(quote_arg(""), "''");
    }

    #[test]
    fn env_prefix_escapes_quotes() {
        let pairs = vec![("PATH".to_string(), "/opt/\"x\"/bin".to_string())];
        assert_eq!(env_prefix(&pairs), "PATH=\"/opt/\\\"x\\\"/bin\"");
    }
}
