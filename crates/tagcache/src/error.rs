use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by cache configuration, validation, and persistence.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache store is already configured for this process")]
    AlreadyConfigured,

    #[error("cache root {path} exists but is not a directory")]
    RootNotADirectory { path: PathBuf },

    #[error("invalid {kind} {name:?}: only ASCII letters, digits, and `-_.@` are allowed")]
    InvalidName { kind: &'static str, name: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("json error: {message}")]
    Json { message: String },

    #[error("producer failed: {message}")]
    Producer { message: String },
}

impl CacheError {
    /// Wrap an arbitrary producer failure.
    pub fn producer(err: impl std::fmt::Display) -> Self {
        Self::Producer {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        // `serde_json::Error` display strings can include scalar values from the
        // payload being decoded (e.g. `invalid type: string "..."`). Cached
        // payloads are caller data; redact quoted substrings instead of echoing
        // them.
        Self::Json {
            message: redact_quoted(&err.to_string()),
        }
    }
}

fn redact_quoted(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut rest = message;
    while let Some(start) = rest.find('"') {
        out.push_str(&rest[..=start]);
        rest = &rest[start + 1..];
        match find_closing_quote(rest) {
            Some(end) => {
                out.push_str("<redacted>\"");
                rest = &rest[end + 1..];
            }
            None => {
                // Unterminated quote: redact the remainder and stop.
                out.push_str("<redacted>");
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn find_closing_quote(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    for (idx, &b) in bytes.iter().enumerate() {
        if b != b'"' {
            continue;
        }

        // Quotes preceded by an odd number of backslashes are escaped.
        let mut backslashes = 0_usize;
        let mut k = idx;
        while k > 0 && bytes[k - 1] == b'\\' {
            backslashes += 1;
            k -= 1;
        }
        if backslashes % 2 == 0 {
            return Some(idx);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_errors_do_not_echo_string_values() {
        let secret = "tagcache-super-secret-value";
        let err = serde_json::from_value::<bool>(serde_json::json!(secret))
            .expect_err("expected type error");

        let message = CacheError::from(err).to_string();
        assert!(
            !message.contains(secret),
            "json error message should omit string values: {message}"
        );
        assert!(
            message.contains("<redacted>"),
            "json error message should include redaction marker: {message}"
        );
    }

    #[test]
    fn redaction_handles_escaped_quotes() {
        let redacted = redact_quoted(r#"found "a \"quoted\" value" here"#);
        assert_eq!(redacted, r#"found "<redacted>" here"#);
    }
}
