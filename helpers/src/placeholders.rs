/// Returns true if `value` holds at least one `{...}` placeholder
/// that can be resolved at request time.
///
/// A lone `{` with no closing brace after it is not a placeholder.
pub fn contains_placeholder(value: &str) -> bool {
    match (value.find('{'), value.find('}')) {
        (Some(open), Some(close)) => open < close,
        _ => false,
    }
}

/// Placeholder values derived from a single in-flight request.
///
/// Supported keys:
/// - `host` — the request host with any port stripped.
/// - `port` — the server port the request arrived on.
/// - `host.labels.N` — the Nth DNS label of the host, indexed from the
///   right (`host.labels.0` is the TLD for `app1.example.com`).
#[derive(Debug, Clone)]
pub struct RequestPlaceholders {
    host: String,
    port: Option<u16>,
}

impl RequestPlaceholders {
    pub fn new(host: &str, port: Option<u16>) -> Self {
        // Hosts may arrive as `name:port`, keep only the name part.
        let host = host
            .rsplit_once(':')
            .map(|(name, maybe_port)| {
                if maybe_port.chars().all(|c| c.is_ascii_digit()) {
                    name
                } else {
                    host
                }
            })
            .unwrap_or(host);
        RequestPlaceholders {
            host: host.to_string(),
            port,
        }
    }

    fn resolve(&self, key: &str) -> Option<String> {
        if key == "host" {
            return Some(self.host.clone());
        }
        if key == "port" {
            return self.port.map(|port| port.to_string());
        }
        if let Some(index) = key.strip_prefix("host.labels.") {
            let index: usize = index.parse().ok()?;
            let labels: Vec<&str> = self.host.split('.').collect();
            // Labels are indexed from the right, matching DNS convention
            // where label 0 is the top-level domain.
            if index < labels.len() {
                return Some(labels[labels.len() - 1 - index].to_string());
            }
            return None;
        }
        None
    }

    /// Substitutes every `{key}` placeholder in `input`.
    ///
    /// Unknown keys substitute as the empty string so the result is always
    /// fully resolved; text outside braces and unterminated braces pass
    /// through untouched.
    pub fn replace_all(&self, input: &str) -> String {
        let mut result = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(open) = rest.find('{') {
            let Some(close) = rest[open..].find('}') else {
                break;
            };
            result.push_str(&rest[..open]);
            let key = &rest[open + 1..open + close];
            if let Some(value) = self.resolve(key) {
                result.push_str(&value);
            }
            rest = &rest[open + close + 1..];
        }
        result.push_str(rest);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_detects_placeholders() {
        assert!(contains_placeholder("{x}"));
        assert!(contains_placeholder("{host.labels.2}:app"));
        assert!(!contains_placeholder("abc"));
        assert!(!contains_placeholder("{"));
        assert!(!contains_placeholder("}{"));
    }

    #[test]
    fn test_resolves_host_and_port() {
        let placeholders = RequestPlaceholders::new("app1.example.com:8443", Some(8443));
        assert_eq!(placeholders.replace_all("{host}"), "app1.example.com");
        assert_eq!(placeholders.replace_all("{port}"), "8443");
    }

    #[test]
    fn test_resolves_host_labels_from_the_right() {
        let placeholders = RequestPlaceholders::new("app1.example.com", None);
        assert_eq!(placeholders.replace_all("{host.labels.0}"), "com");
        assert_eq!(placeholders.replace_all("{host.labels.1}"), "example");
        assert_eq!(placeholders.replace_all("{host.labels.2}"), "app1");
        assert_eq!(
            placeholders.replace_all("{host.labels.2}:app"),
            "app1:app"
        );
    }

    #[test]
    fn test_unknown_keys_substitute_as_empty() {
        let placeholders = RequestPlaceholders::new("example.com", None);
        assert_eq!(placeholders.replace_all("a{unknown}b"), "ab");
        assert_eq!(placeholders.replace_all("{host.labels.9}"), "");
    }

    #[test]
    fn test_unterminated_braces_pass_through() {
        let placeholders = RequestPlaceholders::new("example.com", None);
        assert_eq!(placeholders.replace_all("plain"), "plain");
        assert_eq!(placeholders.replace_all("open{brace"), "open{brace");
    }
}
