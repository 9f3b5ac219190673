use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;

static KEY_PARAM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(key|api_key)=([^&]+)").expect("key parameter pattern")
});

/// Mask `key=`/`api_key=` values so credentials never reach the logs.
pub fn redact_query(url: &str) -> Cow<'_, str> {
    KEY_PARAM.replace_all(url, "${1}=[REDACTED]")
}
