//! Text-map carrier over transport headers.
//!
//! Tracer state travels inside the call's transport headers under the
//! reserved `$tracing$` prefix, shared by every TChannel implementation.
//! The carrier prepends the prefix on writes and filters by it on reads,
//! so the tracer itself never sees the prefix and user headers never see
//! tracer state.

use std::collections::HashMap;

use super::tracer::{TextMapReader, TextMapWriter};

/// Reserved header key prefix owned by the tracer.
pub const TRACING_KEY_PREFIX: &str = "$tracing$";

/// Carrier that scopes a tracer's reads and writes to the reserved prefix.
pub struct PrefixedHeadersCarrier<'a> {
    headers: &'a mut HashMap<String, String>,
}

impl<'a> PrefixedHeadersCarrier<'a> {
    /// Wrap a header map.
    pub fn new(headers: &'a mut HashMap<String, String>) -> Self {
        Self { headers }
    }

    /// The headers the tracer does not own.
    pub fn non_tracing_headers(&self) -> HashMap<String, String> {
        self.headers
            .iter()
            .filter(|(key, _)| !key.starts_with(TRACING_KEY_PREFIX))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

impl TextMapWriter for PrefixedHeadersCarrier<'_> {
    fn put(&mut self, key: &str, value: &str) {
        self.headers
            .insert(format!("{TRACING_KEY_PREFIX}{key}"), value.to_string());
    }
}

impl TextMapReader for PrefixedHeadersCarrier<'_> {
    fn entries(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(TRACING_KEY_PREFIX)
                    .map(|stripped| (stripped.to_string(), value.clone()))
            })
            .collect()
    }
}

/// Remove every tracer-owned header from the map.
pub fn strip_tracing_headers(headers: &mut HashMap<String, String>) {
    headers.retain(|key, _| !key.starts_with(TRACING_KEY_PREFIX));
}
