//! User-facing configuration, mirroring the option table in the external
//! interfaces section: every field is optional in spirit (callers get
//! [`Default`]) and is read once at construction, then held behind a lock so
//! it can be live-updated the way the teacher's `SchedulerConfig`/`CdpConfig`
//! are.

use serde::{Deserialize, Serialize};

/// Class names and timing used for an optional fragment-swap transition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransitionConfig {
    pub class: String,
    pub duration_ms: u64,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            class: "spf-transition".to_string(),
            duration_ms: 0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpfConfig {
    /// `__type__` inside this string is substituted with the request kind
    /// (`navigate`/`prefetch`/`load`) before being appended to every URL.
    pub url_identifier: String,
    pub link_class: String,
    pub nolink_class: String,

    pub cache_lifetime_ms: u64,
    pub cache_max: usize,
    pub cache_unified: bool,
    /// Mirrors the cache into the snapshot store so it survives a restart,
    /// the way the source keeps its cache warm in `sessionStorage`.
    pub cache_session_storage: bool,

    /// Caps the number of successful SPF navigations within
    /// `navigate_lifetime_ms`; once reached, navigations fall back to a
    /// full-page load. `None` means unbounded.
    pub navigate_limit: Option<u32>,
    pub navigate_lifetime_ms: u64,

    pub prefetch_on_mousedown: bool,
    pub process_async: bool,
    pub request_timeout_ms: u64,
    pub multipart_delimiter: String,

    pub transition: TransitionConfig,

    /// Restricts `navigate` to same-origin targets when set.
    pub origin: Option<String>,
}

impl Default for SpfConfig {
    fn default() -> Self {
        Self {
            url_identifier: "?spf=__type__".to_string(),
            link_class: "spf-link".to_string(),
            nolink_class: "spf-nolink".to_string(),
            cache_lifetime_ms: 600_000,
            cache_max: 50,
            cache_unified: false,
            cache_session_storage: false,
            navigate_limit: None,
            navigate_lifetime_ms: 30 * 60 * 1000,
            prefetch_on_mousedown: false,
            process_async: false,
            request_timeout_ms: 8_000,
            multipart_delimiter: "\r\n".to_string(),
            transition: TransitionConfig::default(),
            origin: None,
        }
    }
}
