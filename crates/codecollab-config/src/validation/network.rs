//! Validation for the `[heartbeat]` and `[store]` sections.

use crate::schema::CodeCollabConfig;

use super::helpers::validate_range;

pub(crate) fn validate_heartbeat(errors: &mut Vec<String>, config: &CodeCollabConfig) {
    let hb = &config.heartbeat;
    validate_range(errors, "heartbeat.interval_secs", hb.interval_secs, 1, 300);
    if hb.stale_after_secs <= hb.interval_secs {
        errors.push(format!(
            "heartbeat.stale_after_secs = {} must exceed heartbeat.interval_secs = {}",
            hb.stale_after_secs, hb.interval_secs
        ));
    }
}

pub(crate) fn validate_store(errors: &mut Vec<String>, config: &CodeCollabConfig) {
    let store = &config.store;
    if !(store.url.starts_with("ws://") || store.url.starts_with("wss://")) {
        errors.push(format!("store.url '{}' must use ws:// or wss://", store.url));
    }
    validate_range(
        errors,
        "store.reconnect_delay_secs",
        store.reconnect_delay_secs,
        1,
        60,
    );
    if store.max_reconnect_delay_secs < store.reconnect_delay_secs {
        errors.push(format!(
            "store.max_reconnect_delay_secs = {} is below store.reconnect_delay_secs = {}",
            store.max_reconnect_delay_secs, store.reconnect_delay_secs
        ));
    }
    validate_range(errors, "store.ping_interval_secs", store.ping_interval_secs, 1, 300);
    validate_range(
        errors,
        "store.request_timeout_secs",
        store.request_timeout_secs,
        1,
        120,
    );
}
