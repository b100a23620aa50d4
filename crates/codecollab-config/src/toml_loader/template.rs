//! Default TOML config template with inline documentation comments.

/// Generate the default TOML config content with comments.
pub(crate) fn default_config_toml() -> String {
    r##"# CodeCollab Configuration
# Schema version 1
# Only override what you want to change -- missing fields use defaults.

[voice]
# enabled = true
# speaking_threshold = 20        # 1-255, average bin energy
# fft_size = 512                 # power of two, 32-32768
# frame_interval_ms = 16         # 4-1000
# close_grace_ms = 1500          # 0-30000
# negotiation_timeout_secs = 20  # 0 disables
# max_peers = 8                  # 1-32
# start_muted = false
# ice_servers = ["stun:stun.l.google.com:19302"]

[voice.capture]
# echo_cancellation = true
# noise_suppression = true
# auto_gain_control = true

[heartbeat]
# interval_secs = 5              # 1-300
# stale_after_secs = 15          # must exceed interval_secs

[store]
# url = "ws://127.0.0.1:8787"
# reconnect_delay_secs = 1
# max_reconnect_delay_secs = 30
# ping_interval_secs = 25
# request_timeout_secs = 10

[logging]
# level = "info"                 # trace, debug, info, warn, error
"##
    .to_string()
}
