//! Validation for the `[voice]` section.

use crate::schema::CodeCollabConfig;

use super::helpers::validate_range;

pub(crate) fn validate_voice(errors: &mut Vec<String>, config: &CodeCollabConfig) {
    let voice = &config.voice;

    validate_range(
        errors,
        "voice.speaking_threshold",
        u64::from(voice.speaking_threshold),
        1,
        255,
    );
    validate_range(errors, "voice.fft_size", u64::from(voice.fft_size), 32, 32768);
    if !voice.fft_size.is_power_of_two() {
        errors.push(format!(
            "voice.fft_size = {} must be a power of two",
            voice.fft_size
        ));
    }
    validate_range(errors, "voice.frame_interval_ms", voice.frame_interval_ms, 4, 1000);
    validate_range(errors, "voice.close_grace_ms", voice.close_grace_ms, 0, 30_000);
    validate_range(
        errors,
        "voice.negotiation_timeout_secs",
        voice.negotiation_timeout_secs,
        0,
        600,
    );
    validate_range(errors, "voice.max_peers", voice.max_peers as u64, 1, 32);

    for server in &voice.ice_servers {
        let known = ["stun:", "stuns:", "turn:", "turns:"]
            .iter()
            .any(|scheme| server.starts_with(scheme));
        if !known {
            errors.push(format!("voice.ice_servers entry '{server}' has an unknown scheme"));
        }
    }
}
