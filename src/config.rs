//! Runtime configuration for an intercom endpoint.

use crate::constants::{REF_DELAY_DEFAULT_MS, REF_DELAY_MAX_MS, REF_DELAY_MIN_MS};
use crate::protocol::INTERCOM_PORT;

/// Endpoint configuration with conservative defaults. The persisted
/// settings record (volume, mic gain, auto-answer, AEC) overrides the
/// matching fields at startup when a stored record exists.
#[derive(Debug, Clone)]
pub struct IntercomConfig {
    /// TCP listen port. 0 picks an ephemeral port.
    pub port: u16,
    /// This endpoint's display name, sent as the `START` payload when
    /// dialing and excluded from the contact list.
    pub device_name: String,
    /// Answer incoming calls without ringing.
    pub auto_answer: bool,
    /// Auto-hangup for unanswered ringing or outgoing calls, in
    /// milliseconds. 0 disables the timeout.
    pub ringing_timeout_ms: u32,
    /// AEC reference delay. Clamped to 20..=100 ms; 80 ms suits separate
    /// mic/speaker DACs, 20-40 ms integrated codecs.
    pub ref_delay_ms: u32,
    /// Remove DC bias from the mic signal (needed for some MEMS mics).
    pub dc_offset_removal: bool,
    /// Initial mic gain in dB, -20..=20.
    pub mic_gain_db: f32,
    /// Initial output volume, 0..=1.
    pub volume: f32,
    /// Initial contact list.
    pub contacts: Vec<String>,
    /// Key under which settings are persisted.
    pub settings_key: String,
}

impl Default for IntercomConfig {
    fn default() -> Self {
        Self {
            port: INTERCOM_PORT,
            device_name: "Intercom".to_string(),
            auto_answer: true,
            ringing_timeout_ms: 0,
            ref_delay_ms: REF_DELAY_DEFAULT_MS,
            dc_offset_removal: false,
            mic_gain_db: 0.0,
            volume: 1.0,
            contacts: Vec::new(),
            settings_key: "intercom_settings".to_string(),
        }
    }
}

impl IntercomConfig {
    /// Clamp fields to their valid ranges.
    pub fn sanitized(mut self) -> Self {
        self.ref_delay_ms = self.ref_delay_ms.clamp(REF_DELAY_MIN_MS, REF_DELAY_MAX_MS);
        self.mic_gain_db = self.mic_gain_db.clamp(-20.0, 20.0);
        self.volume = self.volume.clamp(0.0, 1.0);
        self
    }
}

/// dB to linear gain.
pub fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}
