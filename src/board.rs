//! The non-channel host commands that touch hardware this crate keeps out
//! of scope (spec.md §1: "battery-voltage reads, firmware version/identification
//! messages", LED indicators). `BoardServices` is the seam a board binary
//! implements so the wire protocol (spec.md §6: READ_BATT, GET_FW_VERSION,
//! STATUS hello/goodbye) is complete without this crate owning an ADC driver
//! or a version string.

/// Out-of-scope board collaborator for the handful of host commands that
/// are not part of the channel subsystem.
pub trait BoardServices {
    /// Battery voltage in millivolts, for the READ_BATT reply.
    fn read_battery_millivolts(&mut self) -> u32;

    /// Firmware version string, for the GET_FW_VERSION reply. Bounded the
    /// same way a diagnostic LOG string is (see `framing::Framer::log`).
    fn firmware_version(&self) -> &str;

    /// Called once per STATUS "hello" (session start) and once per STATUS
    /// "goodbye" (session end, immediately before
    /// `ChannelRegistry::reset_all`), for any LED/indicator bring-up or
    /// teardown. Never fails: this is indication only, not protocol state.
    fn on_hello(&mut self) {}
    fn on_goodbye(&mut self) {}
}
