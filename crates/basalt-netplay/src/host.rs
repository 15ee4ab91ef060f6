//! Callback surface into the hosting application.

use crate::constants::MAX_PLAYERS;

/// Settings forced on every peer for the lifetime of a session. Applied
/// through [`HostInterface::set_settings_overlay`] on start and cleared on
/// teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Only digital pads are supported over netplay.
    pub digital_controllers: [bool; MAX_PLAYERS],
    pub runahead_frame_count: u32,
    pub rewind_enable: bool,
    pub recompiler_block_linking: bool,
    pub software_renderer_readbacks: bool,
}

impl SessionSettings {
    pub fn for_netplay() -> Self {
        Self {
            digital_controllers: [true; MAX_PLAYERS],
            runahead_frame_count: 0,
            rewind_enable: false,
            recompiler_block_linking: false,
            software_renderer_readbacks: true,
        }
    }
}

pub trait HostInterface {
    /// Chat lines, join/leave notices, desync warnings.
    fn on_netplay_message(&mut self, text: &str);

    /// Blocking-phase feedback; `progress` is `(done, total)` while
    /// resynchronizing.
    fn display_loading_screen(&mut self, text: &str, progress: Option<(u32, u32)>);

    /// Give the host a chance to run its message loop. Returning `false`
    /// requests a session shutdown.
    fn pump_messages(&mut self) -> bool;

    /// Fatal, user-visible failures.
    fn report_error(&mut self, title: &str, message: &str);

    /// Install or clear the forced netplay settings layer.
    fn set_settings_overlay(&mut self, overlay: Option<SessionSettings>);
}
