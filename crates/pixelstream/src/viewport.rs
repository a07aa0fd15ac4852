use crate::settings::SettingsHandle;

/// Re-pin the viewport-matching flag on the live settings object.
///
/// The remote engine's player layer is known to flip this flag back off on
/// its own during resolution renegotiation, so the session re-asserts it on
/// a short interval for as long as a transport exists. This function is the
/// only place that writes the flag outside the merge itself; returns true
/// when a correction was actually applied.
pub fn enforce_viewport_match(settings: &SettingsHandle) -> bool {
    settings.with_stack(|stack| {
        let mut corrected = false;
        if !stack.base.match_viewport_res {
            stack.base.match_viewport_res = true;
            corrected = true;
        }
        if let Some(overrides) = stack.overrides.as_mut() {
            if overrides.match_viewport_res == Some(false) {
                overrides.match_viewport_res = Some(true);
                corrected = true;
            }
        }
        corrected
    })
}
