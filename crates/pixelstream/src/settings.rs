use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;

/// Base streaming configuration handed to the remote engine.
///
/// `signalling_url` is the `ss` value the engine expects; the rest mirror
/// the player flags the engine honours at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    #[serde(rename = "ss")]
    pub signalling_url: String,
    pub auto_connect: bool,
    pub auto_play: bool,
    pub start_muted: bool,
    pub max_fps: Option<u32>,
    pub match_viewport_res: bool,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            signalling_url: String::new(),
            auto_connect: true,
            auto_play: true,
            start_muted: true,
            max_fps: Some(60),
            match_viewport_res: true,
        }
    }
}

/// Ephemeral debug layer. Any field left `None` falls through to the base
/// settings; a present field wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsOverrides {
    #[serde(rename = "ss")]
    pub signalling_url: Option<String>,
    pub auto_connect: Option<bool>,
    pub auto_play: Option<bool>,
    pub start_muted: Option<bool>,
    pub max_fps: Option<u32>,
    pub match_viewport_res: Option<bool>,
}

/// Persistent base + optional debug override layer.
#[derive(Debug, Clone, Default)]
pub struct SettingsStack {
    pub base: StreamSettings,
    pub overrides: Option<SettingsOverrides>,
}

impl SettingsStack {
    pub fn new(base: StreamSettings) -> Self {
        Self {
            base,
            overrides: None,
        }
    }

    /// Whether the debug override layer is active. Gates loopback connects.
    pub fn debug_active(&self) -> bool {
        self.overrides.is_some()
    }

    /// Compute the effective settings: base merged with overrides
    /// (override wins), with `match_viewport_res` pinned to true no matter
    /// what either layer says. Merging is idempotent.
    pub fn effective(&self) -> StreamSettings {
        let mut merged = self.base.clone();
        if let Some(overrides) = &self.overrides {
            if let Some(url) = &overrides.signalling_url {
                merged.signalling_url = url.clone();
            }
            if let Some(value) = overrides.auto_connect {
                merged.auto_connect = value;
            }
            if let Some(value) = overrides.auto_play {
                merged.auto_play = value;
            }
            if let Some(value) = overrides.start_muted {
                merged.start_muted = value;
            }
            if let Some(value) = overrides.max_fps {
                merged.max_fps = Some(value);
            }
            if let Some(value) = overrides.match_viewport_res {
                merged.match_viewport_res = value;
            }
        }
        merged.match_viewport_res = true;
        merged
    }
}

/// Shared live settings object. One per streaming session; the session,
/// the reconciliation tick, and UI consumers all read through this handle.
#[derive(Clone, Default)]
pub struct SettingsHandle {
    stack: Arc<Mutex<SettingsStack>>,
}

impl SettingsHandle {
    pub fn new(base: StreamSettings) -> Self {
        Self {
            stack: Arc::new(Mutex::new(SettingsStack::new(base))),
        }
    }

    pub fn effective(&self) -> StreamSettings {
        self.stack.lock().effective()
    }

    pub fn debug_active(&self) -> bool {
        self.stack.lock().debug_active()
    }

    pub fn set_overrides(&self, overrides: Option<SettingsOverrides>) {
        self.stack.lock().overrides = overrides;
    }

    pub fn update_base<F>(&self, apply: F)
    where
        F: FnOnce(&mut StreamSettings),
    {
        apply(&mut self.stack.lock().base);
    }

    /// Direct access for the viewport enforcement adapter. Nothing else
    /// should reach into the raw stack.
    pub(crate) fn with_stack<R>(&self, apply: impl FnOnce(&mut SettingsStack) -> R) -> R {
        apply(&mut self.stack.lock())
    }
}

/// Whether a signalling URL points at the local machine. Loopback targets
/// are refused unless the debug override layer is active, so a production
/// build cannot silently attach to a developer's local engine.
pub fn is_loopback_url(url: &Url) -> bool {
    match url.host_str() {
        Some(host) => {
            let host = host.trim_start_matches('[').trim_end_matches(']');
            host.eq_ignore_ascii_case("localhost") || host.starts_with("127.") || host == "::1"
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_defaults_pass_through() {
        let stack = SettingsStack::new(StreamSettings {
            signalling_url: "wss://stream.example/ws".into(),
            ..StreamSettings::default()
        });
        let effective = stack.effective();
        assert_eq!(effective.signalling_url, "wss://stream.example/ws");
        assert!(effective.auto_connect);
        assert!(effective.match_viewport_res);
    }

    #[test]
    fn overrides_win_over_base() {
        let mut stack = SettingsStack::new(StreamSettings {
            signalling_url: "wss://stream.example/ws".into(),
            max_fps: Some(60),
            ..StreamSettings::default()
        });
        stack.overrides = Some(SettingsOverrides {
            signalling_url: Some("ws://127.0.0.1:8888/ws".into()),
            max_fps: Some(30),
            ..SettingsOverrides::default()
        });
        let effective = stack.effective();
        assert_eq!(effective.signalling_url, "ws://127.0.0.1:8888/ws");
        assert_eq!(effective.max_fps, Some(30));
    }

    #[test]
    fn merge_is_idempotent() {
        let mut stack = SettingsStack::new(StreamSettings::default());
        stack.overrides = Some(SettingsOverrides {
            auto_play: Some(false),
            start_muted: Some(false),
            ..SettingsOverrides::default()
        });
        let once = stack.effective();
        let twice = SettingsStack {
            base: once.clone(),
            overrides: stack.overrides.clone(),
        }
        .effective();
        assert_eq!(once, twice);
    }

    #[test]
    fn viewport_match_is_pinned_regardless_of_input() {
        let mut stack = SettingsStack::new(StreamSettings {
            match_viewport_res: false,
            ..StreamSettings::default()
        });
        assert!(stack.effective().match_viewport_res);

        stack.overrides = Some(SettingsOverrides {
            match_viewport_res: Some(false),
            ..SettingsOverrides::default()
        });
        assert!(stack.effective().match_viewport_res);
    }

    #[test]
    fn debug_active_tracks_override_layer() {
        let handle = SettingsHandle::new(StreamSettings::default());
        assert!(!handle.debug_active());
        handle.set_overrides(Some(SettingsOverrides::default()));
        assert!(handle.debug_active());
        handle.set_overrides(None);
        assert!(!handle.debug_active());
    }

    #[test]
    fn loopback_urls_are_classified() {
        for raw in [
            "ws://localhost/ws",
            "ws://localhost:8888/ws",
            "ws://127.0.0.1/ws",
            "wss://127.0.0.1:443/ws",
            "ws://[::1]:9999/ws",
        ] {
            let url = Url::parse(raw).unwrap();
            assert!(is_loopback_url(&url), "{raw} should be loopback");
        }
        for raw in ["wss://1.2.3.4/ws", "wss://stream.example/ws"] {
            let url = Url::parse(raw).unwrap();
            assert!(!is_loopback_url(&url), "{raw} should not be loopback");
        }
    }
}
