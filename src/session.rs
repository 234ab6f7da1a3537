//! Session and settings documents written by the desktop shell.
//!
//! The session file holds the desired wallpaper state, the settings file
//! optionally overrides the colour scheme used for theme generation.

use crate::error::ParseError;
use serde::de::Error as _;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WallpaperMode {
    Single,
    PerMonitor,
}

/// Typed snapshot of the session document.
///
/// Colour specifiers are already stripped: every path left here is a
/// candidate image file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WallpaperState {
    pub mode: WallpaperMode,
    pub single_path: Option<String>,
    pub per_monitor_paths: BTreeMap<String, String>,
    pub is_light_mode: bool,
}

impl WallpaperState {
    pub fn single(path: impl Into<String>) -> Self {
        Self {
            mode: WallpaperMode::Single,
            single_path: Some(path.into()),
            per_monitor_paths: BTreeMap::new(),
            is_light_mode: false,
        }
    }

    /// No image left after colour filtering.
    pub fn is_empty(&self) -> bool {
        match self.mode {
            WallpaperMode::Single => self.single_path.is_none(),
            WallpaperMode::PerMonitor => {
                self.single_path.is_none() && self.per_monitor_paths.is_empty()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct SessionDocument {
    #[serde(rename = "wallpaperPath", default)]
    wallpaper_path: Option<String>,

    #[serde(rename = "perMonitorWallpaper", default)]
    per_monitor_wallpaper: Option<bool>,

    #[serde(rename = "monitorWallpapers", default)]
    monitor_wallpapers: Option<BTreeMap<String, Option<String>>>,

    #[serde(rename = "isLightMode", default)]
    is_light_mode: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct SettingsDocument {
    #[serde(rename = "matugenScheme", default)]
    matugen_scheme: Option<String>,
}

/// A value the shell stores for solid-colour backgrounds instead of a file.
pub fn is_color_spec(value: &str) -> bool {
    let value = value.trim();
    value.starts_with('#') || value.starts_with("/#")
}

fn image_path(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .filter(|v| !is_color_spec(v))
}

pub fn parse_state(bytes: &[u8]) -> Result<WallpaperState, ParseError> {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ParseError::Empty);
    }

    // Derived structs also accept a JSON array, so check the shape first.
    let doc = match serde_json::from_slice::<Value>(bytes)? {
        doc @ Value::Object(_) => SessionDocument::deserialize(doc)?,
        _ => return Err(serde_json::Error::custom("expected a JSON object at the top level").into()),
    };

    let wallpaper_path = doc
        .wallpaper_path
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty());
    let monitor_wallpapers: BTreeMap<String, String> = doc
        .monitor_wallpapers
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(name, path)| {
            let path = path?.trim().to_string();
            (!path.is_empty()).then_some((name, path))
        })
        .collect();

    let mode = if doc.per_monitor_wallpaper.unwrap_or(false) {
        WallpaperMode::PerMonitor
    } else {
        WallpaperMode::Single
    };

    // Structural checks run before colour filtering: a colour is a valid
    // setting, it just is not an image.
    match mode {
        WallpaperMode::Single if wallpaper_path.is_none() => {
            return Err(ParseError::MissingField("wallpaperPath"));
        }
        WallpaperMode::PerMonitor if monitor_wallpapers.is_empty() && wallpaper_path.is_none() => {
            return Err(ParseError::NoMonitorWallpapers);
        }
        _ => {}
    }

    let per_monitor_paths = match mode {
        WallpaperMode::Single => BTreeMap::new(),
        WallpaperMode::PerMonitor => monitor_wallpapers
            .into_iter()
            .filter(|(name, path)| {
                let keep = !is_color_spec(path);
                if !keep {
                    debug!("Output {} uses a solid colour, no image to set", name);
                }
                keep
            })
            .collect(),
    };

    Ok(WallpaperState {
        mode,
        single_path: image_path(wallpaper_path),
        per_monitor_paths,
        is_light_mode: doc.is_light_mode.unwrap_or(false),
    })
}

pub fn read_state(path: &Path) -> Result<WallpaperState, ParseError> {
    let bytes = fs::read(path).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => ParseError::NotFound(path.to_path_buf()),
        _ => ParseError::Read {
            path: path.to_path_buf(),
            source,
        },
    })?;
    parse_state(&bytes)
}

/// Scheme override from the settings document, if any.
pub fn parse_settings(bytes: &[u8]) -> Result<Option<String>, serde_json::Error> {
    let doc: SettingsDocument = serde_json::from_slice(bytes)?;
    Ok(doc
        .matugen_scheme
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty()))
}

/// Scheme to generate the theme with. Never fails, the settings file is
/// optional.
pub fn resolve_scheme(settings_path: &Path, default_scheme: &str) -> String {
    let bytes = match fs::read(settings_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Settings {:?} unavailable ({}), using scheme {}", settings_path, e, default_scheme);
            return default_scheme.to_string();
        }
    };

    match parse_settings(&bytes) {
        Ok(Some(scheme)) => scheme,
        Ok(None) => default_scheme.to_string(),
        Err(e) => {
            warn!("Ignoring malformed settings {:?}: {}", settings_path, e);
            default_scheme.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_wallpaper() {
        let state = parse_state(br#"{"wallpaperPath": "/tmp/a.jpg", "isLightMode": true}"#).unwrap();
        assert_eq!(state.mode, WallpaperMode::Single);
        assert_eq!(state.single_path.as_deref(), Some("/tmp/a.jpg"));
        assert!(state.per_monitor_paths.is_empty());
        assert!(state.is_light_mode);
    }

    #[test]
    fn test_per_monitor_filters_colors() {
        let state = parse_state(
            br##"{"perMonitorWallpaper":true,"monitorWallpapers":{"OUT-1":"/tmp/a.jpg","OUT-2":"#222222"}}"##,
        )
        .unwrap();
        assert_eq!(state.mode, WallpaperMode::PerMonitor);
        assert_eq!(state.per_monitor_paths.len(), 1);
        assert_eq!(state.per_monitor_paths["OUT-1"], "/tmp/a.jpg");
        assert!(!state.per_monitor_paths.contains_key("OUT-2"));
        assert!(!state.is_light_mode);
    }

    #[test]
    fn test_single_mode_wins_when_per_monitor_disabled() {
        let state = parse_state(
            br#"{"wallpaperPath":"/tmp/a.jpg","perMonitorWallpaper":false,"monitorWallpapers":{"DP-1":"/tmp/b.jpg"}}"#,
        )
        .unwrap();
        assert_eq!(state.mode, WallpaperMode::Single);
        assert!(state.per_monitor_paths.is_empty());
    }

    #[test]
    fn test_null_fields_are_not_set() {
        let state = parse_state(
            br#"{"wallpaperPath":"/tmp/a.jpg","perMonitorWallpaper":null,"monitorWallpapers":null,"isLightMode":null,"other":1}"#,
        )
        .unwrap();
        assert_eq!(state.mode, WallpaperMode::Single);
        assert!(!state.is_light_mode);
    }

    #[test]
    fn test_color_only_session_is_empty_not_error() {
        let state = parse_state(br##"{"wallpaperPath":"#1E1E2E"}"##).unwrap();
        assert!(state.single_path.is_none());
        assert!(state.is_empty());

        let state = parse_state(br##"{"wallpaperPath":"/#ffffff"}"##).unwrap();
        assert!(state.is_empty());
    }

    #[test]
    fn test_is_color_spec() {
        assert!(is_color_spec("#000"));
        assert!(is_color_spec("#FfFfFf"));
        assert!(is_color_spec("#not-even-hex.jpg"));
        assert!(is_color_spec("/#abcdef"));
        assert!(!is_color_spec("/home/me/#1.jpg"));
        assert!(!is_color_spec("/tmp/a.jpg"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse_state(b""), Err(ParseError::Empty)));
        assert!(matches!(parse_state(b"  \n"), Err(ParseError::Empty)));
        assert!(matches!(parse_state(b"{\"wallpaperPath\": "), Err(ParseError::Malformed(_))));
        assert!(matches!(parse_state(b"[]"), Err(ParseError::Malformed(_))));
        assert!(matches!(parse_state(br#"["/tmp/a.jpg"]"#), Err(ParseError::Malformed(_))));
        assert!(matches!(parse_state(b"\"/tmp/a.jpg\""), Err(ParseError::Malformed(_))));
        assert!(matches!(parse_state(b"null"), Err(ParseError::Malformed(_))));
        assert!(matches!(
            parse_state(br#"{"wallpaperPath": 3}"#),
            Err(ParseError::Malformed(_))
        ));
        assert!(matches!(parse_state(b"{}"), Err(ParseError::MissingField("wallpaperPath"))));
        assert!(matches!(
            parse_state(br#"{"wallpaperPath":""}"#),
            Err(ParseError::MissingField(_))
        ));
        assert!(matches!(
            parse_state(br#"{"perMonitorWallpaper":true,"monitorWallpapers":{"DP-1":""}}"#),
            Err(ParseError::NoMonitorWallpapers)
        ));
    }

    #[test]
    fn test_per_monitor_without_entries_uses_fallback() {
        let state = parse_state(br#"{"perMonitorWallpaper":true,"wallpaperPath":"/tmp/a.jpg"}"#).unwrap();
        assert_eq!(state.mode, WallpaperMode::PerMonitor);
        assert!(state.per_monitor_paths.is_empty());
        assert_eq!(state.single_path.as_deref(), Some("/tmp/a.jpg"));
        assert!(!state.is_empty());
    }

    #[test]
    fn test_read_state_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = read_state(&dir.path().join("session.json")).unwrap_err();
        assert!(matches!(err, ParseError::NotFound(_)));
        assert!(err.self_resolving());
    }

    #[test]
    fn test_parse_settings() {
        assert_eq!(
            parse_settings(br#"{"matugenScheme":"scheme-fidelity","otherSetting":"x"}"#).unwrap(),
            Some("scheme-fidelity".to_string())
        );
        assert_eq!(parse_settings(br#"{"matugenScheme":"  "}"#).unwrap(), None);
        assert_eq!(parse_settings(br#"{"matugenScheme":null}"#).unwrap(), None);
        assert!(parse_settings(b"nope").is_err());
    }

    #[test]
    fn test_resolve_scheme_fallbacks() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.json");

        assert_eq!(resolve_scheme(&path, "scheme-tonal-spot"), "scheme-tonal-spot");

        fs::write(&path, r#"{"matugenScheme":""}"#).unwrap();
        assert_eq!(resolve_scheme(&path, "scheme-tonal-spot"), "scheme-tonal-spot");

        fs::write(&path, "{broken").unwrap();
        assert_eq!(resolve_scheme(&path, "scheme-tonal-spot"), "scheme-tonal-spot");

        fs::write(&path, r#"{"matugenScheme":"scheme-content"}"#).unwrap();
        assert_eq!(resolve_scheme(&path, "scheme-tonal-spot"), "scheme-content");
    }
}
