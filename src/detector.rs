//! Decides whether a freshly parsed state differs from what was last applied,
//! and what exactly has to be redone.

use crate::monitor::OutputDescriptor;
use crate::session::{WallpaperMode, WallpaperState};
use std::collections::BTreeMap;
use tracing::warn;

/// What the daemon last pushed to the external tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedState {
    pub assignments: BTreeMap<String, String>,
    pub is_light_mode: bool,
    pub scheme_name: String,
    pub theme_source: Option<String>,
}

impl AppliedState {
    /// State at process start: nothing applied, dark mode, default scheme.
    pub fn empty(default_scheme: &str) -> Self {
        Self {
            assignments: BTreeMap::new(),
            is_light_mode: false,
            scheme_name: default_scheme.to_string(),
            theme_source: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedChange {
    /// Outputs whose wallpaper must be (re)set, with their new image.
    pub per_output_wallpaper: BTreeMap<String, String>,
    /// Outputs that had a wallpaper last time and are gone now.
    pub removed_outputs: Vec<String>,
    pub theme_changed: bool,
    pub scheme_name: String,
    pub is_light_mode: bool,
    /// Image the theme generator is seeded from.
    pub theme_source: Option<String>,
}

impl ResolvedChange {
    pub fn mode_name(&self) -> &'static str {
        if self.is_light_mode { "light" } else { "dark" }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diff {
    NoChange,
    Changed {
        change: ResolvedChange,
        next: AppliedState,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiffOptions {
    pub theme_follows_wallpaper: bool,
}

/// Assigns an image to every enabled output.
///
/// Outputs that end up without an image are left out of the result.
pub fn expand(state: &WallpaperState, outputs: &[OutputDescriptor]) -> BTreeMap<String, String> {
    let mut assignments = BTreeMap::new();

    for output in outputs.iter().filter(|o| o.enabled) {
        let path = match state.mode {
            WallpaperMode::Single => state.single_path.as_ref(),
            WallpaperMode::PerMonitor if output.is_default() => state
                .single_path
                .as_ref()
                .or_else(|| state.per_monitor_paths.values().next()),
            WallpaperMode::PerMonitor => state
                .per_monitor_paths
                .get(&output.name)
                .or(state.single_path.as_ref()),
        };

        match path {
            Some(path) => {
                assignments.insert(output.name.clone(), path.clone());
            }
            None => warn!("No wallpaper image for output {}, skipping it", output),
        }
    }

    assignments
}

fn theme_source(state: &WallpaperState, assignments: &BTreeMap<String, String>) -> Option<String> {
    match state.mode {
        WallpaperMode::Single => state.single_path.clone(),
        WallpaperMode::PerMonitor => assignments
            .values()
            .next()
            .cloned()
            .or_else(|| state.single_path.clone()),
    }
}

pub fn diff(
    previous: &AppliedState,
    current: &WallpaperState,
    outputs: &[OutputDescriptor],
    scheme_name: &str,
    options: DiffOptions,
) -> Diff {
    let assignments = expand(current, outputs);

    let per_output_wallpaper: BTreeMap<String, String> = assignments
        .iter()
        .filter(|(name, path)| previous.assignments.get(*name) != Some(*path))
        .map(|(name, path)| (name.clone(), path.clone()))
        .collect();

    let removed_outputs: Vec<String> = previous
        .assignments
        .keys()
        .filter(|name| !assignments.contains_key(*name))
        .cloned()
        .collect();

    let source = theme_source(current, &assignments);
    let theme_changed = previous.is_light_mode != current.is_light_mode
        || previous.scheme_name != scheme_name
        || (options.theme_follows_wallpaper && previous.theme_source != source);

    if per_output_wallpaper.is_empty() && removed_outputs.is_empty() && !theme_changed {
        return Diff::NoChange;
    }

    // No image means no theme can be generated; keep the old theme recorded
    // so the flip is redone once an image shows up.
    let theme_applied = !theme_changed || source.is_some();
    let next = AppliedState {
        assignments,
        is_light_mode: if theme_applied {
            current.is_light_mode
        } else {
            previous.is_light_mode
        },
        scheme_name: if theme_applied {
            scheme_name.to_string()
        } else {
            previous.scheme_name.clone()
        },
        theme_source: source.clone(),
    };

    Diff::Changed {
        change: ResolvedChange {
            per_output_wallpaper,
            removed_outputs,
            theme_changed,
            scheme_name: scheme_name.to_string(),
            is_light_mode: current.is_light_mode,
            theme_source: source,
        },
        next,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::parse_state;

    const SCHEME: &str = "scheme-tonal-spot";

    fn outputs(names: &[&str]) -> Vec<OutputDescriptor> {
        names.iter().map(|n| OutputDescriptor::named(*n)).collect()
    }

    fn changed(diff: Diff) -> (ResolvedChange, AppliedState) {
        match diff {
            Diff::Changed { change, next } => (change, next),
            Diff::NoChange => panic!("expected a change"),
        }
    }

    #[test]
    fn test_single_mode_assigns_every_enabled_output() {
        let state = WallpaperState::single("/tmp/a.jpg");
        let mut outs = outputs(&["DP-1", "DP-2", "eDP-1"]);
        outs[2].enabled = false;

        let assignments = expand(&state, &outs);
        assert_eq!(assignments.len(), 2);
        assert!(assignments.values().all(|p| p == "/tmp/a.jpg"));
        assert!(!assignments.contains_key("eDP-1"));
    }

    #[test]
    fn test_same_state_is_no_change() {
        let state = parse_state(br#"{"perMonitorWallpaper":true,"monitorWallpapers":{"DP-1":"/a.jpg"},"wallpaperPath":"/b.jpg","isLightMode":true}"#).unwrap();
        let outs = outputs(&["DP-1", "DP-2"]);

        let (_, next) = changed(diff(&AppliedState::empty(SCHEME), &state, &outs, SCHEME, DiffOptions::default()));
        assert_eq!(diff(&next, &state, &outs, SCHEME, DiffOptions::default()), Diff::NoChange);
    }

    #[test]
    fn test_per_monitor_falls_back_to_single_path() {
        let state = parse_state(br#"{"perMonitorWallpaper":true,"monitorWallpapers":{"DP-1":"/a.jpg"},"wallpaperPath":"/b.jpg"}"#).unwrap();
        let assignments = expand(&state, &outputs(&["DP-1", "HDMI-A-1"]));
        assert_eq!(assignments["DP-1"], "/a.jpg");
        assert_eq!(assignments["HDMI-A-1"], "/b.jpg");
    }

    #[test]
    fn test_per_monitor_without_fallback_omits_output() {
        let state = parse_state(br##"{"perMonitorWallpaper":true,"monitorWallpapers":{"OUT-1":"/tmp/a.jpg","OUT-2":"#222222"}}"##).unwrap();
        let (change, _) = changed(diff(
            &AppliedState::empty(SCHEME),
            &state,
            &outputs(&["OUT-1", "OUT-2"]),
            SCHEME,
            DiffOptions::default(),
        ));
        assert_eq!(change.per_output_wallpaper.len(), 1);
        assert_eq!(change.per_output_wallpaper["OUT-1"], "/tmp/a.jpg");
        assert!(!change.theme_changed);
        assert_eq!(change.theme_source.as_deref(), Some("/tmp/a.jpg"));
    }

    #[test]
    fn test_theme_only_change() {
        let dark = WallpaperState::single("/tmp/a.jpg");
        let light = WallpaperState {
            is_light_mode: true,
            ..dark.clone()
        };
        let outs = outputs(&["DP-1"]);

        let (_, applied) = changed(diff(&AppliedState::empty(SCHEME), &dark, &outs, SCHEME, DiffOptions::default()));
        let (change, next) = changed(diff(&applied, &light, &outs, SCHEME, DiffOptions::default()));
        assert!(change.per_output_wallpaper.is_empty());
        assert!(change.theme_changed);
        assert_eq!(change.mode_name(), "light");
        assert!(next.is_light_mode);
    }

    #[test]
    fn test_scheme_change_sets_theme_changed() {
        let state = WallpaperState::single("/tmp/a.jpg");
        let outs = outputs(&["DP-1"]);
        let (_, applied) = changed(diff(&AppliedState::empty(SCHEME), &state, &outs, SCHEME, DiffOptions::default()));

        let (change, _) = changed(diff(&applied, &state, &outs, "scheme-fidelity", DiffOptions::default()));
        assert!(change.theme_changed);
        assert!(change.per_output_wallpaper.is_empty());
        assert_eq!(change.scheme_name, "scheme-fidelity");
    }

    #[test]
    fn test_first_single_cycle_targets_all_outputs() {
        let state = parse_state(br#"{"wallpaperPath":"/tmp/a.jpg"}"#).unwrap();
        let outs = outputs(&["OUT-1", "OUT-2"]);

        let (change, _) = changed(diff(&AppliedState::empty(SCHEME), &state, &outs, SCHEME, DiffOptions::default()));
        assert_eq!(change.per_output_wallpaper.len(), 2);
        assert!(change.per_output_wallpaper.values().all(|p| p == "/tmp/a.jpg"));
        assert!(!change.theme_changed);

        let (change, _) = changed(diff(&AppliedState::empty(SCHEME), &state, &outs, "scheme-expressive", DiffOptions::default()));
        assert!(change.theme_changed);
    }

    #[test]
    fn test_only_changed_outputs_are_included() {
        let outs = outputs(&["DP-1", "DP-2"]);
        let before = parse_state(br#"{"perMonitorWallpaper":true,"monitorWallpapers":{"DP-1":"/a.jpg","DP-2":"/b.jpg"}}"#).unwrap();
        let after = parse_state(br#"{"perMonitorWallpaper":true,"monitorWallpapers":{"DP-1":"/a.jpg","DP-2":"/c.jpg"}}"#).unwrap();

        let (_, applied) = changed(diff(&AppliedState::empty(SCHEME), &before, &outs, SCHEME, DiffOptions::default()));
        let (change, _) = changed(diff(&applied, &after, &outs, SCHEME, DiffOptions::default()));
        assert_eq!(change.per_output_wallpaper.keys().collect::<Vec<_>>(), vec!["DP-2"]);
    }

    #[test]
    fn test_appearing_and_disappearing_outputs() {
        let state = WallpaperState::single("/tmp/a.jpg");
        let (_, applied) = changed(diff(
            &AppliedState::empty(SCHEME),
            &state,
            &outputs(&["DP-1", "DP-2"]),
            SCHEME,
            DiffOptions::default(),
        ));

        let (change, next) = changed(diff(&applied, &state, &outputs(&["DP-1", "HDMI-A-1"]), SCHEME, DiffOptions::default()));
        assert_eq!(change.per_output_wallpaper.keys().collect::<Vec<_>>(), vec!["HDMI-A-1"]);
        assert_eq!(change.removed_outputs, vec!["DP-2".to_string()]);
        assert!(!next.assignments.contains_key("DP-2"));
    }

    #[test]
    fn test_color_only_state_from_nothing_is_no_change() {
        let state = parse_state(br##"{"wallpaperPath":"#000000"}"##).unwrap();
        let diff = diff(&AppliedState::empty(SCHEME), &state, &outputs(&["DP-1"]), SCHEME, DiffOptions::default());
        assert_eq!(diff, Diff::NoChange);
    }

    #[test]
    fn test_theme_flip_without_image_is_not_recorded() {
        let outs = outputs(&["DP-1"]);
        let color_light = parse_state(br##"{"wallpaperPath":"#112233","isLightMode":true}"##).unwrap();

        let (change, next) = changed(diff(&AppliedState::empty(SCHEME), &color_light, &outs, SCHEME, DiffOptions::default()));
        assert!(change.theme_changed);
        assert_eq!(change.theme_source, None);
        assert!(!next.is_light_mode);

        let (change, next) = changed(diff(&next, &color_light, &outs, "scheme-content", DiffOptions::default()));
        assert!(change.theme_changed);
        assert_eq!(next.scheme_name, SCHEME);

        let image_light = parse_state(br#"{"wallpaperPath":"/tmp/a.jpg","isLightMode":true}"#).unwrap();
        let (change, next) = changed(diff(&next, &image_light, &outs, SCHEME, DiffOptions::default()));
        assert!(change.theme_changed);
        assert_eq!(change.theme_source.as_deref(), Some("/tmp/a.jpg"));
        assert!(next.is_light_mode);
        assert_eq!(diff(&next, &image_light, &outs, SCHEME, DiffOptions::default()), Diff::NoChange);
    }

    #[test]
    fn test_default_output_uses_first_available_image() {
        let state = parse_state(br#"{"perMonitorWallpaper":true,"monitorWallpapers":{"B":"/b.jpg","A":"/a.jpg"}}"#).unwrap();
        let assignments = expand(&state, &[OutputDescriptor::default_output()]);
        assert_eq!(assignments[""], "/a.jpg");
    }

    #[test]
    fn test_theme_follows_wallpaper_option() {
        let outs = outputs(&["DP-1"]);
        let options = DiffOptions {
            theme_follows_wallpaper: true,
        };
        let (first, applied) = changed(diff(
            &AppliedState::empty(SCHEME),
            &WallpaperState::single("/a.jpg"),
            &outs,
            SCHEME,
            options,
        ));
        assert!(first.theme_changed);

        let (change, _) = changed(diff(&applied, &WallpaperState::single("/b.jpg"), &outs, SCHEME, options));
        assert!(change.theme_changed);

        let (change, _) = changed(diff(
            &applied,
            &WallpaperState::single("/b.jpg"),
            &outs,
            SCHEME,
            DiffOptions::default(),
        ));
        assert!(!change.theme_changed);
    }
}
