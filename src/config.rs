//! Configuration.
//!
//! Loaded from a TOML file at `~/.config/veil/veil.toml`; a default file is
//! written on first run. Parse failures are fatal before the main loop and
//! can never occur after it.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::rules::{OpacityRules, RuleList};
use crate::win::WinType;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub fading: FadingConfig,
    pub shadow: ShadowConfig,
    pub opacity: OpacityConfig,
    pub blur: BlurConfig,
    pub invert: InvertConfig,
    pub unredir: UnredirConfig,
    /// Per-wintype overrides keyed by the EWMH type name ("dock", ...).
    pub wintypes: HashMap<String, WintypeConfig>,
}

impl Config {
    /// Load from the given path, or the default location. Missing file means
    /// defaults (and an attempt to write them out for the user to edit).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_owned(),
            None => Self::default_path()?,
        };

        if !path.exists() {
            info!("Config file not found at {:?}, using defaults", path);
            if let Err(e) = Self::save_default(&path) {
                warn!("Failed to write default config file: {}", e);
            }
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        info!("Configuration loaded from {:?}", path);
        debug!("Config: {:?}", config);
        Ok(config)
    }

    fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .context("Failed to locate config directory")?
            .join("veil");
        Ok(dir.join("veil.toml"))
    }

    fn save_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let toml_string =
            toml::to_string_pretty(&Self::default()).context("Failed to serialize defaults")?;
        fs::write(path, toml_string).context("Failed to write default config file")?;
        info!("Created default config file at {:?}", path);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.fading.fade_delta_ms >= 1,
            "fading.fade_delta_ms must be at least 1"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.fading.fade_in_step)
                && (0.0..=1.0).contains(&self.fading.fade_out_step),
            "fade steps must be within [0, 1]"
        );
        anyhow::ensure!(
            self.blur.passes >= 1 && self.blur.passes <= crate::backend::MAX_BLUR_PASS,
            "blur.passes must be within 1..={}",
            crate::backend::MAX_BLUR_PASS
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.shadow.opacity),
            "shadow.opacity must be within [0, 1]"
        );
        for (name, value) in [
            ("opacity.active", self.opacity.active),
            ("opacity.inactive", self.opacity.inactive),
            ("opacity.frame", self.opacity.frame),
            ("opacity.inactive_dim", self.opacity.inactive_dim),
        ] {
            anyhow::ensure!(
                (0.0..=1.0).contains(&value),
                "{} must be within [0, 1]",
                name
            );
        }
        for key in self.wintypes.keys() {
            anyhow::ensure!(
                WinType::from_name(key).is_some(),
                "unknown wintype {:?} in [wintypes]",
                key
            );
        }
        if let Some(spec) = &self.shadow.exclude_region {
            anyhow::ensure!(
                parse_geometry(spec).is_some(),
                "shadow.exclude_region is not a valid geometry: {:?}",
                spec
            );
        }
        Ok(())
    }

    /// Per-wintype options with fallback to the built-in defaults.
    pub fn wintype(&self, ty: WinType) -> WintypeConfig {
        self.wintypes
            .get(ty.name())
            .cloned()
            .unwrap_or_else(|| WintypeConfig::builtin(ty))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Rendering backend name; currently only "xrender".
    pub backend: String,
    /// Treat WM frame windows as focused.
    pub mark_wmwin_focused: bool,
    /// Treat override-redirect windows as focused.
    pub mark_ovredir_focused: bool,
    /// Follow _NET_ACTIVE_WINDOW on the root window for focus tracking.
    pub use_ewmh_active_win: bool,
    /// Derive window groups from WM_CLIENT_LEADER / WM_TRANSIENT_FOR.
    pub detect_client_leader: bool,
    /// Exit after this many paints (0 disables).
    pub benchmark: u32,
    /// Optional PID file path.
    pub pid_file: Option<PathBuf>,
    /// Paint the damage region in translucent red each frame.
    pub monitor_repaint: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            backend: "xrender".to_string(),
            mark_wmwin_focused: true,
            mark_ovredir_focused: false,
            use_ewmh_active_win: true,
            detect_client_leader: true,
            benchmark: 0,
            pid_file: None,
            monitor_repaint: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FadingConfig {
    /// Opacity delta per fade step when fading in.
    pub fade_in_step: f64,
    /// Opacity delta per fade step when fading out.
    pub fade_out_step: f64,
    /// Milliseconds between fade steps.
    pub fade_delta_ms: u64,
    /// Don't fade on window open and close.
    pub no_fading_openclose: bool,
    pub exclude: RuleList,
}

impl Default for FadingConfig {
    fn default() -> Self {
        Self {
            fade_in_step: 0.028,
            fade_out_step: 0.03,
            fade_delta_ms: 10,
            no_fading_openclose: false,
            exclude: RuleList::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    pub enabled: bool,
    /// Gaussian blur radius of the shadow, in pixels.
    pub radius: f64,
    pub offset_x: i32,
    pub offset_y: i32,
    pub opacity: f64,
    pub red: f64,
    pub green: f64,
    pub blue: f64,
    pub exclude: RuleList,
    /// Screen area shadows are never drawn into, as "WxH+X+Y".
    pub exclude_region: Option<String>,
    /// Crop shadows to the Xinerama screen the window is on.
    pub crop_to_monitor: bool,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            radius: 12.0,
            offset_x: -15,
            offset_y: -15,
            opacity: 0.75,
            red: 0.0,
            green: 0.0,
            blue: 0.0,
            exclude: RuleList::default(),
            exclude_region: None,
            crop_to_monitor: false,
        }
    }
}

/// Parse an X-style geometry spec, `WxH+X+Y` with optional offsets.
pub fn parse_geometry(spec: &str) -> Option<crate::region::Rect> {
    let split = spec.find(|c| c == '+' || c == '-').unwrap_or(spec.len());
    let (size, rest) = spec.split_at(split);
    let (w, h) = size.split_once('x')?;
    let (w, h): (i32, i32) = (w.trim().parse().ok()?, h.trim().parse().ok()?);

    let mut offsets = [0i32; 2];
    let mut idx = 0;
    let mut chars = rest.chars().peekable();
    while chars.peek().is_some() && idx < 2 {
        let sign = match chars.next()? {
            '+' => 1,
            '-' => -1,
            _ => return None,
        };
        let mut digits = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_digit() {
                digits.push(*c);
                chars.next();
            } else {
                break;
            }
        }
        offsets[idx] = sign * digits.parse::<i32>().ok()?;
        idx += 1;
    }
    Some(crate::region::Rect::new(offsets[0], offsets[1], w, h))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpacityConfig {
    /// Opacity of the focused window.
    pub active: f64,
    /// Opacity of unfocused windows.
    pub inactive: f64,
    /// inactive opacity beats _NET_WM_WINDOW_OPACITY.
    pub inactive_override: bool,
    /// Extra multiplier for the WM frame band.
    pub frame: f64,
    /// Dim strength for unfocused windows (0 disables).
    pub inactive_dim: f64,
    /// Dim by a constant amount instead of scaling with opacity.
    pub inactive_dim_fixed: bool,
    pub rules: OpacityRules,
    /// Windows excluded from painting entirely.
    pub paint_exclude: RuleList,
}

impl Default for OpacityConfig {
    fn default() -> Self {
        Self {
            active: 1.0,
            inactive: 1.0,
            inactive_override: false,
            frame: 1.0,
            inactive_dim: 0.0,
            inactive_dim_fixed: false,
            rules: OpacityRules::default(),
            paint_exclude: RuleList::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlurConfig {
    pub background: bool,
    /// Blur the frame band of otherwise solid windows too.
    pub background_frame: bool,
    /// Keep blur strength independent of window opacity.
    pub background_fixed: bool,
    /// Number of convolution passes, capped at the backend maximum.
    pub passes: usize,
    pub exclude: RuleList,
}

impl Default for BlurConfig {
    fn default() -> Self {
        Self {
            background: false,
            background_frame: false,
            background_fixed: false,
            passes: 1,
            exclude: RuleList::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct InvertConfig {
    /// Windows whose colors are inverted.
    pub include: RuleList,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnredirConfig {
    /// Stop redirecting when a solid fullscreen window covers everything.
    pub enabled: bool,
    /// Grace delay before actually unredirecting.
    pub delay_ms: u64,
    pub exclude: RuleList,
}

impl Default for UnredirConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            delay_ms: 0,
            exclude: RuleList::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WintypeConfig {
    /// Default opacity for this type; unset defers to focus-based opacity.
    pub opacity: Option<f64>,
    pub shadow: bool,
    pub fade: bool,
    /// Always consider windows of this type focused.
    pub focus: bool,
    /// Don't carve the bounding shape out of this type's shadow.
    pub full_shadow: bool,
}

impl Default for WintypeConfig {
    fn default() -> Self {
        Self {
            opacity: None,
            shadow: true,
            fade: true,
            focus: false,
            full_shadow: false,
        }
    }
}

impl WintypeConfig {
    /// Built-in defaults mirroring long-standing compositor behavior: no
    /// shadows behind desktops, docks and drag-and-drop surfaces, and docks
    /// and desktops never count as unfocused.
    pub fn builtin(ty: WinType) -> Self {
        let mut cfg = Self::default();
        match ty {
            WinType::Desktop | WinType::Dock => {
                cfg.shadow = false;
                cfg.focus = true;
            }
            WinType::Dnd => {
                cfg.shadow = false;
            }
            WinType::DropdownMenu | WinType::PopupMenu | WinType::Tooltip | WinType::Combo => {
                cfg.full_shadow = true;
            }
            _ => {}
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert_eq!(c.fading.fade_delta_ms, 10);
        assert_eq!(c.opacity.active, 1.0);
        assert!(!c.shadow.enabled);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn parses_a_partial_file() {
        let c: Config = toml::from_str(
            r#"
            [fading]
            fade_in_step = 0.1
            fade_delta_ms = 5

            [shadow]
            enabled = true
            radius = 7.5
            exclude = ["class=Conky", "type=dock"]

            [opacity]
            rules = ["85:class=URxvt"]

            [wintypes.tooltip]
            shadow = false
            opacity = 0.9
            "#,
        )
        .unwrap();
        assert_eq!(c.fading.fade_in_step, 0.1);
        assert!(c.shadow.enabled);
        assert_eq!(c.wintype(WinType::Tooltip).opacity, Some(0.9));
        // Unmentioned types fall back to built-ins.
        assert!(!c.wintype(WinType::Dock).shadow);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        let c: Config = toml::from_str("[fading]\nfade_in_step = 1.5\n").unwrap();
        assert!(c.validate().is_err());
        let c: Config = toml::from_str("[wintypes.bogus]\nshadow = false\n").unwrap();
        assert!(c.validate().is_err());
        let c: Config = toml::from_str("[shadow]\nexclude_region = \"junk\"\n").unwrap();
        assert!(c.validate().is_err());
        let c: Config = toml::from_str("[shadow]\nopacity = 1.5\n").unwrap();
        assert!(c.validate().is_err());
        let c: Config = toml::from_str("[opacity]\ninactive = -0.2\n").unwrap();
        assert!(c.validate().is_err());
    }

    #[test]
    fn geometry_specs_parse() {
        let r = parse_geometry("1920x32+0+0").unwrap();
        assert_eq!((r.x1, r.y1, r.width(), r.height()), (0, 0, 1920, 32));
        let r = parse_geometry("200x100-10+5").unwrap();
        assert_eq!((r.x1, r.y1), (-10, 5));
        let r = parse_geometry("640x480").unwrap();
        assert_eq!((r.x1, r.y1), (0, 0));
        assert!(parse_geometry("640by480").is_none());
        assert!(parse_geometry("").is_none());
    }
}
