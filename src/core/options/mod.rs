// src/core/options/mod.rs

//! Parsing, canonicalization, and validation of transformation options.
//!
//! Options arrive as URL query parameters or Akamai-compatible IMQuery hints
//! and are reduced to a canonical [`TransformOptions`] before fingerprinting,
//! so that equivalent requests land on the same cache key.

pub mod fingerprint;
pub mod imquery;

pub use fingerprint::{CacheKey, Fingerprint};

use crate::config::Config;
use crate::core::FramegateError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strum_macros::{Display, EnumString};

/// Query parameter names whose presence bypasses the cache for a request.
/// Matching is case-sensitive on the parameter name.
pub const BYPASS_TOKENS: [&str; 3] = ["debug", "nocache", "bypass"];

/// The transformation mode of a request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, EnumString, Display, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Video,
    Frame,
    Spritesheet,
    Audio,
}

/// How the output is fitted into the requested dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Fit {
    Contain,
    Cover,
    Crop,
    #[strum(serialize = "scale-down")]
    #[serde(rename = "scale-down")]
    ScaleDown,
}

/// Output container/image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Mp4,
    Webm,
    Gif,
    Jpg,
    Png,
    Webp,
}

/// Quality and compression levels share the same vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Low,
    Medium,
    High,
    Auto,
}

/// The `preload` playback hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Preload {
    None,
    Metadata,
    Auto,
}

/// A media timestamp or duration such as `5s`, `250ms`, or a bare seconds number.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeSpec {
    seconds: f64,
}

impl TimeSpec {
    pub fn from_seconds(seconds: f64) -> Self {
        Self { seconds }
    }

    pub fn as_seconds(&self) -> f64 {
        self.seconds
    }
}

impl FromStr for TimeSpec {
    type Err = FramegateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let parse = |value: &str, scale: f64| -> Result<TimeSpec, FramegateError> {
            value
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite() && *v >= 0.0)
                .map(|v| TimeSpec { seconds: v * scale })
                .ok_or_else(|| FramegateError::Validation(format!("invalid time value '{raw}'")))
        };
        if let Some(ms) = raw.strip_suffix("ms") {
            parse(ms, 0.001)
        } else if let Some(secs) = raw.strip_suffix('s') {
            parse(secs, 1.0)
        } else {
            parse(raw, 1.0)
        }
    }
}

impl fmt::Display for TimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.seconds == self.seconds.trunc() {
            write!(f, "{}s", self.seconds as u64)
        } else {
            write!(f, "{}s", self.seconds)
        }
    }
}

/// Requested or derived output dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// The canonical, validated set of transformation options for one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub mode: Mode,
    pub fit: Option<Fit>,
    pub format: Option<OutputFormat>,
    pub time: Option<TimeSpec>,
    pub duration: Option<TimeSpec>,
    pub quality: Option<Level>,
    pub compression: Option<Level>,
    pub loop_playback: Option<bool>,
    pub autoplay: Option<bool>,
    pub muted: Option<bool>,
    pub preload: Option<Preload>,
    /// A named preset; takes precedence over explicit dimensions in the fingerprint.
    pub derivative: Option<String>,
    /// The dimensions the preset resolves to, when a derivative is active.
    pub derivative_dims: Option<Dimensions>,
    /// Monotonic cache-busting version, attached by the orchestrator.
    pub version: u64,
}

fn parse_bool(key: &str, value: &str) -> Result<bool, FramegateError> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(FramegateError::Validation(format!(
            "invalid boolean '{other}' for '{key}'"
        ))),
    }
}

fn parse_dimension(key: &str, value: &str) -> Result<u32, FramegateError> {
    let parsed: u32 = value
        .parse()
        .map_err(|_| FramegateError::Validation(format!("invalid {key} '{value}'")))?;
    if !(10..=2000).contains(&parsed) {
        return Err(FramegateError::Validation(format!(
            "{key} must be within [10, 2000], got {parsed}"
        )));
    }
    Ok(parsed)
}

fn parse_enum<T: FromStr>(key: &str, value: &str) -> Result<T, FramegateError> {
    T::from_str(value)
        .map_err(|_| FramegateError::Validation(format!("unknown {key} '{value}'")))
}

impl TransformOptions {
    /// Builds canonical options from decoded query pairs.
    ///
    /// IMQuery hints (`imwidth`, `imheight`, `imref`) are folded into a derivative
    /// via the configured breakpoints; an explicit `derivative=` always wins.
    /// Unrecognized parameter names are ignored; recognized names with
    /// unparseable values are validation errors.
    pub fn from_query_pairs(
        pairs: &[(String, String)],
        config: &Config,
    ) -> Result<Self, FramegateError> {
        let mut opts = TransformOptions {
            version: 1,
            ..Default::default()
        };
        let mut imquery_hint = imquery::ImQueryHint::default();

        for (key, value) in pairs {
            match key.as_str() {
                "width" => opts.width = Some(parse_dimension("width", value)?),
                "height" => opts.height = Some(parse_dimension("height", value)?),
                "mode" => opts.mode = parse_enum("mode", value)?,
                "fit" => opts.fit = Some(parse_enum("fit", value)?),
                "format" => opts.format = Some(parse_enum("format", value)?),
                "time" => opts.time = Some(value.parse()?),
                "duration" => opts.duration = Some(value.parse()?),
                "quality" => opts.quality = Some(parse_enum("quality", value)?),
                "compression" => opts.compression = Some(parse_enum("compression", value)?),
                "loop" => opts.loop_playback = Some(parse_bool("loop", value)?),
                "autoplay" => opts.autoplay = Some(parse_bool("autoplay", value)?),
                "muted" => opts.muted = Some(parse_bool("muted", value)?),
                "preload" => opts.preload = Some(parse_enum("preload", value)?),
                "derivative" => opts.derivative = Some(value.clone()),
                "imwidth" => {
                    imquery_hint.width = Some(parse_dimension("imwidth", value)?);
                }
                "imheight" => {
                    imquery_hint.height = Some(parse_dimension("imheight", value)?);
                }
                "imref" => imquery_hint.absorb_imref(value)?,
                _ => {}
            }
        }

        if opts.derivative.is_none()
            && let Some(name) = imquery_hint.map_to_derivative(&config.imquery)
        {
            opts.derivative = Some(name.to_string());
        }

        if let Some(name) = &opts.derivative {
            let spec = config.derivatives.get(name).ok_or_else(|| {
                FramegateError::Validation(format!("unknown derivative '{name}'"))
            })?;
            opts.derivative_dims = Some(Dimensions {
                width: spec.width,
                height: spec.height,
            });
        }

        opts.validate()?;
        Ok(opts)
    }

    /// Enforces the mode-conditional combination rules.
    pub fn validate(&self) -> Result<(), FramegateError> {
        match self.mode {
            Mode::Frame => {
                if self.duration.is_some() {
                    return Err(FramegateError::Validation(
                        "duration is not valid in frame mode".into(),
                    ));
                }
                if self.loop_playback.is_some() || self.autoplay.is_some() {
                    return Err(FramegateError::Validation(
                        "playback flags are not valid in frame mode".into(),
                    ));
                }
            }
            Mode::Spritesheet => {
                if self.derivative.is_none() && (self.width.is_none() || self.height.is_none()) {
                    return Err(FramegateError::Validation(
                        "spritesheet mode requires width and height".into(),
                    ));
                }
                if self.loop_playback.is_some()
                    || self.autoplay.is_some()
                    || self.muted.is_some()
                    || self.quality.is_some()
                {
                    return Err(FramegateError::Validation(
                        "playback and quality flags are not valid in spritesheet mode".into(),
                    ));
                }
            }
            Mode::Audio => {
                if self.width.is_some() || self.height.is_some() || self.fit.is_some() {
                    return Err(FramegateError::Validation(
                        "dimensions are not valid in audio mode".into(),
                    ));
                }
                if self.autoplay == Some(true) && self.muted != Some(true) {
                    return Err(FramegateError::Validation(
                        "autoplay audio must be muted".into(),
                    ));
                }
            }
            Mode::Video => {
                if self.autoplay == Some(true) && self.muted != Some(true) {
                    return Err(FramegateError::Validation(
                        "autoplay requires muted playback".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// The effective output dimensions: derivative preset, else explicit values.
    pub fn effective_dims(&self) -> Option<Dimensions> {
        self.derivative_dims.or(match (self.width, self.height) {
            (Some(width), Some(height)) => Some(Dimensions { width, height }),
            _ => None,
        })
    }

    /// The dimensions the caller explicitly requested, for manifest diagnostics.
    pub fn requested_dims(&self) -> Option<Dimensions> {
        match (self.width, self.height) {
            (Some(width), Some(height)) => Some(Dimensions { width, height }),
            _ => None,
        }
    }

    /// Canonical query pairs for the transformation endpoint, in stable order.
    /// The version is appended last as `v` so upstream cache keys roll when an
    /// operator raises it.
    pub fn upstream_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = Vec::new();
        pairs.push(("mode".into(), self.mode.to_string()));
        let dims = self.effective_dims();
        if let Some(d) = dims {
            pairs.push(("width".into(), d.width.to_string()));
            pairs.push(("height".into(), d.height.to_string()));
        }
        if let Some(fit) = self.fit {
            pairs.push(("fit".into(), fit.to_string()));
        }
        if let Some(format) = self.format {
            pairs.push(("format".into(), format.to_string()));
        }
        if let Some(time) = self.time {
            pairs.push(("time".into(), time.to_string()));
        }
        if let Some(duration) = self.duration {
            pairs.push(("duration".into(), duration.to_string()));
        }
        if let Some(quality) = self.quality {
            pairs.push(("quality".into(), quality.to_string()));
        }
        if let Some(compression) = self.compression {
            pairs.push(("compression".into(), compression.to_string()));
        }
        if let Some(loop_playback) = self.loop_playback {
            pairs.push(("loop".into(), loop_playback.to_string()));
        }
        if let Some(autoplay) = self.autoplay {
            pairs.push(("autoplay".into(), autoplay.to_string()));
        }
        if let Some(muted) = self.muted {
            pairs.push(("muted".into(), muted.to_string()));
        }
        if let Some(preload) = self.preload {
            pairs.push(("preload".into(), preload.to_string()));
        }
        pairs.push(("v".into(), self.version.to_string()));
        pairs
    }
}

/// Returns true when any bypass token is present among the query pairs.
pub fn has_bypass_token(pairs: &[(String, String)]) -> bool {
    pairs
        .iter()
        .any(|(key, _)| BYPASS_TOKENS.contains(&key.as_str()))
}

/// Returns true when the request asks for the HTML diagnostics view.
pub fn wants_debug_view(pairs: &[(String, String)]) -> bool {
    pairs
        .iter()
        .any(|(key, value)| key == "debug" && value == "view")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(input: &[(&str, &str)]) -> Vec<(String, String)> {
        input
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_canonical_video_options() {
        let config = Config::default();
        let opts = TransformOptions::from_query_pairs(
            &pairs(&[
                ("width", "640"),
                ("height", "360"),
                ("mode", "video"),
                ("fit", "cover"),
                ("duration", "30s"),
                ("quality", "high"),
            ]),
            &config,
        )
        .unwrap();
        assert_eq!(opts.mode, Mode::Video);
        assert_eq!(
            opts.effective_dims(),
            Some(Dimensions {
                width: 640,
                height: 360
            })
        );
        assert_eq!(opts.duration.unwrap().as_seconds(), 30.0);
    }

    #[test]
    fn unknown_mode_is_a_validation_error() {
        let config = Config::default();
        let err =
            TransformOptions::from_query_pairs(&pairs(&[("mode", "holo")]), &config).unwrap_err();
        assert!(matches!(err, FramegateError::Validation(_)));
    }

    #[test]
    fn rejects_unmuted_autoplay_audio() {
        let config = Config::default();
        let err = TransformOptions::from_query_pairs(
            &pairs(&[("mode", "audio"), ("autoplay", "true"), ("muted", "false")]),
            &config,
        )
        .unwrap_err();
        assert!(matches!(err, FramegateError::Validation(_)));
    }

    #[test]
    fn rejects_out_of_range_dimensions() {
        let config = Config::default();
        assert!(TransformOptions::from_query_pairs(&pairs(&[("width", "5")]), &config).is_err());
        assert!(
            TransformOptions::from_query_pairs(&pairs(&[("height", "4000")]), &config).is_err()
        );
    }

    #[test]
    fn time_spec_round_trips() {
        assert_eq!("5s".parse::<TimeSpec>().unwrap().as_seconds(), 5.0);
        assert_eq!("250ms".parse::<TimeSpec>().unwrap().as_seconds(), 0.25);
        assert_eq!("46".parse::<TimeSpec>().unwrap().to_string(), "46s");
    }

    #[test]
    fn bypass_tokens_are_case_sensitive_names() {
        assert!(has_bypass_token(&pairs(&[("nocache", "")])));
        assert!(has_bypass_token(&pairs(&[("debug", "view")])));
        assert!(!has_bypass_token(&pairs(&[("NoCache", "1")])));
        assert!(!has_bypass_token(&pairs(&[("imwidth", "800")])));
    }

    #[test]
    fn upstream_pairs_end_with_version() {
        let config = Config::default();
        let mut opts =
            TransformOptions::from_query_pairs(&pairs(&[("width", "640"), ("height", "360")]), &config)
                .unwrap();
        opts.version = 7;
        let upstream = opts.upstream_query_pairs();
        assert_eq!(upstream.last().unwrap(), &("v".to_string(), "7".to_string()));
    }
}
