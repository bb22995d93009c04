// src/core/transformer/upstream_error.rs

//! Classifies transformation endpoint error bodies into the error taxonomy.
//!
//! The endpoint reports parameter problems as 400s with prose bodies. The
//! interesting one is the duration bound ("duration: attribute must be
//! between Xms and Ys"), whose upper bound is parsed so the orchestrator can
//! retry once with an adjusted duration.

use crate::core::FramegateError;
use once_cell::sync::Lazy;
use regex::Regex;

static DURATION_BOUNDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)duration:\s*attribute must be between\s*\d+ms and\s*([0-9]+(?:\.[0-9]+)?)s")
        .unwrap()
});
static SEEK_TIME: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)time\b.*\bexceeds?").unwrap());
static INVALID_MODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)invalid\b.*\bmode").unwrap());
static FORMAT_INVALID: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)format\b.*\binvalid").unwrap());
static FILE_SIZE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)file size limit").unwrap());

/// Maps a 400 body onto a specific error kind; unrecognized bodies become a
/// generic `parameter_error`.
pub fn classify_bad_request(body: &str) -> FramegateError {
    if let Some(captures) = DURATION_BOUNDS.captures(body)
        && let Ok(upper) = captures[1].parse::<f64>()
    {
        // The retry duration is the bound rounded down to whole seconds.
        return FramegateError::DurationLimit {
            max_seconds: upper.floor() as u64,
        };
    }
    if FILE_SIZE.is_match(body) {
        return FramegateError::FileSizeLimit(truncate(body));
    }
    if SEEK_TIME.is_match(body) {
        return FramegateError::SeekTimeError(truncate(body));
    }
    if INVALID_MODE.is_match(body) {
        return FramegateError::InvalidModeError(truncate(body));
    }
    if FORMAT_INVALID.is_match(body) {
        return FramegateError::FormatError(truncate(body));
    }
    FramegateError::ParameterError(truncate(body))
}

fn truncate(body: &str) -> String {
    const MAX: usize = 256;
    if body.len() <= MAX {
        body.trim().to_string()
    } else {
        let mut cut = MAX;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &body[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_duration_upper_bound() {
        let err = classify_bad_request(
            "duration: attribute must be between 100ms and 46.066933s",
        );
        assert!(matches!(err, FramegateError::DurationLimit { max_seconds: 46 }));
    }

    #[test]
    fn whole_second_bounds_stay_intact() {
        let err = classify_bad_request("duration: attribute must be between 1ms and 30s");
        assert!(matches!(err, FramegateError::DurationLimit { max_seconds: 30 }));
    }

    #[test]
    fn classifies_seek_mode_and_format_errors() {
        assert!(matches!(
            classify_bad_request("time parameter exceeds video duration"),
            FramegateError::SeekTimeError(_)
        ));
        assert!(matches!(
            classify_bad_request("invalid transformation mode requested"),
            FramegateError::InvalidModeError(_)
        ));
        assert!(matches!(
            classify_bad_request("output format is invalid for this asset"),
            FramegateError::FormatError(_)
        ));
    }

    #[test]
    fn file_size_bodies_map_to_the_size_limit_kind() {
        assert!(matches!(
            classify_bad_request("file size limit exceeded (256MiB)"),
            FramegateError::FileSizeLimit(_)
        ));
    }

    #[test]
    fn unknown_bodies_fall_back_to_parameter_error() {
        assert!(matches!(
            classify_bad_request("something else entirely"),
            FramegateError::ParameterError(_)
        ));
    }
}
