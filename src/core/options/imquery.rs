// src/core/options/imquery.rs

//! Maps Akamai-compatible IMQuery responsive hints onto named derivatives.
//!
//! `imwidth`/`imheight` describe the layout slot the client intends to fill.
//! Rather than fingerprinting every distinct hint, hints are bucketed onto the
//! nearest derivative preset so that nearby widths coalesce onto one artifact.

use crate::config::ImQueryConfig;
use crate::core::FramegateError;

/// The raw responsive hints carried by one request.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImQueryHint {
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl ImQueryHint {
    /// Parses an `imref` value of the form `w=800,h=450` and absorbs any
    /// dimension hints it carries. Unknown keys are ignored.
    pub fn absorb_imref(&mut self, imref: &str) -> Result<(), FramegateError> {
        for part in imref.split(',') {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            match key.trim() {
                "w" | "width" => {
                    let parsed: u32 = value.trim().parse().map_err(|_| {
                        FramegateError::Validation(format!("invalid imref width '{value}'"))
                    })?;
                    self.width.get_or_insert(parsed);
                }
                "h" | "height" => {
                    let parsed: u32 = value.trim().parse().map_err(|_| {
                        FramegateError::Validation(format!("invalid imref height '{value}'"))
                    })?;
                    self.height.get_or_insert(parsed);
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Buckets the hint onto a derivative name using the configured breakpoints.
    /// Width wins when both hints are present. Returns `None` when no hint is set.
    pub fn map_to_derivative(&self, config: &ImQueryConfig) -> Option<&'static str> {
        if let Some(width) = self.width {
            return Some(if width <= config.mobile_max_width {
                "mobile"
            } else if width <= config.tablet_max_width {
                "tablet"
            } else {
                "desktop"
            });
        }
        if let Some(height) = self.height {
            return Some(if height <= config.mobile_max_height {
                "mobile"
            } else if height <= config.tablet_max_height {
                "tablet"
            } else {
                "desktop"
            });
        }
        None
    }
}
