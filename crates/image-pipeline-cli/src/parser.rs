//! Parsers for request options given on the command line
//!
//! Sizes are written `WIDTHxHEIGHT` (`640x480`) or as a single number for a
//! square box (`256`). Rotations are `0`, `90`, `180` or `270`.

use image_pipeline_core::request::{ResizeOptions, RotationOptions};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Empty size")]
    EmptySize,

    #[error("Invalid size '{input}': {message}")]
    InvalidSize { input: String, message: String },

    #[error("Invalid rotation '{input}': expected 0, 90, 180 or 270")]
    InvalidRotation { input: String },
}

fn dimension(input: &str, part: &str) -> Result<u32, ParseError> {
    let value: u32 = part.trim().parse().map_err(|_| ParseError::InvalidSize {
        input: input.to_string(),
        message: format!("'{part}' is not a number"),
    })?;
    if value == 0 {
        return Err(ParseError::InvalidSize {
            input: input.to_string(),
            message: "dimensions must be positive".to_string(),
        });
    }
    Ok(value)
}

/// Parse `WIDTHxHEIGHT` or a single square size
pub fn parse_size(input: &str) -> Result<ResizeOptions, ParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ParseError::EmptySize);
    }
    match trimmed.split_once(['x', 'X']) {
        Some((width, height)) => Ok(ResizeOptions::new(
            dimension(input, width)?,
            dimension(input, height)?,
        )),
        None => Ok(ResizeOptions::for_square_size(dimension(input, trimmed)?)),
    }
}

pub fn parse_rotation(input: &str) -> Result<RotationOptions, ParseError> {
    let invalid = || ParseError::InvalidRotation {
        input: input.to_string(),
    };
    let degrees: u16 = input.trim().parse().map_err(|_| invalid())?;
    if degrees == 0 {
        return Ok(RotationOptions::no_rotation());
    }
    RotationOptions::force_rotation(degrees).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("640x480").unwrap(), ResizeOptions::new(640, 480));
        assert_eq!(parse_size(" 32X16 ").unwrap(), ResizeOptions::new(32, 16));
        assert_eq!(parse_size("256").unwrap(), ResizeOptions::for_square_size(256));
    }

    #[test]
    fn test_parse_size_errors() {
        assert_eq!(parse_size(""), Err(ParseError::EmptySize));
        assert!(matches!(parse_size("0x10"), Err(ParseError::InvalidSize { .. })));
        assert!(matches!(parse_size("axb"), Err(ParseError::InvalidSize { .. })));
        assert!(matches!(parse_size("10x"), Err(ParseError::InvalidSize { .. })));
    }

    #[test]
    fn test_parse_rotation() {
        assert_eq!(parse_rotation("90").unwrap().degrees(), 90);
        assert!(!parse_rotation("0").unwrap().rotation_enabled());
        assert!(matches!(
            parse_rotation("45"),
            Err(ParseError::InvalidRotation { .. })
        ));
        assert!(parse_rotation("left").is_err());
    }
}
