//! Firmware image versions

use std::{fmt, str::FromStr};

use thiserror::Error;

/// Release tags look like `link-keeper-v1.4.2`
const TAG_PREFIX: &str = "link-keeper-";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("expected major.minor.patch, got {0:?}")]
    Shape(String),
    #[error("{field} component {value:?} is not a number")]
    Component { field: &'static str, value: String },
}

/// Ordered by major, then minor, then patch
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub fn parse(text: &str) -> Result<Self, VersionError> {
        text.parse()
    }

    pub fn is_newer_than(&self, other: &Version) -> bool {
        self > other
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        // Image headers NUL-pad the field
        let bare = text.trim_matches(char::from(0)).trim();
        let bare = bare.strip_prefix(TAG_PREFIX).unwrap_or(bare);
        let bare = bare.strip_prefix('v').unwrap_or(bare);

        let mut fields = bare.split('.');
        let (Some(major), Some(minor), Some(patch), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(VersionError::Shape(bare.to_string()));
        };

        let number = |field: &'static str, value: &str| {
            value.parse::<u32>().map_err(|_| VersionError::Component {
                field,
                value: value.to_string(),
            })
        };
        Ok(Version {
            major: number("major", major)?,
            minor: number("minor", minor)?,
            patch: number("patch", patch)?,
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
