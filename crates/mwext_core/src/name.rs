use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::error::MwError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ExtensionKind {
    Unknown,
    Extension,
    Skin,
}

impl ExtensionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Extension => "Extension",
            Self::Skin => "Skin",
        }
    }

    /// Folder under the installation root holding packages of this kind.
    pub fn folder_name(self) -> Option<&'static str> {
        match self {
            Self::Unknown => None,
            Self::Extension => Some("extensions"),
            Self::Skin => Some("skins"),
        }
    }

    pub fn manifest_file_name(self) -> Option<&'static str> {
        match self {
            Self::Unknown => None,
            Self::Extension => Some("extension.json"),
            Self::Skin => Some("skin.json"),
        }
    }

    /// Case-insensitive parse of a kind prefix.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "unknown" => Some(Self::Unknown),
            "extension" => Some(Self::Extension),
            "skin" => Some(Self::Skin),
            _ => None,
        }
    }

    /// True when a name of kind `self` may stand for a package of `other`.
    pub fn admits(self, other: Self) -> bool {
        self == Self::Unknown || self == other
    }
}

impl fmt::Display for ExtensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `Kind:Name` identity of an extension or skin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExtensionName {
    name: String,
    kind: ExtensionKind,
}

impl ExtensionName {
    pub fn new(name: impl Into<String>, kind: ExtensionKind) -> Result<Self, MwError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(MwError::invalid_name(name, "name cannot be empty"));
        }
        Ok(Self { name, kind })
    }

    pub fn parse(text: &str) -> Result<Self, MwError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(MwError::invalid_name(text, "name cannot be empty"));
        }
        match trimmed.split_once(':') {
            None => Self::new(trimmed, ExtensionKind::Unknown),
            Some((prefix, name)) => {
                let kind = ExtensionKind::parse(prefix).ok_or_else(|| {
                    MwError::invalid_name(text, format!("unrecognized kind prefix {prefix:?}"))
                })?;
                Self::new(name, kind).map_err(|_| MwError::invalid_name(text, "name cannot be empty"))
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ExtensionKind {
        self.kind
    }

    pub fn with_kind(&self, kind: ExtensionKind) -> Self {
        Self {
            name: self.name.clone(),
            kind,
        }
    }

    /// Title of the package's documentation page on the registry wiki.
    /// Unknown names have no single page; callers expand them first.
    pub fn page_title(&self) -> Option<String> {
        match self.kind {
            ExtensionKind::Unknown => None,
            kind => Some(format!("{kind}:{}", self.name)),
        }
    }
}

impl fmt::Display for ExtensionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ExtensionKind::Unknown => f.write_str(&self.name),
            kind => write!(f, "{kind}:{}", self.name),
        }
    }
}

impl FromStr for ExtensionName {
    type Err = MwError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl Serialize for ExtensionName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// The registry's view of an installable package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteExtensionDescriptor {
    pub name: ExtensionName,
}
