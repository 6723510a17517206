//! Version formats and raw-version rendering.
//!
//! Hardware reports versions as raw integers; the format controls how the
//! raw value renders as a user-visible string. Devices with unusual
//! encodings override the `convert_version` hook instead.

use serde::{Deserialize, Serialize};

/// How a raw integer version renders as a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VersionFormat {
    /// Unknown; raw values render as plain decimal
    #[default]
    Unknown,
    /// An unstructured string taken verbatim
    Plain,
    /// A single decimal number
    Number,
    /// Two 16-bit fields: `AABB.CCDD`
    Pair,
    /// `AA.BB.CCDD` from a 32-bit value
    Triplet,
    /// Four 8-bit fields: `AA.BB.CC.DD`
    Quad,
    /// Binary-coded decimal, two digits per byte
    Bcd,
    /// Hexadecimal with `0x` prefix
    Hex,
}

impl VersionFormat {
    /// Look up a format from its kebab-case name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "unknown" => Some(Self::Unknown),
            "plain" => Some(Self::Plain),
            "number" => Some(Self::Number),
            "pair" => Some(Self::Pair),
            "triplet" => Some(Self::Triplet),
            "quad" => Some(Self::Quad),
            "bcd" => Some(Self::Bcd),
            "hex" => Some(Self::Hex),
            _ => None,
        }
    }

    /// The kebab-case name of this format.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Plain => "plain",
            Self::Number => "number",
            Self::Pair => "pair",
            Self::Triplet => "triplet",
            Self::Quad => "quad",
            Self::Bcd => "bcd",
            Self::Hex => "hex",
        }
    }

    /// Render a raw version using this format.
    ///
    /// Structured formats interpret the low 32 bits, matching how hardware
    /// reports them.
    pub fn render(&self, raw: u64) -> String {
        let v = raw as u32;
        match self {
            Self::Unknown | Self::Plain | Self::Number => format!("{raw}"),
            Self::Pair => format!("{}.{}", v >> 16, v & 0xffff),
            Self::Triplet => {
                format!("{}.{}.{}", (v >> 24) & 0xff, (v >> 16) & 0xff, v & 0xffff)
            }
            Self::Quad => format!(
                "{}.{}.{}.{}",
                (v >> 24) & 0xff,
                (v >> 16) & 0xff,
                (v >> 8) & 0xff,
                v & 0xff
            ),
            Self::Bcd => {
                let digits: Vec<String> = v
                    .to_be_bytes()
                    .iter()
                    .map(|b| format!("{}", u32::from(b >> 4) * 10 + u32::from(b & 0xf)))
                    .collect();
                digits.join(".")
            }
            Self::Hex => format!("{v:#010x}"),
        }
    }
}

impl std::fmt::Display for VersionFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
