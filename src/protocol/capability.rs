//! Capability names and negotiation

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Optional protocol features a session may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    BitmapCache,
    Compression,
    Clipboard,
    Audio,
    Printer,
    FileTransfer,
    VideoCodec,
    MultiMonitor,
    SmartCard,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BitmapCache => "bitmap_cache",
            Self::Compression => "compression",
            Self::Clipboard => "clipboard",
            Self::Audio => "audio",
            Self::Printer => "printer",
            Self::FileTransfer => "file_transfer",
            Self::VideoCodec => "video_codec",
            Self::MultiMonitor => "multi_monitor",
            Self::SmartCard => "smart_card",
        }
    }
}

impl std::str::FromStr for Capability {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bitmap_cache" => Ok(Self::BitmapCache),
            "compression" => Ok(Self::Compression),
            "clipboard" => Ok(Self::Clipboard),
            "audio" => Ok(Self::Audio),
            "printer" => Ok(Self::Printer),
            "file_transfer" => Ok(Self::FileTransfer),
            "video_codec" => Ok(Self::VideoCodec),
            "multi_monitor" => Ok(Self::MultiMonitor),
            "smart_card" => Ok(Self::SmartCard),
            _ => Err(ProtocolError::UnknownCapability {
                name: s.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Intersect the client's requested names with what the server supports.
///
/// Unknown names are skipped, never an error. The result keeps the client's
/// request order and contains no duplicates.
pub fn negotiate<S: AsRef<str>>(requested: &[S], supported: &[Capability]) -> Vec<Capability> {
    let mut negotiated = Vec::new();

    for name in requested {
        let name = name.as_ref();
        match name.parse::<Capability>() {
            Ok(cap) if supported.contains(&cap) && !negotiated.contains(&cap) => {
                negotiated.push(cap);
            }
            Ok(cap) => {
                tracing::debug!("Capability {} not offered by server", cap);
            }
            Err(e) => {
                tracing::debug!("Ignoring requested capability: {}", e);
            }
        }
    }

    negotiated
}

/// Capability names in wire form
pub fn names<'a, I: IntoIterator<Item = &'a Capability>>(caps: I) -> Vec<String> {
    caps.into_iter().map(|c| c.as_str().to_string()).collect()
}
