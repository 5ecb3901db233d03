use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

pub const WS_PING: &str = "__ping__";
pub const WS_PONG: &str = "__pong__";
pub const WS_REJECT_PAIR: &str = "__reject__";
pub const WS_ACCEPT_PAIR: &str = "__accept__";

pub const REASON_QR_NOT_SCANNED: &str = "QR code was not scanned in the required time";
pub const REASON_ALREADY_AUTHORIZED: &str = "Instance already authorized";

const PNG_DATA_URL_PREFIX: &str = "data:image/png;base64,";

/// Pairing progress pushed to the browser or returned to a poller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthMessage {
    Qr {
        #[serde(rename = "imageQrCode")]
        image_qr_code: String,
    },
    Error {
        reason: String,
    },
    Account {
        wid: String,
    },
}

impl AuthMessage {
    #[must_use]
    pub fn qr_png(png: &[u8]) -> Self {
        Self::Qr {
            image_qr_code: png_data_url(png),
        }
    }

    #[must_use]
    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error {
            reason: reason.into(),
        }
    }

    /// Terminal messages are consumed once; a `qr` frame stays readable until the
    /// next rotation replaces it.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Account { .. })
    }
}

/// Text frames a browser may send over the pairing socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientControlFrame {
    Ping,
    RejectPair,
    AcceptPair,
}

impl ClientControlFrame {
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            WS_PING => Some(Self::Ping),
            WS_REJECT_PAIR => Some(Self::RejectPair),
            WS_ACCEPT_PAIR => Some(Self::AcceptPair),
            _ => None,
        }
    }
}

#[must_use]
pub fn png_data_url(png: &[u8]) -> String {
    format!("{PNG_DATA_URL_PREFIX}{}", STANDARD.encode(png))
}
