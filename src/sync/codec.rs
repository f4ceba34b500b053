//! Conversion between transport frames and raw binary buffers.
//!
//! Transports that carry raw binary frames pass bytes through untouched. Text
//! transports carry the same bytes as standard base64.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;

/// Errors raised while turning a frame back into bytes
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    #[error("Invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("Empty frame")]
    Empty,
}

/// How binary payloads cross the transport boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireMode {
    /// Raw binary frames
    #[default]
    Binary,
    /// Base64 inside text frames
    Text,
}

impl std::str::FromStr for WireMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binary" | "bin" => Ok(WireMode::Binary),
            "text" | "base64" => Ok(WireMode::Text),
            other => Err(format!("unknown wire mode: {}", other)),
        }
    }
}

/// A frame in the transport's native encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Binary(Bytes),
    Text(String),
}

impl WireFrame {
    /// Wrap raw bytes for the given wire mode
    pub fn encode(data: impl Into<Bytes>, mode: WireMode) -> Self {
        let data = data.into();
        match mode {
            WireMode::Binary => WireFrame::Binary(data),
            WireMode::Text => WireFrame::Text(STANDARD.encode(&data)),
        }
    }

    /// Recover the raw bytes carried by this frame
    pub fn decode(&self) -> Result<Bytes, CodecError> {
        let data = match self {
            WireFrame::Binary(data) => data.clone(),
            WireFrame::Text(text) => Bytes::from(STANDARD.decode(text.trim())?),
        };

        if data.is_empty() {
            return Err(CodecError::Empty);
        }

        Ok(data)
    }

    pub fn len(&self) -> usize {
        match self {
            WireFrame::Binary(data) => data.len(),
            WireFrame::Text(text) => text.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_passthrough() {
        let frame = WireFrame::encode(vec![1u8, 2, 3], WireMode::Binary);
        assert_eq!(frame, WireFrame::Binary(Bytes::from_static(&[1, 2, 3])));
        assert_eq!(frame.decode().unwrap().as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn test_text_mode_is_base64() {
        let frame = WireFrame::encode(b"hello".to_vec(), WireMode::Text);
        assert_eq!(frame, WireFrame::Text("aGVsbG8=".to_string()));
        assert_eq!(frame.decode().unwrap().as_ref(), b"hello");
    }

    #[test]
    fn test_invalid_base64() {
        let frame = WireFrame::Text("not base64!!".to_string());
        assert!(matches!(frame.decode(), Err(CodecError::InvalidBase64(_))));
    }

    #[test]
    fn test_empty_frame_rejected() {
        let frame = WireFrame::Binary(Bytes::new());
        assert!(matches!(frame.decode(), Err(CodecError::Empty)));
        assert!(frame.is_empty());
    }

    #[test]
    fn test_wire_mode_parse() {
        assert_eq!("binary".parse::<WireMode>().unwrap(), WireMode::Binary);
        assert_eq!("Base64".parse::<WireMode>().unwrap(), WireMode::Text);
        assert!("morse".parse::<WireMode>().is_err());
    }
}
