//! Control-plane framing shared by the handshake and the forwarder
//!
//! Every frame on the secure channel is either a control frame, whose first
//! byte is [`CONTROL_MARKER`], or a data frame carrying a raw IP packet. IP
//! packets start with the version nibble, so their first byte is never zero.

pub mod handshake;
pub mod params;

pub use handshake::request_parameters;
pub use params::{TunnelConfig, DEFAULT_MTU};

// Protocol constants
pub const CONTROL_MARKER: u8 = 0x00;

/// Size of the parameter request frame; the gateway reads a fixed buffer
pub const REQUEST_FRAME_LEN: usize = 1024;

/// Largest frame read from either endpoint (16-bit range halved for headers)
pub const MAX_PACKET_SIZE: usize = (i16::MAX / 2 - 1) as usize;

/// Second byte of a two-byte control frame
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Keepalive / no-op
    Zero = 0,
    WantConnect = 1,
    WantDisconnect = 2,
}

impl ControlMessage {
    pub fn frame(self) -> [u8; 2] {
        [CONTROL_MARKER, self as u8]
    }

    /// Decode a two-byte control frame
    pub fn from_frame(frame: &[u8]) -> Option<Self> {
        match frame {
            [CONTROL_MARKER, 0] => Some(ControlMessage::Zero),
            [CONTROL_MARKER, 1] => Some(ControlMessage::WantConnect),
            [CONTROL_MARKER, 2] => Some(ControlMessage::WantDisconnect),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Control,
    Data,
}

/// Classify a frame by its leading byte. Empty frames count as control.
pub fn classify(frame: &[u8]) -> FrameKind {
    match frame.first() {
        Some(&b) if b != CONTROL_MARKER => FrameKind::Data,
        _ => FrameKind::Control,
    }
}

/// Single-byte keepalive frame
pub fn keepalive_frame() -> [u8; 1] {
    [CONTROL_MARKER]
}

/// Parameter request: the marker followed by zero padding
pub fn parameter_request() -> Vec<u8> {
    let mut frame = vec![0u8; REQUEST_FRAME_LEN];
    frame[0] = CONTROL_MARKER;
    frame
}
