//! Parameter negotiation over an established secure channel

use super::params::TunnelConfig;
use super::{parameter_request, CONTROL_MARKER, REQUEST_FRAME_LEN};
use crate::cancel::CancelToken;
use crate::channel::SecureChannel;
use crate::config::TunnelSettings;
use crate::error::{ChannelError, Result, VpnError};

/// Ask the gateway for tunnel parameters and wait for its answer.
///
/// The request goes out `request_repeats` times since nothing acknowledges
/// it. The reply is the first zero-marked frame carrying printable text;
/// stray or duplicate frames are skipped. A reply that fails to parse aborts
/// the negotiation.
///
/// # Errors
///
/// - [`VpnError::Timeout`] when no reply arrives within `max_handshake_attempts` polls
/// - [`VpnError::InvalidParameter`] when the reply does not parse
/// - [`VpnError::Cancelled`] when `cancel` fires first
/// - the mapped [`ChannelError`] (usually [`VpnError::Io`]) when the channel fails
pub async fn request_parameters<C>(
    channel: &C,
    settings: &TunnelSettings,
    cancel: &CancelToken,
) -> Result<TunnelConfig>
where
    C: SecureChannel + ?Sized,
{
    let request = parameter_request();
    for i in 0..settings.request_repeats {
        channel.write(&request)?;
        if i + 1 < settings.request_repeats && !cancel.sleep(settings.request_spacing).await {
            return Err(VpnError::Cancelled);
        }
    }
    log::debug!("Sent {} parameter requests", settings.request_repeats);

    for _ in 0..settings.max_handshake_attempts {
        if !cancel.sleep(settings.idle_interval).await {
            return Err(VpnError::Cancelled);
        }

        loop {
            let frame = match channel.read(REQUEST_FRAME_LEN) {
                Ok(frame) => frame,
                Err(ChannelError::WouldBlock) => break,
                Err(e) => return Err(e.into()),
            };

            if let Some(text) = parameter_text(&frame) {
                log::info!("Received parameters: {text}");
                return TunnelConfig::parse(text);
            }
            log::trace!("Skipping frame during negotiation: {}", hex::encode(&frame));
        }
    }

    Err(VpnError::Timeout(format!(
        "no parameters after {} polls",
        settings.max_handshake_attempts
    )))
}

/// Payload of a parameter frame, if `frame` looks like one
fn parameter_text(frame: &[u8]) -> Option<&str> {
    let (&marker, payload) = frame.split_first()?;
    if marker != CONTROL_MARKER {
        return None;
    }
    let text = std::str::from_utf8(payload).ok()?;
    let text = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    let printable = text.bytes().all(|b| b.is_ascii_graphic() || b == b' ');
    (!text.is_empty() && printable).then_some(text)
}
