use tokio::sync::mpsc;

use super::SignalingChannel;

/// Create two channels wired back to back.
///
/// Whatever one end sends, the other receives, in order. Closing either end
/// ends the other's receive stream.
pub fn pair(left: &str, right: &str) -> (SignalingChannel, SignalingChannel) {
    let (to_right, from_left) = mpsc::unbounded_channel();
    let (to_left, from_right) = mpsc::unbounded_channel();
    (
        SignalingChannel::from_parts(right, to_right, from_right),
        SignalingChannel::from_parts(left, to_left, from_left),
    )
}
