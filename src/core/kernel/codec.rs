use crate::core::errors::KiwoomError;
use crate::core::types::{Frame, Subscription};
use tokio_tungstenite::tungstenite::Message;

/// Codec trait for venue-specific realtime message encoding/decoding
///
/// The socket session owns the connection lifecycle and routing; a codec only
/// converts between its control requests and the text frames on the wire.
pub trait WsCodec: Send + Sync + 'static {
    /// Encode the login request carrying an access token
    ///
    /// # Arguments
    /// * `token` - Bearer token issued by the token endpoint
    fn encode_login(&self, token: &str) -> Result<Message, KiwoomError>;

    /// Encode a subscription request for one group
    ///
    /// # Arguments
    /// * `subscription` - The group, items and subjects to register
    ///
    /// # Returns
    /// A WebSocket message ready to be sent to the venue
    fn encode_subscription(&self, subscription: &Subscription) -> Result<Message, KiwoomError>;

    /// Encode an unsubscription request for one group
    ///
    /// # Arguments
    /// * `subscription` - The group and subjects to remove
    fn encode_unsubscription(&self, subscription: &Subscription)
        -> Result<Message, KiwoomError>;

    /// Decode one text frame
    ///
    /// Control messages of the transport (ping, pong, close) never reach the
    /// codec. Unknown fields are ignored; malformed frames are a
    /// `DecodeError`.
    fn decode_message(&self, text: &str) -> Result<Frame, KiwoomError>;
}
