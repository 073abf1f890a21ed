//! Call control for callbridge.
//!
//! Places outbound calls through the Twilio REST API and renders the TwiML
//! that points a connected call at the bridge's media-stream endpoint. The
//! bridge never talks to the provider during a call; once the stream is
//! open, everything flows over the WebSocket.

pub mod config;
pub mod error;
pub mod gateway;
pub mod twiml;

pub use config::TwilioConfig;
pub use error::TelephonyError;
pub use gateway::{CallGateway, OutboundCall, PlacedCall, TwilioGateway};
pub use twiml::connect_stream_twiml;
