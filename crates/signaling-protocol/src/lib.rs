//! Client signaling protocol for the SFU.
//!
//! Every frame on the client connection is a JSON text message shaped as
//! `{event, data, id?}`. `id` correlates a request with its direct response;
//! pushed room events carry none.
//!
//! - [`messages`]: typed client requests and server events
//! - [`codec`]: decoding with size limits, encoding with correlation ids

#![warn(clippy::pedantic)]

pub mod codec;
pub mod messages;

pub use codec::{
    decode_event, decode_request, encode_event, encode_request, CorrelationId, InboundEnvelope,
    ProtocolError, RejectedFrame,
};
pub use messages::{ClientRequest, NodeRef, ParticipantSummary, ProducerSummary, ServerEvent};
