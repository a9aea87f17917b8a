//! # relay-protocol
//!
//! Wire message definitions for the Relay chat hub.
//!
//! Every frame exchanged with a client is a single JSON object. The `type`
//! field selects the interpretation:
//!
//! - *(missing or empty)* - Plain chat message (`username`, `text`)
//! - `user_info` - Client announces its identity
//! - `update_info` - Client changes its identity
//! - `user_list` - Server pushes the full roster (`users`)
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, Message};
//!
//! let message = Message::chat("alice", "hello");
//!
//! let encoded = codec::encode(&message).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(message, decoded);
//! ```

pub mod codec;
pub mod message;

pub use codec::{decode, encode, ProtocolError};
pub use message::{Message, MessageType, UserInfo, SYSTEM_USERNAME};
