//! # seqline-shared
//!
//! Types and wire contracts shared by the seqline server and client:
//! chat/message identity, the pts sync protocol, cursor pages, realtime
//! frames and the error code taxonomy.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod realtime;
pub mod types;

pub use error::ErrorCode;
pub use types::{ChatId, GroupId, Message, MessageId, MessageKind, MessageStatus, UserId};
