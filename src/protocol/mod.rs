/// Protocol types for result delivery and broker key naming
///
/// This module defines the wire format of rendezvous replies and the names
/// of the broker keys derived from a service name.
mod keys;
mod reply;

pub use keys::{delay_key, deferred_reply_key, reply_key};
pub use reply::Reply;
