pub mod message;
pub(crate) mod result;

pub use self::message::{decode, encode, notification, request, response, send_json, Envelope};
pub use self::result::ResultCode;
