// evkv-common - Reply values and RESP2 framing for the EvKV client
//
// The client core only ever sees `Reply`; the codec lives here so that any
// transport speaking RESP2 can reuse it.

pub mod error;
pub mod reply;
pub mod resp;

// Re-export for convenience
pub use error::*;
pub use reply::*;
pub use resp::{encode_command, RespDecoder, RespValue, DEFAULT_MAX_BULK_LEN};
