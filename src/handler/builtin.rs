//! Built-in request handlers.

use super::RequestHandler;
use bytes::Bytes;

/// Responds with the request bytes sorted in ascending order.
///
/// `"hello"` becomes `"ehllo"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SortHandler;

impl RequestHandler for SortHandler {
    fn handle(&self, payload: &[u8]) -> Bytes {
        let mut sorted = payload.to_vec();
        sorted.sort_unstable();
        Bytes::from(sorted)
    }
}

/// Responds with the request unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl RequestHandler for EchoHandler {
    fn handle(&self, payload: &[u8]) -> Bytes {
        Bytes::copy_from_slice(payload)
    }
}
