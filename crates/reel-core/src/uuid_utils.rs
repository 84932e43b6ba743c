//! UUID v7 utilities for time-ordered job identifiers.

use uuid::Uuid;

/// Generate a new UUIDv7 identifier.
///
/// Job ids embed their creation time in the first 48 bits, so sorting ids
/// approximates enqueue order.
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}
