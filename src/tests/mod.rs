//! Cross-component lifecycle tests, driven through the hub's public
//! surface the way a transport driver would drive it.

mod lifecycle;
mod store_recovery;
