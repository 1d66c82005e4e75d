//! Built-in dissectors
//!
//! Provides:
//! - `raw`: byte-count rendering of whatever arrived
//! - `tls`: TLS record headers, no decryption
//! - `bubuta`: the Bubuta chat protocol

#[cfg(feature = "bubuta")]
pub mod bubuta;
pub mod raw;
#[cfg(feature = "tls")]
pub mod tls;

use crate::protocol::Plugin;

/// Descriptors of every plugin compiled into the crate
pub fn builtin() -> Vec<Plugin> {
    let mut plugins = vec![raw::PLUGIN];
    #[cfg(feature = "tls")]
    plugins.push(tls::PLUGIN);
    #[cfg(feature = "bubuta")]
    plugins.push(bubuta::PLUGIN);
    plugins
}
