//! Secret handling utilities.
//!
//! Re-exports secrecy types and provides a redaction helper so broker URLs
//! can appear in logs without their credentials.

pub use secrecy::{ExposeSecret, SecretString};

/// Render a connection URL with any `user:password@` section masked.
///
/// `redis://:hunter2@cache:6379/0` becomes `redis://***@cache:6379/0`.
pub fn redacted_url(url: &SecretString) -> String {
    let raw = url.expose_secret();
    let Some((scheme, rest)) = raw.split_once("://") else {
        return "***".to_string();
    };
    match rest.rsplit_once('@') {
        Some((_, host)) => format!("{scheme}://***@{host}"),
        None => format!("{scheme}://{rest}"),
    }
}
