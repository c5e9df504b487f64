//! Embeds the auth token into the realtime URL.
//!
//! Two conventions exist. iOS appends the token untouched. Every other platform escapes
//! the base the way `encodeURI` does and the token the way `encodeURIComponent` does.

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use secrecy::{ExposeSecret as _, SecretString};

use super::config::Platform;
use crate::Result;

/// Bytes left alone by `encodeURIComponent`: alphanumerics and `-_.!~*'()`.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// `encodeURI` additionally keeps the reserved characters `;,/?:@&=+$#`.
const URI: &AsciiSet = &URI_COMPONENT
    .remove(b';')
    .remove(b',')
    .remove(b'/')
    .remove(b'?')
    .remove(b':')
    .remove(b'@')
    .remove(b'&')
    .remove(b'=')
    .remove(b'+')
    .remove(b'$')
    .remove(b'#');

/// Returns `<base>?token=<token>` escaped per `platform`.
pub fn build(base: &str, token: &SecretString, platform: Platform) -> Result<String> {
    url::Url::parse(base)?;

    let token = token.expose_secret();
    let endpoint = match platform {
        Platform::Ios => format!("{base}?token={token}"),
        Platform::Android | Platform::Web => format!(
            "{}?token={}",
            utf8_percent_encode(base, URI),
            utf8_percent_encode(token, URI_COMPONENT)
        ),
    };

    Ok(endpoint)
}
