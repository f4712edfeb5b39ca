//! Out-of-band association URL codec (SPEC_FULL.md 6): encodes/decodes an
//! `OutOfBandAssociationToken` as the `oobData` query parameter of an
//! association kickoff URL.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::error::{CoreError, CoreResult};
use crate::model::OutOfBandAssociationToken;

const TOKEN_LEN: usize = 16 + 12 + 12 + 16;

fn token_to_bytes(token: &OutOfBandAssociationToken) -> [u8; TOKEN_LEN] {
    let mut out = [0u8; TOKEN_LEN];
    out[0..16].copy_from_slice(&token.encryption_key);
    out[16..28].copy_from_slice(&token.mobile_iv);
    out[28..40].copy_from_slice(&token.ihu_iv);
    out[40..56].copy_from_slice(&token.device_identifier);
    out
}

fn token_from_bytes(bytes: &[u8]) -> CoreResult<OutOfBandAssociationToken> {
    if bytes.len() != TOKEN_LEN {
        return Err(CoreError::CannotParseMessage);
    }
    let mut encryption_key = [0u8; 16];
    let mut mobile_iv = [0u8; 12];
    let mut ihu_iv = [0u8; 12];
    let mut device_identifier = [0u8; 16];
    encryption_key.copy_from_slice(&bytes[0..16]);
    mobile_iv.copy_from_slice(&bytes[16..28]);
    ihu_iv.copy_from_slice(&bytes[28..40]);
    device_identifier.copy_from_slice(&bytes[40..56]);
    Ok(OutOfBandAssociationToken { encryption_key, mobile_iv, ihu_iv, device_identifier })
}

/// Encodes a token as the URL-safe base64 value of the `oobData` parameter.
pub fn encode_oob_data(token: &OutOfBandAssociationToken) -> String {
    URL_SAFE_NO_PAD.encode(token_to_bytes(token))
}

/// Decodes an `oobData` parameter value. The value may have passed through
/// a URL-component encoder on the way here, so it is percent-decoded first;
/// only then is the URL-safe alphabet (`-`/`_`) normalized back to standard
/// base64 (`+`/`/`), per SPEC_FULL.md 8 property 10.
pub fn decode_oob_data(value: &str) -> CoreResult<OutOfBandAssociationToken> {
    let percent_decoded = urlencoding::decode(value).map_err(|_| CoreError::CannotParseMessage)?;
    let normalized = percent_decoded.replace('-', "+").replace('_', "/");
    let bytes = base64::engine::general_purpose::STANDARD_NO_PAD
        .decode(normalized.trim_end_matches('='))
        .map_err(|_| CoreError::CannotParseMessage)?;
    token_from_bytes(&bytes)
}
