/*!
Length-prefixed frame helpers

Devices receive `NNNNNNNN{json}`: eight zero-padded ASCII digits giving the
byte length of the JSON that follows. The mocks decode with the same rules
as the firmware (length must be in 1..=8192 and match the body).
*/

use anyhow::{bail, Context, Result};
use serde_json::Value;

pub const PREFIX_LEN: usize = 8;
pub const MAX_FRAME_LEN: usize = 8192;

pub fn encode_frame(body: &Value) -> String {
    let json = body.to_string();
    format!("{:08}{}", json.len(), json)
}

pub fn decode_frame(raw: &[u8]) -> Result<Value> {
    if raw.len() < PREFIX_LEN {
        bail!("frame shorter than its prefix ({} bytes)", raw.len());
    }
    let (prefix, body) = raw.split_at(PREFIX_LEN);
    let prefix = std::str::from_utf8(prefix).context("non-ascii length prefix")?;
    let len: usize = prefix.parse().with_context(|| format!("bad length prefix {prefix:?}"))?;
    if len == 0 || len > MAX_FRAME_LEN {
        bail!("frame length {len} out of range");
    }
    if body.len() != len {
        bail!("prefix says {len} bytes, body has {}", body.len());
    }
    Ok(serde_json::from_slice(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rejects_bad_prefixes() {
        assert!(decode_frame(b"0000").is_err());
        assert!(decode_frame(b"00000000{}").is_err());
        assert!(decode_frame(b"00009999{}").is_err());
        assert!(decode_frame(b"abcdefgh{}").is_err());
    }

    #[test]
    fn test_encoded_frame_decodes() {
        let body = serde_json::json!({"type": "sensor", "sensors": {}});
        let frame = encode_frame(&body);
        assert!(frame.starts_with("000000"));
        assert_eq!(decode_frame(frame.as_bytes()).unwrap(), body);
    }
}
