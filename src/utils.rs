use anyhow::{bail, Context, Result};
use prost::Message;

/// Encode a key made of a one byte prefix followed by a big-endian u64.
///
/// Keys sharing a prefix sort by the encoded value, so a partition tree can be range scanned by
/// offset. Every key in a tree using prefixed keys must carry a prefix.
pub fn encode_byte_prefix(prefix: &[u8; 1], offset: u64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = prefix[0];
    key[1..].copy_from_slice(&encode_u64(offset));
    key
}

/// Decode the offset of a key produced by `encode_byte_prefix`.
pub fn decode_byte_prefix(key: &[u8]) -> Result<u64> {
    match key {
        [_prefix, rest @ ..] => decode_u64(rest),
        _ => bail!("invalid prefix key given to decode, key is empty"),
    }
}

/// Encode the given u64 as an array of big-endian bytes.
pub fn encode_u64(val: u64) -> [u8; 8] {
    val.to_be_bytes()
}

/// Decode the given bytes as a u64.
pub fn decode_u64(val: &[u8]) -> Result<u64> {
    match val {
        [b0, b1, b2, b3, b4, b5, b6, b7] => Ok(u64::from_be_bytes([*b0, *b1, *b2, *b3, *b4, *b5, *b6, *b7])),
        _ => bail!("invalid byte array given to decode as u64, invalid len {} needed 8", val.len()),
    }
}

/// Encode the given model into a bytes vec.
pub fn encode_model<M: Message>(model: &M) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(model.encoded_len());
    model.encode(&mut buf).context("error serializing data model")?;
    Ok(buf)
}

/// Decode a model from the given buffer.
pub fn decode_model<M: Message + Default>(data: &[u8]) -> Result<M> {
    M::decode(data).context("error decoding data model")
}
