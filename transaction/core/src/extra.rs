// Copyright (c) 2024 The Umbra Project

//! The transaction `extra` field.
//!
//! `extra` is a byte string holding a concatenation of self-describing
//! records: the transaction public key, free-form nonces (payment ids),
//! merge-mining tags and zero padding. The writer re-emits records in the
//! order supplied; the parser keeps going until the bytes run out or an
//! unknown tag is hit.

use crate::{error::ExtraError, Hash};

/// Record tag: zero padding.
pub const TX_EXTRA_TAG_PADDING: u8 = 0x00;
/// Record tag: transaction public key.
pub const TX_EXTRA_TAG_PUBKEY: u8 = 0x01;
/// Record tag: length-prefixed nonce.
pub const TX_EXTRA_TAG_NONCE: u8 = 0x02;
/// Record tag: merge-mining tag.
pub const TX_EXTRA_TAG_MERGE_MINING: u8 = 0x03;

/// Nonce sub-tag marking a 32-byte payment id.
pub const TX_EXTRA_NONCE_PAYMENT_ID: u8 = 0x00;

const TX_EXTRA_PADDING_MAX_COUNT: usize = 255;
const TX_EXTRA_NONCE_MAX_COUNT: usize = 255;

/// A parsed record of the `extra` field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExtraField {
    /// A run of zero bytes (the tag byte included in the count).
    Padding {
        /// Total length of the run.
        count: usize,
    },
    /// The transaction public key.
    PublicKey {
        /// The raw 32-byte key.
        key: [u8; 32],
    },
    /// A free-form, length-prefixed blob.
    Nonce {
        /// The nonce payload, at most 255 bytes.
        data: Vec<u8>,
    },
    /// The merge-mining tag.
    MergeMiningTag {
        /// Depth of the branch in the foreign merkle tree.
        depth: u64,
        /// The foreign merkle root.
        merkle_root: Hash,
    },
}

/// What the parser does with a tag it does not know.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UnknownTagPolicy {
    /// Stop parsing; the remainder is an opaque tail. Matches the historical
    /// behavior of the wire format.
    #[default]
    OpaqueTail,
    /// Reject the extra field.
    Error,
}

fn write_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn read_varint(bytes: &[u8], pos: &mut usize) -> Result<u64, ExtraError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(*pos).ok_or(ExtraError::UnexpectedEnd)?;
        *pos += 1;
        if shift == 63 && byte > 1 {
            return Err(ExtraError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(ExtraError::VarintOverflow);
        }
    }
}

/// Parse an `extra` byte string into its records.
pub fn parse_extra(extra: &[u8], policy: UnknownTagPolicy) -> Result<Vec<ExtraField>, ExtraError> {
    let mut fields = Vec::new();
    let mut pos = 0usize;

    while pos < extra.len() {
        let tag = extra[pos];
        pos += 1;
        match tag {
            TX_EXTRA_TAG_PADDING => {
                // The rest of the field must be zero.
                let mut count = 1usize;
                while pos < extra.len() {
                    if extra[pos] != 0 {
                        return Err(ExtraError::NonZeroPadding);
                    }
                    pos += 1;
                    count += 1;
                    if count > TX_EXTRA_PADDING_MAX_COUNT {
                        return Err(ExtraError::PaddingTooLong);
                    }
                }
                fields.push(ExtraField::Padding { count });
            }
            TX_EXTRA_TAG_PUBKEY => {
                let end = pos.checked_add(32).filter(|&end| end <= extra.len());
                let end = end.ok_or(ExtraError::UnexpectedEnd)?;
                let mut key = [0u8; 32];
                key.copy_from_slice(&extra[pos..end]);
                pos = end;
                fields.push(ExtraField::PublicKey { key });
            }
            TX_EXTRA_TAG_NONCE => {
                let len = *extra.get(pos).ok_or(ExtraError::UnexpectedEnd)? as usize;
                pos += 1;
                let end = pos.checked_add(len).filter(|&end| end <= extra.len());
                let end = end.ok_or(ExtraError::UnexpectedEnd)?;
                fields.push(ExtraField::Nonce {
                    data: extra[pos..end].to_vec(),
                });
                pos = end;
            }
            TX_EXTRA_TAG_MERGE_MINING => {
                let depth = read_varint(extra, &mut pos)?;
                let end = pos.checked_add(32).filter(|&end| end <= extra.len());
                let end = end.ok_or(ExtraError::UnexpectedEnd)?;
                let mut merkle_root = [0u8; 32];
                merkle_root.copy_from_slice(&extra[pos..end]);
                pos = end;
                fields.push(ExtraField::MergeMiningTag { depth, merkle_root });
            }
            unknown => match policy {
                UnknownTagPolicy::OpaqueTail => break,
                UnknownTagPolicy::Error => return Err(ExtraError::UnknownTag(unknown)),
            },
        }
    }

    Ok(fields)
}

/// Serialize records back into an `extra` byte string, in the given order.
pub fn serialize_extra(fields: &[ExtraField]) -> Result<Vec<u8>, ExtraError> {
    let mut out = Vec::new();
    for field in fields {
        match field {
            ExtraField::Padding { count } => {
                if *count == 0 || *count > TX_EXTRA_PADDING_MAX_COUNT {
                    return Err(ExtraError::PaddingTooLong);
                }
                out.extend(std::iter::repeat(0u8).take(*count));
            }
            ExtraField::PublicKey { key } => {
                out.push(TX_EXTRA_TAG_PUBKEY);
                out.extend_from_slice(key);
            }
            ExtraField::Nonce { data } => {
                if data.len() > TX_EXTRA_NONCE_MAX_COUNT {
                    return Err(ExtraError::NonceTooLong(data.len()));
                }
                out.push(TX_EXTRA_TAG_NONCE);
                out.push(data.len() as u8);
                out.extend_from_slice(data);
            }
            ExtraField::MergeMiningTag { depth, merkle_root } => {
                out.push(TX_EXTRA_TAG_MERGE_MINING);
                write_varint(*depth, &mut out);
                out.extend_from_slice(merkle_root);
            }
        }
    }
    Ok(out)
}

/// The first transaction public key in the parsed fields.
pub fn get_transaction_public_key(fields: &[ExtraField]) -> Option<[u8; 32]> {
    fields.iter().find_map(|field| match field {
        ExtraField::PublicKey { key } => Some(*key),
        _ => None,
    })
}

/// The first payment id in the parsed fields.
///
/// A payment id is a nonce whose payload is the sub-tag
/// [`TX_EXTRA_NONCE_PAYMENT_ID`] followed by a 32-byte hash.
pub fn get_payment_id(fields: &[ExtraField]) -> Option<Hash> {
    fields.iter().find_map(|field| match field {
        ExtraField::Nonce { data }
            if data.len() == 33 && data[0] == TX_EXTRA_NONCE_PAYMENT_ID =>
        {
            let mut id = [0u8; 32];
            id.copy_from_slice(&data[1..]);
            Some(id)
        }
        _ => None,
    })
}

/// Set the payment id, replacing any existing nonce record.
pub fn set_payment_id(fields: &mut Vec<ExtraField>, payment_id: Hash) {
    let mut data = Vec::with_capacity(33);
    data.push(TX_EXTRA_NONCE_PAYMENT_ID);
    data.extend_from_slice(&payment_id);

    fields.retain(|field| !matches!(field, ExtraField::Nonce { .. }));
    fields.push(ExtraField::Nonce { data });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pubkey_and_payment_id_roundtrip() {
        let fields = vec![
            ExtraField::PublicKey { key: [0x11; 32] },
            ExtraField::Nonce {
                data: {
                    let mut data = vec![TX_EXTRA_NONCE_PAYMENT_ID];
                    data.extend_from_slice(&[0x22; 32]);
                    data
                },
            },
        ];

        let bytes = serialize_extra(&fields).unwrap();
        let parsed = parse_extra(&bytes, UnknownTagPolicy::default()).unwrap();
        assert_eq!(parsed, fields);

        assert_eq!(get_transaction_public_key(&parsed), Some([0x11; 32]));
        assert_eq!(get_payment_id(&parsed), Some([0x22; 32]));
        assert_eq!(serialize_extra(&parsed).unwrap(), bytes);
    }

    #[test]
    fn merge_mining_tag_roundtrip() {
        let fields = vec![ExtraField::MergeMiningTag {
            depth: 300,
            merkle_root: [0xAB; 32],
        }];
        let bytes = serialize_extra(&fields).unwrap();
        assert_eq!(
            parse_extra(&bytes, UnknownTagPolicy::Error).unwrap(),
            fields
        );
    }

    #[test]
    fn unknown_tag_is_opaque_tail_by_default() {
        let mut bytes = serialize_extra(&[ExtraField::PublicKey { key: [1; 32] }]).unwrap();
        bytes.push(0x7f);
        bytes.extend_from_slice(b"junk that is not parseable");

        let parsed = parse_extra(&bytes, UnknownTagPolicy::OpaqueTail).unwrap();
        assert_eq!(parsed, vec![ExtraField::PublicKey { key: [1; 32] }]);

        assert_eq!(
            parse_extra(&bytes, UnknownTagPolicy::Error),
            Err(ExtraError::UnknownTag(0x7f))
        );
    }

    #[test]
    fn padding_must_reach_the_end() {
        let bytes = vec![0, 0, 0, 0];
        assert_eq!(
            parse_extra(&bytes, UnknownTagPolicy::Error).unwrap(),
            vec![ExtraField::Padding { count: 4 }]
        );

        let bytes = vec![0, 0, 9];
        assert_eq!(
            parse_extra(&bytes, UnknownTagPolicy::Error),
            Err(ExtraError::NonZeroPadding)
        );
    }

    #[test]
    fn truncated_fields_are_rejected() {
        assert_eq!(
            parse_extra(&[TX_EXTRA_TAG_PUBKEY, 1, 2], UnknownTagPolicy::Error),
            Err(ExtraError::UnexpectedEnd)
        );
        assert_eq!(
            parse_extra(&[TX_EXTRA_TAG_NONCE, 5, 1], UnknownTagPolicy::Error),
            Err(ExtraError::UnexpectedEnd)
        );
    }

    #[test]
    fn set_payment_id_replaces_existing_nonce() {
        let mut fields = vec![
            ExtraField::PublicKey { key: [3; 32] },
            ExtraField::Nonce {
                data: vec![1, 2, 3],
            },
        ];
        set_payment_id(&mut fields, [0x44; 32]);
        assert_eq!(fields.len(), 2);
        assert_eq!(get_payment_id(&fields), Some([0x44; 32]));
    }

    #[test]
    fn duplicate_fields_keep_the_first() {
        let fields = vec![
            ExtraField::PublicKey { key: [1; 32] },
            ExtraField::PublicKey { key: [2; 32] },
        ];
        let bytes = serialize_extra(&fields).unwrap();
        let parsed = parse_extra(&bytes, UnknownTagPolicy::Error).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(get_transaction_public_key(&parsed), Some([1; 32]));
    }
}
