//! Transfer options codec
//!
//! Packs four string fields into a single byte string framed by a 4-byte
//! zero boundary and separated by a 2-byte zero delimiter:
//!
//! ```text
//! \0\0\0\0 file_path \0\0 current_offset \0\0 index \0\0 buffer \0\0\0\0
//! ```
//!
//! Round trips are exact as long as no field contains two consecutive zero
//! bytes.

use crate::domain::errors::DomainError;

/// Frame marker at both ends of an encoded blob
pub const BOUND: &[u8] = b"\x00\x00\x00\x00";

/// Separator between fields
pub const DELIMITER: &[u8] = b"\x00\x00";

const FIELD_COUNT: usize = 4;

/// Options sent along with a chunked file transfer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferOptions {
    pub file_path: String,
    pub current_offset: String,
    pub index: String,
    pub buffer: String,
}

impl TransferOptions {
    /// Encodes the options into their framed byte form
    pub fn encode(&self) -> Vec<u8> {
        let fields = [
            self.file_path.as_bytes(),
            self.current_offset.as_bytes(),
            self.index.as_bytes(),
            self.buffer.as_bytes(),
        ];

        let body_len: usize = fields.iter().map(|f| f.len()).sum();
        let mut out =
            Vec::with_capacity(2 * BOUND.len() + body_len + (FIELD_COUNT - 1) * DELIMITER.len());

        out.extend_from_slice(BOUND);
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                out.extend_from_slice(DELIMITER);
            }
            out.extend_from_slice(field);
        }
        out.extend_from_slice(BOUND);
        out
    }

    /// Decodes a framed byte string produced by [`encode`](Self::encode)
    ///
    /// # Errors
    /// Returns `DomainError::InvalidOptions` if the frame is missing, the
    /// field count is wrong, or a field is not valid UTF-8.
    pub fn decode(bytes: &[u8]) -> Result<Self, DomainError> {
        let body = bytes
            .strip_prefix(BOUND)
            .and_then(|rest| rest.strip_suffix(BOUND))
            .ok_or_else(|| DomainError::InvalidOptions("missing boundary marker".into()))?;

        let fields = split_fields(body);
        if fields.len() != FIELD_COUNT {
            return Err(DomainError::InvalidOptions(format!(
                "expected {FIELD_COUNT} fields, found {}",
                fields.len()
            )));
        }

        let text = |raw: &[u8]| {
            String::from_utf8(raw.to_vec())
                .map_err(|e| DomainError::InvalidOptions(format!("field is not UTF-8: {e}")))
        };

        Ok(Self {
            file_path: text(fields[0])?,
            current_offset: text(fields[1])?,
            index: text(fields[2])?,
            buffer: text(fields[3])?,
        })
    }
}

/// Splits on non-overlapping delimiters, scanning left to right
fn split_fields(body: &[u8]) -> Vec<&[u8]> {
    let mut fields = Vec::with_capacity(FIELD_COUNT);
    let mut start = 0;
    let mut i = 0;

    while i + DELIMITER.len() <= body.len() {
        if &body[i..i + DELIMITER.len()] == DELIMITER {
            fields.push(&body[start..i]);
            i += DELIMITER.len();
            start = i;
        } else {
            i += 1;
        }
    }
    fields.push(&body[start..]);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TransferOptions {
        TransferOptions {
            file_path: "hello world".to_string(),
            current_offset: "4096".to_string(),
            index: "17".to_string(),
            buffer: "1024".to_string(),
        }
    }

    #[test]
    fn test_encode_layout() {
        let encoded = sample().encode();
        assert!(encoded.starts_with(BOUND));
        assert!(encoded.ends_with(BOUND));
        assert_eq!(
            &encoded[4..encoded.len() - 4],
            b"hello world\x00\x004096\x00\x0017\x00\x001024"
        );
    }

    #[test]
    fn test_roundtrip() {
        let options = sample();
        let decoded = TransferOptions::decode(&options.encode()).unwrap();
        assert_eq!(decoded, options);
    }

    #[test]
    fn test_roundtrip_with_empty_fields() {
        let options = TransferOptions {
            file_path: "/sync/a.txt".to_string(),
            ..Default::default()
        };
        let decoded = TransferOptions::decode(&options.encode()).unwrap();
        assert_eq!(decoded, options);

        let empty = TransferOptions::default();
        assert_eq!(TransferOptions::decode(&empty.encode()).unwrap(), empty);
    }

    #[test]
    fn test_decode_rejects_missing_boundary() {
        let err = TransferOptions::decode(b"hello\x00\x00a\x00\x00b\x00\x00c").unwrap_err();
        assert!(matches!(err, DomainError::InvalidOptions(_)));
    }

    #[test]
    fn test_decode_rejects_wrong_field_count() {
        let err = TransferOptions::decode(b"\x00\x00\x00\x00a\x00\x00b\x00\x00\x00\x00").unwrap_err();
        assert_eq!(
            err,
            DomainError::InvalidOptions("expected 4 fields, found 2".to_string())
        );
    }
}
