//! Message properties: an ordered string-to-string header block.
//!
//! Properties are much like the headers in HTTP or MIME: an ordered mapping
//! from string key to string value, keys unique, insertion order preserved.
//! The order matters because the binary encoding is canonical: two equal
//! property sets encode to identical bytes.
//!
//! # Wire encoding
//!
//! ```text
//! ┌────────────┬──────────────────────────────────────────┐
//! │ block len  │ entries                                  │
//! │ u16 BE     │ [klen u16][key][vlen u16][value] ...     │
//! └────────────┴──────────────────────────────────────────┘
//! ```
//!
//! The leading length counts the entry bytes only, making the block
//! self-delimiting inside a frame payload.
//!
//! # Example
//!
//! ```
//! use framewire::Properties;
//!
//! let mut props = Properties::new();
//! props.set("Profile", "chat");
//! props.set("Content-Type", "text/plain; charset=UTF-8");
//!
//! let encoded = props.encode();
//! let (decoded, consumed) = Properties::decode(&encoded, encoded.len()).unwrap();
//! assert_eq!(consumed, encoded.len());
//! assert_eq!(decoded.get("Profile"), Some("chat"));
//! ```

use crate::error::{FramewireError, Result};

/// Key identifying the purpose of a message, by convention.
pub const PROFILE: &str = "Profile";
/// Key holding the MIME type of the body, by convention.
pub const CONTENT_TYPE: &str = "Content-Type";
/// Key naming an application channel, by convention.
pub const CHANNEL: &str = "Channel";
/// Key carrying the numeric code of an error response.
pub const ERROR_CODE: &str = "Error-Code";
/// Key carrying the error domain of an error response.
pub const ERROR_DOMAIN: &str = "Error-Domain";

/// An ordered, unique-key mapping from string key to string value.
///
/// Mutable only while the owning message is unsent; sending a message
/// consumes it, freezing the properties along with it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: Vec<(String, String)>,
}

impl Properties {
    /// Create an empty property set.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Number of properties.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get the value for a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set a key to a value. Replaces the value in place if the key already
    /// exists (the key keeps its original position); appends otherwise.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Remove a key, returning its value if present.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Encode to the canonical binary block, including the leading length.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for (key, value) in &self.entries {
            body.extend_from_slice(&(key.len() as u16).to_be_bytes());
            body.extend_from_slice(key.as_bytes());
            body.extend_from_slice(&(value.len() as u16).to_be_bytes());
            body.extend_from_slice(value.as_bytes());
        }
        let mut out = Vec::with_capacity(2 + body.len());
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Encoded size in bytes, including the leading length.
    pub fn encoded_len(&self) -> usize {
        2 + self
            .entries
            .iter()
            .map(|(k, v)| 4 + k.len() + v.len())
            .sum::<usize>()
    }

    /// Decode a property block from the front of `buf`.
    ///
    /// Returns the decoded set and the number of bytes consumed. Rejects
    /// blocks whose declared length exceeds `max_size` or runs past the
    /// buffer, truncated entries, non-UTF-8 strings, and duplicate keys,
    /// all as [`FramewireError::BadData`], without reading unbounded input.
    pub fn decode(buf: &[u8], max_size: usize) -> Result<(Self, usize)> {
        if buf.len() < 2 {
            return Err(FramewireError::BadData(
                "property block shorter than its length prefix".to_string(),
            ));
        }
        let declared = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        let total = 2 + declared;
        if total > max_size {
            return Err(FramewireError::BadData(format!(
                "property block of {} bytes exceeds maximum {}",
                total, max_size
            )));
        }
        if total > buf.len() {
            return Err(FramewireError::BadData(
                "property block length runs past the frame payload".to_string(),
            ));
        }

        let mut props = Properties::new();
        let mut pos = 2;
        while pos < total {
            let key = read_string(buf, &mut pos, total)?;
            let value = read_string(buf, &mut pos, total)?;
            if props.get(&key).is_some() {
                return Err(FramewireError::BadData(format!(
                    "duplicate property key {:?}",
                    key
                )));
            }
            props.entries.push((key, value));
        }
        Ok((props, total))
    }
}

fn read_string(buf: &[u8], pos: &mut usize, end: usize) -> Result<String> {
    if *pos + 2 > end {
        return Err(FramewireError::BadData(
            "truncated property entry".to_string(),
        ));
    }
    let len = u16::from_be_bytes([buf[*pos], buf[*pos + 1]]) as usize;
    *pos += 2;
    if *pos + len > end {
        return Err(FramewireError::BadData(
            "property string runs past the block".to_string(),
        ));
    }
    let s = std::str::from_utf8(&buf[*pos..*pos + len])
        .map_err(|_| FramewireError::BadData("property string is not UTF-8".to_string()))?
        .to_string();
    *pos += len;
    Ok(s)
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut props = Properties::new();
        for (k, v) in iter {
            props.set(k, v);
        }
        props
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_remove() {
        let mut props = Properties::new();
        props.set("Profile", "chat");
        props.set("Channel", "lobby");

        assert_eq!(props.get("Profile"), Some("chat"));
        assert_eq!(props.get("Channel"), Some("lobby"));
        assert_eq!(props.get("missing"), None);
        assert_eq!(props.len(), 2);

        assert_eq!(props.remove("Profile"), Some("chat".to_string()));
        assert_eq!(props.get("Profile"), None);
        assert_eq!(props.len(), 1);
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut props = Properties::new();
        props.set("a", "1");
        props.set("b", "2");
        props.set("a", "3");

        let order: Vec<_> = props.iter().collect();
        assert_eq!(order, vec![("a", "3"), ("b", "2")]);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut props = Properties::new();
        props.set("Profile", "chat");
        props.set("Content-Type", "text/plain; charset=UTF-8");
        props.set("empty", "");

        let encoded = props.encode();
        assert_eq!(encoded.len(), props.encoded_len());

        let (decoded, consumed) = Properties::decode(&encoded, 4096).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, props);
    }

    #[test]
    fn test_encoding_is_canonical() {
        let mut a = Properties::new();
        a.set("x", "1");
        a.set("y", "2");
        let mut b = Properties::new();
        b.set("x", "1");
        b.set("y", "2");
        assert_eq!(a.encode(), b.encode());

        // Different insertion order encodes differently.
        let mut c = Properties::new();
        c.set("y", "2");
        c.set("x", "1");
        assert_ne!(a.encode(), c.encode());
    }

    #[test]
    fn test_empty_block() {
        let props = Properties::new();
        let encoded = props.encode();
        assert_eq!(encoded, vec![0, 0]);

        let (decoded, consumed) = Properties::decode(&encoded, 4096).unwrap();
        assert_eq!(consumed, 2);
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_decode_leaves_trailing_bytes() {
        let mut props = Properties::new();
        props.set("k", "v");
        let mut encoded = props.encode();
        let block_len = encoded.len();
        encoded.extend_from_slice(b"body bytes follow");

        let (decoded, consumed) = Properties::decode(&encoded, 4096).unwrap();
        assert_eq!(consumed, block_len);
        assert_eq!(decoded.get("k"), Some("v"));
    }

    #[test]
    fn test_decode_rejects_oversized_block() {
        let mut props = Properties::new();
        props.set("key", "value");
        let encoded = props.encode();

        let result = Properties::decode(&encoded, 4);
        assert!(matches!(result, Err(FramewireError::BadData(_))));
    }

    #[test]
    fn test_decode_rejects_truncated_block() {
        let mut props = Properties::new();
        props.set("key", "value");
        let encoded = props.encode();

        let result = Properties::decode(&encoded[..encoded.len() - 1], 4096);
        assert!(matches!(result, Err(FramewireError::BadData(_))));
    }

    #[test]
    fn test_decode_rejects_duplicate_keys() {
        // Hand-build a block with "k" twice.
        let mut body = Vec::new();
        for _ in 0..2 {
            body.extend_from_slice(&1u16.to_be_bytes());
            body.push(b'k');
            body.extend_from_slice(&1u16.to_be_bytes());
            body.push(b'v');
        }
        let mut block = (body.len() as u16).to_be_bytes().to_vec();
        block.extend_from_slice(&body);

        let result = Properties::decode(&block, 4096);
        assert!(matches!(result, Err(FramewireError::BadData(_))));
    }

    #[test]
    fn test_decode_rejects_truncated_entry() {
        // Declared block length of 3 cannot hold a length prefix + string.
        let block = [0u8, 3, 0, 5, b'x'];
        let result = Properties::decode(&block, 4096);
        assert!(matches!(result, Err(FramewireError::BadData(_))));
    }

    #[test]
    fn test_decode_rejects_non_utf8() {
        let mut body = Vec::new();
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(&[0xFF, 0xFE]);
        body.extend_from_slice(&0u16.to_be_bytes());
        let mut block = (body.len() as u16).to_be_bytes().to_vec();
        block.extend_from_slice(&body);

        let result = Properties::decode(&block, 4096);
        assert!(matches!(result, Err(FramewireError::BadData(_))));
    }

    #[test]
    fn test_from_iterator() {
        let props: Properties = [("Profile", "sync"), ("Channel", "main")]
            .into_iter()
            .collect();
        assert_eq!(props.get("Profile"), Some("sync"));
        assert_eq!(props.get("Channel"), Some("main"));
    }
}
