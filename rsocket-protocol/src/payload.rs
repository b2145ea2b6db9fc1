//! Application payloads: an opaque data buffer plus optional metadata.

use bytes::Bytes;

/// The unit of application data carried by request and PAYLOAD frames.
///
/// Metadata is distinct from "empty metadata": `Some(Bytes::new())` is sent
/// with the METADATA flag and a zero length prefix, `None` without the flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Payload {
    data: Bytes,
    metadata: Option<Bytes>,
}

impl Payload {
    pub fn new(data: impl Into<Bytes>, metadata: Option<Bytes>) -> Self {
        Self {
            data: data.into(),
            metadata,
        }
    }

    /// Creates a payload with data and no metadata.
    pub fn from_data(data: impl Into<Bytes>) -> Self {
        Self::new(data, None)
    }

    /// Replaces the metadata of this payload.
    pub fn with_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn metadata(&self) -> Option<&Bytes> {
        self.metadata.as_ref()
    }

    pub fn has_metadata(&self) -> bool {
        self.metadata.is_some()
    }

    /// Returns the data as UTF-8, if it is valid UTF-8.
    pub fn data_utf8(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Returns the metadata as UTF-8, if present and valid.
    pub fn metadata_utf8(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| std::str::from_utf8(m).ok())
    }

    /// Combined size of data and metadata in bytes.
    pub fn len(&self) -> usize {
        self.data.len() + self.metadata.as_ref().map_or(0, Bytes::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_parts(self) -> (Bytes, Option<Bytes>) {
        (self.data, self.metadata)
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Self::from_data(data)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Self::from_data(data)
    }
}

impl From<String> for Payload {
    fn from(data: String) -> Self {
        Self::from_data(data)
    }
}

impl From<&'static str> for Payload {
    fn from(data: &'static str) -> Self {
        Self::from_data(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_len_counts_both_parts() {
        let payload = Payload::from_data("hello").with_metadata("meta");
        assert_eq!(payload.len(), 9);
        assert!(payload.has_metadata());
        assert_eq!(payload.data_utf8(), Some("hello"));
        assert_eq!(payload.metadata_utf8(), Some("meta"));
    }

    #[test]
    fn test_empty_metadata_is_not_absent() {
        let payload = Payload::from_data("x").with_metadata(Bytes::new());
        assert!(payload.has_metadata());
        assert_eq!(payload.metadata().map(Bytes::len), Some(0));
        assert_ne!(payload, Payload::from_data("x"));
    }

    #[test]
    fn test_default_is_empty() {
        let payload = Payload::default();
        assert!(payload.is_empty());
        assert!(!payload.has_metadata());
    }
}
