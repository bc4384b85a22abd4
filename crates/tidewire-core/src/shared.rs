use std::{ops::Deref, sync::Arc};

/// SharedBytes is a reference-counted, sliceable byte buffer.
///
/// It holds an `Arc<[u8]>` plus a (start, len) view. A received datagram is
/// wrapped once and every payload decoded from it is a view into the same
/// allocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedBytes {
    data: Arc<[u8]>,
    start: usize,
    len: usize,
}

impl SharedBytes {
    /// Creates a new SharedBytes from a Vec by taking ownership.
    pub fn from_vec(vec: Vec<u8>) -> Self {
        let arc: Arc<[u8]> = Arc::from(vec.into_boxed_slice());
        let len = arc.len();
        Self { data: arc, start: 0, len }
    }

    /// Creates a new SharedBytes by copying a slice.
    pub fn copy_from_slice(bytes: &[u8]) -> Self {
        Self::from_arc(Arc::from(bytes))
    }

    /// Creates a new SharedBytes from an Arc<[u8]> covering the full slice.
    pub fn from_arc(data: Arc<[u8]>) -> Self {
        let len = data.len();
        Self { data, start: 0, len }
    }

    /// Returns an empty buffer.
    pub fn empty() -> Self {
        Self::from_vec(Vec::new())
    }

    /// Creates a sub-slice view into the current buffer without copying.
    /// Returns `None` if the requested range is out of bounds.
    pub fn slice(&self, start: usize, len: usize) -> Option<Self> {
        let end = start.checked_add(len)?;
        if end > self.len {
            return None;
        }
        Some(Self { data: self.data.clone(), start: self.start + start, len })
    }

    /// Returns the current view as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.start + self.len]
    }

    /// Returns the length of the current view.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the view is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for SharedBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for SharedBytes {
    fn from(v: Vec<u8>) -> Self {
        Self::from_vec(v)
    }
}

impl From<&[u8]> for SharedBytes {
    fn from(v: &[u8]) -> Self {
        Self::copy_from_slice(v)
    }
}

impl From<Arc<[u8]>> for SharedBytes {
    fn from(a: Arc<[u8]>) -> Self {
        Self::from_arc(a)
    }
}

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_shares_allocation() {
        let bytes = SharedBytes::from_vec((0u8..10).collect());
        let view = bytes.slice(2, 3).unwrap();
        assert_eq!(view.as_slice(), &[2, 3, 4]);

        let nested = view.slice(1, 2).unwrap();
        assert_eq!(nested.as_slice(), &[3, 4]);
    }

    #[test]
    fn test_slice_out_of_bounds() {
        let bytes = SharedBytes::from_vec(vec![1, 2, 3]);
        assert!(bytes.slice(2, 2).is_none());
        assert!(bytes.slice(usize::MAX, 2).is_none());
        assert!(bytes.slice(3, 0).unwrap().is_empty());
    }
}
