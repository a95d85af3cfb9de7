//! Outbound buffer with high/low watermark tracking.
//!
//! Watermark notifications are edge-triggered: going above the high
//! watermark is reported once, and nothing more is reported until occupancy
//! falls to the low watermark. The gap between the two prevents oscillation.

use bytes::BytesMut;

/// A watermark crossing reported by [`WriteBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watermark {
    /// Occupancy went above the high watermark.
    AboveHigh,
    /// Occupancy fell to or below the low watermark.
    BelowLow,
}

/// Pending outbound bytes for one connection.
#[derive(Debug)]
pub struct WriteBuffer {
    buf: BytesMut,
    high_watermark: usize,
    low_watermark: usize,
    above_high: bool,
}

impl WriteBuffer {
    /// Create a buffer with explicit watermarks.
    ///
    /// A high watermark of 0 disables notifications. The low watermark is
    /// clamped to the high watermark.
    pub fn new(high_watermark: usize, low_watermark: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            high_watermark,
            low_watermark: low_watermark.min(high_watermark),
            above_high: false,
        }
    }

    /// Create a buffer whose watermarks derive from a buffer limit
    /// (high = limit, low = limit / 2).
    pub fn with_limit(limit: usize) -> Self {
        Self::new(limit, limit / 2)
    }

    /// Append data and report a high watermark crossing, if any.
    pub fn append(&mut self, data: &[u8]) -> Option<Watermark> {
        self.buf.extend_from_slice(data);
        self.check_high_watermark()
    }

    /// Remove `n` bytes from the front and report a low watermark crossing, if any.
    #[cfg(test)]
    fn drain(&mut self, n: usize) -> Option<Watermark> {
        let n = n.min(self.buf.len());
        let _ = self.buf.split_to(n);
        self.check_low_watermark()
    }

    /// Direct access for socket writes. Call [`WriteBuffer::check_low_watermark`]
    /// after consuming from it.
    pub fn bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Discard everything without reporting.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.above_high = false;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn high_watermark(&self) -> usize {
        self.high_watermark
    }

    pub fn low_watermark(&self) -> usize {
        self.low_watermark
    }

    /// Whether the last reported crossing was above the high watermark.
    pub fn is_above_high_watermark(&self) -> bool {
        self.above_high
    }

    fn check_high_watermark(&mut self) -> Option<Watermark> {
        if self.above_high || self.high_watermark == 0 || self.buf.len() <= self.high_watermark {
            return None;
        }
        self.above_high = true;
        Some(Watermark::AboveHigh)
    }

    /// Report a low watermark crossing after bytes were consumed.
    pub fn check_low_watermark(&mut self) -> Option<Watermark> {
        if !self.above_high || self.buf.len() > self.low_watermark {
            return None;
        }
        self.above_high = false;
        Some(Watermark::BelowLow)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Buf;

    use super::*;

    #[test]
    fn test_above_high_fires_once_per_crossing() {
        let mut buffer = WriteBuffer::new(10, 5);

        assert_eq!(buffer.append(&[0u8; 6]), None);
        assert_eq!(buffer.append(&[0u8; 4]), None, "exactly at high is not above");
        assert_eq!(buffer.append(&[0u8; 1]), Some(Watermark::AboveHigh));

        // Further writes while above high stay silent.
        for _ in 0..100 {
            assert_eq!(buffer.append(&[0u8; 3]), None);
        }
        assert!(buffer.is_above_high_watermark());
    }

    #[test]
    fn test_below_low_fires_once_after_high() {
        let mut buffer = WriteBuffer::new(10, 5);
        buffer.append(&[0u8; 20]);

        // Draining into the hysteresis band reports nothing.
        assert_eq!(buffer.drain(8), None);
        assert_eq!(buffer.len(), 12);
        assert_eq!(buffer.drain(6), None);
        assert_eq!(buffer.len(), 6);

        assert_eq!(buffer.drain(1), Some(Watermark::BelowLow));
        assert_eq!(buffer.drain(5), None);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_refill_in_band_does_not_refire() {
        let mut buffer = WriteBuffer::new(10, 5);
        assert_eq!(buffer.append(&[0u8; 11]), Some(Watermark::AboveHigh));
        assert_eq!(buffer.drain(5), None);
        assert_eq!(buffer.append(&[0u8; 4]), None);
        assert_eq!(buffer.drain(10), Some(Watermark::BelowLow));
        assert_eq!(buffer.append(&[0u8; 11]), Some(Watermark::AboveHigh));
    }

    #[test]
    fn test_below_low_requires_prior_high() {
        let mut buffer = WriteBuffer::new(10, 5);
        buffer.append(&[0u8; 8]);
        assert_eq!(buffer.drain(8), None);
    }

    #[test]
    fn test_zero_limit_disables_watermarks() {
        let mut buffer = WriteBuffer::with_limit(0);
        assert_eq!(buffer.append(&[0u8; 1 << 20]), None);
        assert_eq!(buffer.drain(1 << 20), None);
    }

    #[test]
    fn test_low_clamped_to_high() {
        let buffer = WriteBuffer::new(4, 100);
        assert_eq!(buffer.low_watermark(), 4);

        let buffer = WriteBuffer::with_limit(32 * 1024);
        assert_eq!(buffer.high_watermark(), 32 * 1024);
        assert_eq!(buffer.low_watermark(), 16 * 1024);
    }

    #[test]
    fn test_direct_consume_then_check() {
        let mut buffer = WriteBuffer::new(4, 2);
        assert_eq!(buffer.append(b"abcdef"), Some(Watermark::AboveHigh));
        buffer.bytes_mut().advance(5);
        assert_eq!(buffer.check_low_watermark(), Some(Watermark::BelowLow));
        assert_eq!(&buffer.bytes_mut()[..], b"f");
    }

    #[test]
    fn test_clear_resets_state() {
        let mut buffer = WriteBuffer::new(4, 2);
        buffer.append(b"abcdef");
        buffer.clear();
        assert!(!buffer.is_above_high_watermark());
        assert_eq!(buffer.append(b"abcdef"), Some(Watermark::AboveHigh));
    }
}
