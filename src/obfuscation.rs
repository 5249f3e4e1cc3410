use std::{error, fmt, time::Duration};

use rand::Rng;

// High bit of the length prefix marks a real frame; noise frames leave it
// clear so receivers can discard them without parsing further.
const FRAME_FLAG: u16 = 0b10000000_00000000;
const LENGTH_MASK: u16 = !FRAME_FLAG;
const MAX_PAYLOAD_LENGTH: usize = 1 << 15;

const LENGTH_PREFIX_SIZE: usize = 2;

/// Wraps a payload into an obfuscated frame: a 2-byte big-endian length
/// with the frame flag set, the payload, and 1..=mtu bytes of random
/// padding so ciphertext sizes don't mirror packet sizes.
pub fn frame(
    payload: &[u8],
    mtu: usize,
    rng: &mut impl Rng,
) -> Result<Vec<u8>, ObfuscationError> {
    if payload.len() >= MAX_PAYLOAD_LENGTH {
        return Err(ObfuscationError::PayloadTooLong);
    }
    let padding_length = rng.gen_range(1..=mtu);
    let mut data = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len() + padding_length);
    data.extend_from_slice(&(payload.len() as u16 | FRAME_FLAG).to_be_bytes());
    data.extend_from_slice(payload);
    data.resize(data.len() + padding_length, 0);
    rng.fill(&mut data[LENGTH_PREFIX_SIZE + payload.len()..]);
    Ok(data)
}

/// Extracts the payload from a received frame. Returns `None` for noise
/// frames, which carry no payload at all.
pub fn unframe(data: &[u8]) -> Result<Option<&[u8]>, ObfuscationError> {
    if data.is_empty() || (data[0] & (FRAME_FLAG >> 8) as u8) == 0 {
        return Ok(None);
    }
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ObfuscationError::TruncatedFrame);
    }
    let length = (u16::from_be_bytes([data[0], data[1]]) & LENGTH_MASK) as usize;
    if data.len() < LENGTH_PREFIX_SIZE + length {
        return Err(ObfuscationError::TruncatedFrame);
    }
    Ok(Some(&data[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + length]))
}

/// Produces a noise frame: zeroed bytes of uniform random length, up to
/// the MTU. An empty frame is valid noise.
pub fn noise(mtu: usize, rng: &mut impl Rng) -> Vec<u8> {
    vec![0u8; rng.gen_range(0..=mtu)]
}

/// Uniform random delay range for cover traffic and handshake jitter.
#[derive(Clone, Copy)]
pub struct DelayWindow {
    min_ms: u64,
    max_ms: u64,
}

impl DelayWindow {
    pub fn new(min_ms: u64, max_ms: u64) -> Result<DelayWindow, ObfuscationError> {
        if min_ms > max_ms {
            return Err(ObfuscationError::InvalidDelayWindow);
        }
        Ok(DelayWindow { min_ms, max_ms })
    }

    pub fn next_delay(&self, rng: &mut impl Rng) -> Duration {
        Duration::from_millis(rng.gen_range(self.min_ms..=self.max_ms))
    }
}

/// Picks items with integer weights using a single random byte: each item
/// gets a cumulative threshold scaled to 0..=255, and the first item at
/// or above the drawn byte wins. Total weight is capped at 255 so every
/// weight unit keeps a distinct representation in the byte.
pub struct WeightedSelector<T> {
    items: Vec<(T, u8)>,
}

impl<T> WeightedSelector<T> {
    pub fn new(weighted_items: Vec<(T, u8)>) -> Result<WeightedSelector<T>, ObfuscationError> {
        if weighted_items.is_empty() {
            return Err(ObfuscationError::InvalidWeights("No items to select from"));
        }
        let mut total = 0u32;
        for (_, weight) in &weighted_items {
            if *weight == 0 {
                return Err(ObfuscationError::InvalidWeights("Weights must be positive"));
            }
            total += *weight as u32;
        }
        if total > 255 {
            return Err(ObfuscationError::InvalidWeights(
                "Total weight exceeds one byte",
            ));
        }
        let mut cumulative = 0u32;
        let items = weighted_items
            .into_iter()
            .map(|(item, weight)| {
                cumulative += weight as u32;
                (item, (cumulative * 255 / total) as u8)
            })
            .collect();
        Ok(WeightedSelector { items })
    }

    pub fn select(&self, random_byte: u8) -> &T {
        for (item, threshold) in &self.items {
            if random_byte <= *threshold {
                return item;
            }
        }
        // The last threshold is always 255.
        &self.items[self.items.len() - 1].0
    }
}

/// What to do on the wire before the session hello, so that connection
/// openings don't share a recognizable timing or size signature.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HandshakeAction {
    Nothing,
    Delay,
    Noise,
    DelayThenNoise,
    DelayThenNoiseThenDelay,
    NoiseThenDelay,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HandshakeStep {
    Delay,
    Noise,
}

impl HandshakeAction {
    pub fn steps(&self) -> &'static [HandshakeStep] {
        match self {
            Self::Nothing => &[],
            Self::Delay => &[HandshakeStep::Delay],
            Self::Noise => &[HandshakeStep::Noise],
            Self::DelayThenNoise => &[HandshakeStep::Delay, HandshakeStep::Noise],
            Self::DelayThenNoiseThenDelay => &[
                HandshakeStep::Delay,
                HandshakeStep::Noise,
                HandshakeStep::Delay,
            ],
            Self::NoiseThenDelay => &[HandshakeStep::Noise, HandshakeStep::Delay],
        }
    }

    pub fn selector() -> Result<WeightedSelector<HandshakeAction>, ObfuscationError> {
        WeightedSelector::new(vec![
            (HandshakeAction::Nothing, 30),
            (HandshakeAction::Delay, 20),
            (HandshakeAction::Noise, 20),
            (HandshakeAction::DelayThenNoise, 10),
            (HandshakeAction::DelayThenNoiseThenDelay, 10),
            (HandshakeAction::NoiseThenDelay, 10),
        ])
    }
}

#[derive(Debug)]
pub enum ObfuscationError {
    PayloadTooLong,
    TruncatedFrame,
    InvalidDelayWindow,
    InvalidWeights(&'static str),
}

impl fmt::Display for ObfuscationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::PayloadTooLong => write!(f, "Payload is too long to frame"),
            Self::TruncatedFrame => write!(f, "Frame is shorter than its declared length"),
            Self::InvalidDelayWindow => write!(f, "Delay window minimum exceeds maximum"),
            Self::InvalidWeights(msg) => f.write_str(msg),
        }
    }
}

impl error::Error for ObfuscationError {}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    const MTU: usize = 1500;

    #[test]
    fn frames_round_trip() {
        let mut rng = StdRng::seed_from_u64(42);
        for length in [0usize, 1, MAX_PAYLOAD_LENGTH - 1] {
            let payload = vec![0xa5u8; length];
            let framed = frame(&payload, MTU, &mut rng).unwrap();
            assert!(framed.len() >= LENGTH_PREFIX_SIZE + length + 1);
            assert!(framed.len() <= LENGTH_PREFIX_SIZE + length + MTU);
            assert_eq!(unframe(&framed).unwrap(), Some(payload.as_slice()));
        }
    }

    #[test]
    fn rejects_oversized_payloads() {
        let mut rng = StdRng::seed_from_u64(42);
        let payload = vec![0u8; MAX_PAYLOAD_LENGTH];
        assert!(matches!(
            frame(&payload, MTU, &mut rng),
            Err(ObfuscationError::PayloadTooLong)
        ));
    }

    #[test]
    fn rejects_truncated_frames() {
        let mut rng = StdRng::seed_from_u64(42);
        let framed = frame(&[1, 2, 3, 4], MTU, &mut rng).unwrap();
        assert!(matches!(
            unframe(&framed[..5]),
            Err(ObfuscationError::TruncatedFrame)
        ));
    }

    #[test]
    fn rejects_flagged_frames_shorter_than_the_prefix() {
        // A single flagged byte must not be mistaken for a length prefix.
        assert!(matches!(
            unframe(&[0x80]),
            Err(ObfuscationError::TruncatedFrame)
        ));
        assert!(matches!(
            unframe(&[0xff]),
            Err(ObfuscationError::TruncatedFrame)
        ));
    }

    #[test]
    fn detects_noise_frames() {
        assert_eq!(unframe(&[]).unwrap(), None);
        assert_eq!(unframe(&[0x00, 0x10, 0xff]).unwrap(), None);
        assert_eq!(unframe(&[0x7f, 0xff]).unwrap(), None);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..16 {
            let noise = noise(MTU, &mut rng);
            assert!(noise.len() <= MTU);
            assert_eq!(unframe(&noise).unwrap(), None);
        }
    }

    #[test]
    fn selector_thresholds_follow_cumulative_weights() {
        let selector = HandshakeAction::selector().unwrap();
        // Cumulative weights 30/50/70/80/90/100 over 255:
        // thresholds 76/127/178/204/229/255.
        assert_eq!(*selector.select(0), HandshakeAction::Nothing);
        assert_eq!(*selector.select(76), HandshakeAction::Nothing);
        assert_eq!(*selector.select(77), HandshakeAction::Delay);
        assert_eq!(*selector.select(127), HandshakeAction::Delay);
        assert_eq!(*selector.select(128), HandshakeAction::Noise);
        assert_eq!(*selector.select(205), HandshakeAction::DelayThenNoiseThenDelay);
        assert_eq!(*selector.select(255), HandshakeAction::NoiseThenDelay);
    }

    #[test]
    fn selector_rejects_invalid_weights() {
        assert!(WeightedSelector::<u8>::new(vec![]).is_err());
        assert!(WeightedSelector::new(vec![(1u8, 0)]).is_err());
        assert!(WeightedSelector::new(vec![(1u8, 200), (2u8, 56)]).is_err());
        assert!(WeightedSelector::new(vec![(1u8, 200), (2u8, 55)]).is_ok());
    }

    #[test]
    fn delay_window_stays_in_bounds() {
        let mut rng = StdRng::seed_from_u64(42);
        let window = DelayWindow::new(100, 1000).unwrap();
        for _ in 0..32 {
            let delay = window.next_delay(&mut rng);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(1000));
        }
        assert!(DelayWindow::new(5, 1).is_err());
    }
}
