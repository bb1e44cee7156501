//! Salt and nonce generation from the thread-local CSPRNG

use rand::RngCore;

/// Fill `buf` with cryptographically secure random bytes.
pub fn fill_random(buf: &mut [u8]) {
    rand::thread_rng().fill_bytes(buf);
}

/// A fresh array of `N` random bytes.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    fill_random(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_arrays_differ() {
        let a: [u8; 32] = random_array();
        let b: [u8; 32] = random_array();
        assert_ne!(a, b);
    }

    #[test]
    fn test_fill_random_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(random_array::<16>))
            .collect();
        let mut outputs: Vec<[u8; 16]> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        outputs.sort();
        outputs.dedup();
        assert_eq!(outputs.len(), 4, "each thread must draw independent bytes");
    }
}
