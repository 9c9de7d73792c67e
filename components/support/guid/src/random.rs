use crate::Guid;
use rand::RngCore;

impl Guid {
    /// Generate a new random, base64url-encoded identifier.
    ///
    /// Used wherever the core needs a fresh unique id (pending-op ids, op
    /// ids) without depending on a full uuid crate.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let s = base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, bytes);
        Guid::from(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_unique() {
        let a = Guid::random();
        let b = Guid::random();
        assert_ne!(a, b);
        assert_eq!(a.len(), 22);
    }
}
