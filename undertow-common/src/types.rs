use rand::RngCore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl InfoHash {
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Create an InfoHash from a slice (returns None if not exactly 20 bytes).
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let array: [u8; 20] = slice.try_into().ok()?;
        Some(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl PeerId {
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Generate a fresh peer id: an 8-byte client prefix followed by
    /// 12 random bytes.
    pub fn generate() -> Self {
        const PREFIX: &[u8] = b"-UT0010-";
        let mut id = [0u8; 20];
        id[..PREFIX.len()].copy_from_slice(PREFIX);
        rand::rng().fill_bytes(&mut id[PREFIX.len()..]);
        Self(id)
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let array: [u8; 20] = slice.try_into().ok()?;
        Some(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(hash: [u8; 20]) -> Self {
        Self::new(hash)
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(id: [u8; 20]) -> Self {
        Self::new(id)
    }
}

impl AsRef<[u8]> for InfoHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
