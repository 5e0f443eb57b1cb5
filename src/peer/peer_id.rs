use std::fmt;

use rand::Rng as _;

use crate::constants::CLIENT_PREFIX;

/// The 20-byte id a client announces in its handshake.
///
/// Ours is `-PM0001-` followed by twelve random bytes. The coordinator uses
/// peer ids to refuse self connections and a second session to the same
/// client.
///
/// ```
/// use piecemeal::peer::PeerId;
///
/// let id = PeerId::generate();
/// assert_eq!(id.client_id(), Some("PM0001"));
/// assert_ne!(id, PeerId::generate());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        let (prefix, suffix) = id.split_at_mut(CLIENT_PREFIX.len());
        prefix.copy_from_slice(CLIENT_PREFIX);
        rand::rng().fill(suffix);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Client and version, e.g. `"UT3500"`, when the id uses the
    /// `-XXXXXX-` convention.
    pub fn client_id(&self) -> Option<&str> {
        match &self.0 {
            [b'-', client @ .., b'-', _, _, _, _, _, _, _, _, _, _, _, _] => {
                std::str::from_utf8(client).ok()
            }
            _ => None,
        }
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.client_id() {
            Some(client) => write!(f, "PeerId({client})"),
            None => write!(f, "PeerId({:02x?})", &self.0[..8]),
        }
    }
}
