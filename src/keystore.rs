use rand::{TryRngCore, rngs::OsRng};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{
    error::Error,
    server::ServerConfig,
    wg::{KEY_LENGTH, Key},
};

/// Entropy for new key pairs.
pub trait KeySource {
    fn fill(&mut self, buf: &mut [u8; KEY_LENGTH]) -> Result<(), Error>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsKeySource;

impl KeySource for OsKeySource {
    fn fill(&mut self, buf: &mut [u8; KEY_LENGTH]) -> Result<(), Error> {
        OsRng
            .try_fill_bytes(buf)
            .map_err(|err| Error::CryptoFailure(err.to_string()))
    }
}

/// A freshly issued private key. It is handed out exactly once and wiped
/// when dropped; printing it requires an explicit `reveal`.
pub struct PrivateKey(StaticSecret);

impl PrivateKey {
    pub fn public_key(&self) -> Key {
        Key::from(PublicKey::from(&self.0).to_bytes())
    }

    pub fn reveal(&self) -> Key {
        Key::from(self.0.to_bytes())
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PrivateKey").field(&"<redacted>").finish()
    }
}

pub fn public_key_of(private_key: &Key) -> Key {
    Key::from(PublicKey::from(&StaticSecret::from(private_key.to_bytes())).to_bytes())
}

/// Issues X25519 key pairs. Nothing is retained after `issue` returns.
#[derive(Debug, Default)]
pub struct KeyStore<S = OsKeySource> {
    source: S,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<S: KeySource> KeyStore<S> {
    #[cfg(test)]
    pub fn with_source(source: S) -> Self {
        Self { source }
    }

    pub fn issue(&mut self) -> Result<(Key, PrivateKey), Error> {
        let mut bytes = [0u8; KEY_LENGTH];
        self.source.fill(&mut bytes)?;

        if bytes.iter().all(|b| *b == 0) {
            return Err(Error::CryptoFailure("entropy source returned zeros".into()));
        }

        let private = PrivateKey(StaticSecret::from(bytes));

        Ok((private.public_key(), private))
    }

    /// Replaces the server key pair. `server` is only touched once the new
    /// pair exists, so a failure leaves the old key in place. Every client
    /// config rendered before this call stops working.
    pub fn rotate_server_key(&mut self, server: &mut ServerConfig) -> Result<Key, Error> {
        let (public, private) = self.issue()?;
        server.private_key = private.reveal();
        Ok(public)
    }
}
