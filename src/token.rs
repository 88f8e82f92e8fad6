use sha1::{Digest, Sha1};
use std::net::IpAddr;

const SECRET_LEN: usize = 20;

/// Write tokens handed out in get_peers responses. A token stays valid for
/// one rotation after it was issued.
pub struct TokenSecret {
    current: [u8; SECRET_LEN],
    previous: [u8; SECRET_LEN],
}

impl TokenSecret {
    pub fn new() -> Self {
        let current = rand::random();
        Self {
            current,
            previous: current,
        }
    }

    pub fn calculate(&self, ip: IpAddr) -> [u8; 20] {
        token_for(&self.current, ip)
    }

    pub fn verify(&self, ip: IpAddr, token: &[u8]) -> bool {
        token == token_for(&self.current, ip) || token == token_for(&self.previous, ip)
    }

    pub fn rotate(&mut self) {
        self.previous = self.current;
        self.current = rand::random();
    }
}

impl Default for TokenSecret {
    fn default() -> Self {
        Self::new()
    }
}

fn token_for(secret: &[u8; SECRET_LEN], ip: IpAddr) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(secret);
    match ip {
        IpAddr::V4(v4) => hasher.update(v4.octets()),
        IpAddr::V6(v6) => hasher.update(v6.octets()),
    }
    hasher.finalize().into()
}
