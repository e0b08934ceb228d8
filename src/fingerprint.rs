//! Client fingerprinting

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of the IP address immediately followed by the user agent
pub fn generate(ip_address: &str, user_agent: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ip_address.as_bytes());
    hasher.update(user_agent.as_bytes());
    hex::encode(hasher.finalize())
}
