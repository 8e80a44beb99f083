//! Auth - challenge/response（password を鍵にした challenge の HMAC-SHA-256）

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use super::wire::{CHALLENGE_LEN, DIGEST_LEN};

type HmacSha256 = Hmac<Sha256>;

fn mac(password: &str, challenge: &[u8]) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(password.as_bytes())
        .expect("HMAC-SHA-256 accepts keys of any size");
    mac.update(challenge);
    mac
}

pub fn new_challenge() -> [u8; CHALLENGE_LEN] {
    let mut challenge = [0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut challenge);
    challenge
}

/// What a client must answer to `challenge`.
pub fn digest(password: &str, challenge: &[u8]) -> [u8; DIGEST_LEN] {
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&mac(password, challenge).finalize().into_bytes());
    out
}

/// Constant-time check of a client's answer.
pub fn verify(password: &str, challenge: &[u8], answer: &[u8]) -> bool {
    mac(password, challenge).verify_slice(answer).is_ok()
}
