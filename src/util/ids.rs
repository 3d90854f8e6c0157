use rand::{Rng, rng};

fn hex_id<const N: usize>() -> String {
    let bytes: [u8; N] = rng().random();
    hex::encode(bytes)
}

/// Opaque wallet identifier: 8 random bytes as 16 hex chars.
pub fn wallet_id() -> String {
    hex_id::<8>()
}

/// Transaction identifier: 16 random bytes as 32 hex chars.
pub fn transaction_id() -> String {
    hex_id::<16>()
}

/// Payment-session identifier: 16 random bytes as 32 hex chars.
pub fn session_id() -> String {
    hex_id::<16>()
}
