use std::sync::{Mutex, OnceLock};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::{RngCore, SeedableRng, rngs::StdRng};

/// Prefix identifying user ids.
pub const USER_ID_PREFIX: &str = "user_";
/// Prefix identifying group ids.
pub const GROUP_ID_PREFIX: &str = "group_";
/// Prefix identifying cluster ids.
pub const CLUSTER_ID_PREFIX: &str = "cluster_";
/// Prefix identifying application instance ids.
pub const INSTANCE_ID_PREFIX: &str = "instance_";
/// Prefix identifying secret ids.
pub const SECRET_ID_PREFIX: &str = "secret_";

static ID_GENERATOR: OnceLock<IdGenerator> = OnceLock::new();

/// Process-wide generator of entity ids and API tokens.
///
/// Ids are a kind prefix followed by a uniformly random 64-bit value rendered
/// as unpadded URL-safe base64 (11 characters). The PRNG is seeded once from
/// the OS and shared behind a mutex so concurrent requests draw from a single
/// stream.
pub struct IdGenerator {
    rng: Mutex<StdRng>,
}

impl IdGenerator {
    fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Returns the shared generator, initializing it on first use.
    pub fn instance() -> &'static IdGenerator {
        ID_GENERATOR.get_or_init(IdGenerator::new)
    }

    fn raw_id(&self) -> String {
        let value = {
            let mut rng = self.rng.lock().unwrap();
            rng.next_u64()
        };
        URL_SAFE_NO_PAD.encode(value.to_le_bytes())
    }

    pub fn user_id(&self) -> String {
        format!("{USER_ID_PREFIX}{}", self.raw_id())
    }

    pub fn group_id(&self) -> String {
        format!("{GROUP_ID_PREFIX}{}", self.raw_id())
    }

    pub fn cluster_id(&self) -> String {
        format!("{CLUSTER_ID_PREFIX}{}", self.raw_id())
    }

    pub fn instance_id(&self) -> String {
        format!("{INSTANCE_ID_PREFIX}{}", self.raw_id())
    }

    pub fn secret_id(&self) -> String {
        format!("{SECRET_ID_PREFIX}{}", self.raw_id())
    }

    /// Generates an opaque API token for a user.
    ///
    /// Tokens are three raw id segments, giving 192 bits of entropy.
    pub fn user_token(&self) -> String {
        format!("{}{}{}", self.raw_id(), self.raw_id(), self.raw_id())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn assert_id_shape(id: &str, prefix: &str) {
        let suffix = id.strip_prefix(prefix).expect("missing prefix");
        assert_eq!(suffix.len(), 11);
        assert!(
            suffix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        );
    }

    #[test]
    fn ids_have_prefix_and_url_safe_suffix() {
        let generator = IdGenerator::instance();
        assert_id_shape(&generator.user_id(), USER_ID_PREFIX);
        assert_id_shape(&generator.group_id(), GROUP_ID_PREFIX);
        assert_id_shape(&generator.cluster_id(), CLUSTER_ID_PREFIX);
        assert_id_shape(&generator.instance_id(), INSTANCE_ID_PREFIX);
        assert_id_shape(&generator.secret_id(), SECRET_ID_PREFIX);
    }

    #[test]
    fn ids_do_not_collide_over_many_draws() {
        let generator = IdGenerator::instance();
        let mut seen = HashSet::new();
        for _ in 0..100_000 {
            assert!(seen.insert(generator.raw_id()));
        }
    }

    #[test]
    fn tokens_are_longer_than_ids() {
        let token = IdGenerator::instance().user_token();
        assert_eq!(token.len(), 33);
    }
}
