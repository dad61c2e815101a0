use crate::amount::{Amount, MILLILUMEN};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_MAX_ROUND_DURATION: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_FINALITY_DELAY: Duration = Duration::from_secs(4 * 60 * 60);
pub const DEFAULT_CHANNEL_FEERATE: Amount = Amount::from_stroops(10 * MILLILUMEN);
pub const DEFAULT_HOST_FEERATE: Amount = Amount::from_stroops(100);

/// Longest accepted password, inherited from the original bcrypt limit.
pub const MAX_PASSWORD_LEN: usize = 72;

/// The agent's persisted configuration. The password is stored only as a PHC
/// hash; the seed is sealed separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub username: String,
    pub pw_hash: String,
    pub horizon_url: String,
    pub max_round_duration: Duration,
    pub finality_delay: Duration,
    pub channel_feerate: Amount,
    pub host_feerate: Amount,
    /// Whether the agent sends zero-value keep-alive payments on idle channels.
    pub keep_alive: bool,
}

/// Operator-facing configuration input for `config_init` and `config_edit`.
/// Unset fields keep (or receive) their defaults.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ConfigInput {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub horizon_url: String,
    /// Required when changing the password with `config_edit`.
    #[serde(default)]
    pub old_password: String,
    pub max_round_duration: Option<Duration>,
    pub finality_delay: Option<Duration>,
    pub channel_feerate: Option<Amount>,
    pub host_feerate: Option<Amount>,
    pub keep_alive: Option<bool>,
}

/// Usernames become the local part of a federation address, so the separator
/// and whitespace are forbidden.
pub fn validate_username(username: &str) -> bool {
    !username.is_empty() && !username.contains('*') && !username.chars().any(char::is_whitespace)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn username_rules() {
        assert!(validate_username("alice"));
        assert!(validate_username("alice-2"));
        assert!(!validate_username(""));
        assert!(!validate_username("alice*example.com"));
        assert!(!validate_username("alice smith"));
    }
}
