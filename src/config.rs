use crate::amas::config::AMASConfig;
use crate::logging::LoggingConfig;
use crate::workers::DelayedRewardWorkerConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub amas: AMASConfig,
    pub delayed_reward: DelayedRewardWorkerConfig,
}

impl Config {
    /// Reads the process environment, loading `.env` first when present.
    pub fn from_env() -> Self {
        if let Err(err) = dotenvy::dotenv() {
            if !err.not_found() {
                eprintln!("failed to load .env: {err}");
            }
        }

        let amas = AMASConfig::from_env();
        let delayed_reward = DelayedRewardWorkerConfig::from_env(amas.reward.clone());

        Self {
            logging: LoggingConfig::from_env(),
            amas,
            delayed_reward,
        }
    }
}
