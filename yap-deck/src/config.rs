use std::time::Duration;

/// Tunables of the deck engine. `Default` gives the values the app ships with.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How often unacknowledged events are pushed to the remote store.
    #[serde(with = "duration_secs")]
    pub push_interval: Duration,
    /// How long a banned challenge type ("can't listen right now") stays banned.
    #[serde(with = "duration_secs")]
    pub challenge_ban_cooldown: Duration,
    /// Below this many cards the learner has to reveal the answer before grading.
    pub reveal_answer_below_total_cards: usize,
    /// Consecutive `again` ratings after which a card becomes a leech.
    pub leech_consecutive_failures: u32,
    pub request_retention: f64,
    pub new_cards_per_day_in_simulation: usize,
    /// Days of simulated usage whose challenge audio gets prefetched.
    pub prefetch_days: u32,
    /// A streak survives this long after the last review.
    pub streak_grace_hours: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            push_interval: Duration::from_secs(30),
            challenge_ban_cooldown: Duration::from_secs(15 * 60),
            reveal_answer_below_total_cards: 30,
            leech_consecutive_failures: 8,
            request_retention: 0.7,
            new_cards_per_day_in_simulation: 10,
            prefetch_days: 2,
            streak_grace_hours: 30,
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    pub fn serialize<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = <u64 as serde::Deserialize>::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_in_defaults() {
        let config: EngineConfig =
            serde_json::from_value(serde_json::json!({ "leech_consecutive_failures": 3 })).unwrap();
        assert_eq!(config.leech_consecutive_failures, 3);
        assert_eq!(config.push_interval, Duration::from_secs(30));
        assert_eq!(config.reveal_answer_below_total_cards, 30);
    }
}
