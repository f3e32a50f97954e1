// Protocol tunables.
//
// Defaults match the classic deployment profile: one probe per second, a
// 900 ms direct-ping budget and a 20-period suspicion window. All four
// tunables can be overridden from the environment once at context creation;
// afterwards they live inside the context and are updated under its lock.

/// Number of update-queue entries piggybacked per outbound message, on top of
/// the up-to-three header slots (probed member, self, recipient).
pub const PIGGYBACK_ENTRIES: usize = 8;

/// How many times a queue entry is transmitted before it is dropped.
pub const PIGGYBACK_TX_COUNT: u64 = 50;

/// `progress` returns early when the next interesting deadline is further
/// away than this, letting the host sleep.
pub(crate) const PROGRESS_SLACK_MS: u64 = 100;

const DEFAULT_PERIOD_MS: u64 = 1000;
const DEFAULT_SUSPECT_TIMEOUT_MS: u64 = 20 * DEFAULT_PERIOD_MS;
const DEFAULT_PING_TIMEOUT_MS: u64 = 900;
const DEFAULT_SUBGROUP_SIZE: usize = 2;

/// Tunables of one protocol context.
#[derive(Debug, Clone)]
pub struct SwimConfig {
    /// Length of one protocol period (one direct probe per period), ms.
    /// Should not be less than three ping timeouts.
    pub period_ms: u64,
    /// How long a member stays SUSPECT before it is declared DEAD, ms.
    /// Zero folds suspicion directly into death.
    pub suspect_timeout_ms: u64,
    /// Base budget for a direct-ping round trip, ms.
    pub ping_timeout_ms: u64,
    /// How many peers carry an indirect probe when a direct one times out.
    pub subgroup_size: usize,
    /// Transmission budget per update-queue entry.
    pub piggyback_tx_max: u64,
}

impl Default for SwimConfig {
    fn default() -> Self {
        Self {
            period_ms: DEFAULT_PERIOD_MS,
            suspect_timeout_ms: DEFAULT_SUSPECT_TIMEOUT_MS,
            ping_timeout_ms: DEFAULT_PING_TIMEOUT_MS,
            subgroup_size: DEFAULT_SUBGROUP_SIZE,
            piggyback_tx_max: PIGGYBACK_TX_COUNT,
        }
    }
}

impl SwimConfig {
    /// Defaults with environment overrides applied. Read once per context at
    /// creation time.
    pub fn from_env() -> Self {
        Self {
            period_ms: env_u64("SWIM_PROTOCOL_PERIOD_LEN", DEFAULT_PERIOD_MS),
            suspect_timeout_ms: env_u64("SWIM_SUSPECT_TIMEOUT", DEFAULT_SUSPECT_TIMEOUT_MS),
            ping_timeout_ms: env_u64("SWIM_PING_TIMEOUT", DEFAULT_PING_TIMEOUT_MS),
            subgroup_size: env_u64("SWIM_SUBGROUP_SIZE", DEFAULT_SUBGROUP_SIZE as u64) as usize,
            piggyback_tx_max: PIGGYBACK_TX_COUNT,
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
