use std::time::Duration;

/// Tunables for booking-window policy and the journal writer.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// A booking may be cancelled only while at least this many minutes
    /// remain before the slot starts.
    pub cancel_cutoff_minutes: i64,
    /// Same gate for reschedules; deliberately wider than cancellation.
    pub reschedule_cutoff_minutes: i64,
    /// Grace after slot start before the reaper marks confirmed bookings
    /// no-show and expires unconfirmed ones.
    pub no_show_grace_minutes: i64,
    /// Tax rate in basis points (1800 = 18%).
    pub tax_rate_bps: i64,
    /// Bound on a single journal append; expiry surfaces as a retryable
    /// timeout, never a definitive failure.
    pub journal_timeout: Duration,
    /// Journal appends between compaction runs.
    pub compact_threshold: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cancel_cutoff_minutes: 120,
            reschedule_cutoff_minutes: 240,
            no_show_grace_minutes: 30,
            tax_rate_bps: 1_800,
            journal_timeout: Duration::from_secs(5),
            compact_threshold: 1_000,
        }
    }
}

impl SchedulerConfig {
    /// Read overrides from `SLOTWISE_*` environment variables; anything
    /// unset or unparsable keeps its default.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_parse("SLOTWISE_CANCEL_CUTOFF_MINUTES") {
            cfg.cancel_cutoff_minutes = v;
        }
        if let Some(v) = env_parse("SLOTWISE_RESCHEDULE_CUTOFF_MINUTES") {
            cfg.reschedule_cutoff_minutes = v;
        }
        if let Some(v) = env_parse("SLOTWISE_NO_SHOW_GRACE_MINUTES") {
            cfg.no_show_grace_minutes = v;
        }
        if let Some(v) = env_parse("SLOTWISE_TAX_RATE_BPS") {
            cfg.tax_rate_bps = v;
        }
        if let Some(secs) = env_parse::<u64>("SLOTWISE_JOURNAL_TIMEOUT_SECS") {
            cfg.journal_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = env_parse("SLOTWISE_COMPACT_THRESHOLD") {
            cfg.compact_threshold = v;
        }
        cfg
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
