/// Counters of HEARTBEAT, ACKNACK, NACK_FRAG and HEARTBEAT_FRAG grow monotonically, so a
///  sub-message with a count that is not bigger than the last one accepted from the same peer
///  is stale (duplicated or reordered) and must be ignored.
///
/// Counters are signed 32 bit values that eventually wrap. An incoming count in the lowest
///  quarter of the positive range is accepted as a successor of an existing count in the
///  highest quarter.
///
/// Returns `true` and updates `existing` if the incoming count is newer.
pub fn compare_and_update_counts(incoming: i32, existing: &mut i32) -> bool {
    const ONE_QUARTER_MAX_POSITIVE: i32 = 0x2000_0000;
    const THREE_QUARTERS_MAX_POSITIVE: i32 = 0x6000_0000;

    if incoming <= *existing && !(incoming < ONE_QUARTER_MAX_POSITIVE && *existing > THREE_QUARTERS_MAX_POSITIVE) {
        return false;
    }
    *existing = incoming;
    true
}

/// Diagnostic counters for protocol traffic a state machine dropped without acting on it
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct DropCounters {
    /// control sub-messages with a count that is not newer than the last accepted one
    pub stale_control: u64,
    /// samples that were received before
    pub duplicate_samples: u64,
    /// control sub-messages with inconsistent content, e.g. HEARTBEAT with `last < first - 1`
    pub invalid_control: u64,
}

impl DropCounters {
    pub fn accumulate(&mut self, other: &DropCounters) {
        self.stale_control += other.stale_control;
        self.duplicate_samples += other.duplicate_samples;
        self.invalid_control += other.invalid_control;
    }
}
