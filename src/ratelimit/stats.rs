//! Per-connection traffic statistics.

/// Counters for one connection within its current one-second window.
///
/// The value is immutable: every mutation returns a new instance, so the
/// engine can swap entries in its table as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Bytes consumed in the current window
    traffic_bytes: u64,
    /// Messages consumed in the current window
    packets: u64,
    /// Unix timestamp (seconds) at which the current window began
    window_start: u64,
    /// Threshold for this connection, in the policy's unit
    limit: u64,
}

impl ConnectionStats {
    /// Create stats with explicit counters.
    pub fn new(traffic_bytes: u64, packets: u64, window_start: u64, limit: u64) -> Self {
        Self {
            traffic_bytes,
            packets,
            window_start,
            limit,
        }
    }

    /// Create zeroed stats whose window starts at `now`.
    pub fn fresh(limit: u64, now: u64) -> Self {
        Self::new(0, 0, now, limit)
    }

    pub fn traffic_bytes(&self) -> u64 {
        self.traffic_bytes
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn window_start(&self) -> u64 {
        self.window_start
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Record `bytes` more traffic.
    pub fn with_traffic(&self, bytes: u64) -> Self {
        Self {
            traffic_bytes: self.traffic_bytes.saturating_add(bytes),
            ..*self
        }
    }

    /// Record one more packet.
    pub fn with_packet(&self) -> Self {
        Self {
            packets: self.packets.saturating_add(1),
            ..*self
        }
    }

    /// Start a new window at `now`, keeping the limit.
    pub fn reset(&self, now: u64) -> Self {
        Self::fresh(self.limit, now)
    }

    /// Replace the limit, keeping counters and window start.
    pub fn with_limit(&self, limit: u64) -> Self {
        Self { limit, ..*self }
    }

    /// Whether the window has elapsed as of `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.window_start
    }

    /// Check if adding `additional_bytes` would go over the limit.
    pub fn is_traffic_limit_exceeded(&self, additional_bytes: u64) -> bool {
        self.traffic_bytes.saturating_add(additional_bytes) > self.limit
    }

    /// Check if one more packet would go over the limit.
    pub fn is_packet_limit_exceeded(&self) -> bool {
        self.packets.saturating_add(1) > self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_704_067_200;

    #[test]
    fn test_fresh_stats_are_zeroed() {
        let stats = ConnectionStats::fresh(1024 * 1024, NOW);

        assert_eq!(stats.traffic_bytes(), 0);
        assert_eq!(stats.packets(), 0);
        assert_eq!(stats.window_start(), NOW);
        assert_eq!(stats.limit(), 1024 * 1024);
    }

    #[test]
    fn test_with_traffic_leaves_original_untouched() {
        let stats = ConnectionStats::new(1000, 5, NOW, 2000);
        let updated = stats.with_traffic(500);

        assert_eq!(stats.traffic_bytes(), 1000);
        assert_eq!(updated.traffic_bytes(), 1500);
        assert_eq!(updated.packets(), 5);
        assert_eq!(updated.window_start(), NOW);
        assert_eq!(updated.limit(), 2000);
    }

    #[test]
    fn test_with_packet() {
        let stats = ConnectionStats::new(1000, 5, NOW, 10);
        let updated = stats.with_packet();

        assert_eq!(stats.packets(), 5);
        assert_eq!(updated.packets(), 6);
        assert_eq!(updated.traffic_bytes(), 1000);
        assert_eq!(updated.limit(), 10);
    }

    #[test]
    fn test_reset_keeps_limit() {
        let stats = ConnectionStats::new(1000, 5, NOW - 10, 2000);
        let reset = stats.reset(NOW);

        assert_eq!(reset, ConnectionStats::fresh(2000, NOW));
        assert_eq!(stats.traffic_bytes(), 1000);
    }

    #[test]
    fn test_with_limit_keeps_counters() {
        let stats = ConnectionStats::new(1000, 5, NOW, 2000);
        let updated = stats.with_limit(3000);

        assert_eq!(stats.limit(), 2000);
        assert_eq!(updated, ConnectionStats::new(1000, 5, NOW, 3000));
    }

    #[test]
    fn test_traffic_limit_boundary() {
        let stats = ConnectionStats::new(800, 5, NOW, 1000);

        assert!(!stats.is_traffic_limit_exceeded(100));
        assert!(!stats.is_traffic_limit_exceeded(200)); // 800 + 200 == 1000
        assert!(stats.is_traffic_limit_exceeded(201));
    }

    #[test]
    fn test_packet_limit_boundary() {
        assert!(!ConnectionStats::new(1000, 5, NOW, 6).is_packet_limit_exceeded());
        assert!(ConnectionStats::new(1000, 5, NOW, 5).is_packet_limit_exceeded());
    }

    #[test]
    fn test_is_expired() {
        let stats = ConnectionStats::fresh(10, NOW);

        assert!(!stats.is_expired(NOW));
        assert!(stats.is_expired(NOW + 1));
        assert!(stats.is_expired(NOW + 30));
    }
}
