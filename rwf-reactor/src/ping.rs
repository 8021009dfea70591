use std::time::{Duration, Instant};

/// Живость канала: когда последний раз что-то получали и отправляли.
#[derive(Debug, Clone)]
pub struct PingTracker {
    timeout: Duration,
    interval: Duration,
    last_received: Instant,
    last_sent: Instant,
}

impl PingTracker {
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Self {
            timeout,
            interval: timeout / 3,
            last_received: now,
            last_sent: now,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Любой входящий кадр продлевает жизнь канала.
    pub fn received(&mut self, now: Instant) {
        self.last_received = now;
    }

    pub fn sent(&mut self, now: Instant) {
        self.last_sent = now;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_received) > self.timeout
    }

    /// Пора отправить ping: молчим на запись дольше интервала.
    pub fn ping_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_sent) >= self.interval
    }

    /// Ближайший момент, когда трекеру есть что сказать.
    pub fn next_deadline(&self) -> Instant {
        let expire = self.last_received + self.timeout;
        let ping = self.last_sent + self.interval;
        expire.min(ping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(300);

    #[test]
    fn fresh_tracker_is_alive_and_silent() {
        let now = Instant::now();
        let ping = PingTracker::new(TIMEOUT, now);

        assert!(!ping.is_expired(now));
        assert!(!ping.ping_due(now));
        assert_eq!(ping.next_deadline(), now + Duration::from_millis(100));
    }

    #[test]
    fn expires_without_incoming_traffic() {
        let start = Instant::now();
        let mut ping = PingTracker::new(TIMEOUT, start);

        assert!(ping.is_expired(start + TIMEOUT + Duration::from_millis(1)));

        ping.received(start + Duration::from_millis(200));
        assert!(!ping.is_expired(start + TIMEOUT + Duration::from_millis(1)));
    }

    #[test]
    fn ping_is_due_after_write_silence() {
        let start = Instant::now();
        let mut ping = PingTracker::new(TIMEOUT, start);

        assert!(ping.ping_due(start + Duration::from_millis(100)));

        ping.sent(start + Duration::from_millis(100));
        assert!(!ping.ping_due(start + Duration::from_millis(150)));
        assert_eq!(ping.next_deadline(), start + Duration::from_millis(200));
    }
}
