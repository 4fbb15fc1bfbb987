// Unit Ticker — rearmable single-deadline timer
//
// One ticker per unit context. The reactor never sleeps on it; the
// global drive loop asks each armed ticker whether it is due and rearms
// it after every algorithm invocation. Disarming leaves the ticker
// allocated so removal never frees timer state out from under the
// drive loop.

/// A single rearmable deadline in monotonic milliseconds
#[derive(Debug, Clone, Default)]
pub struct Ticker {
    deadline_ms: Option<u64>,
}

impl Ticker {
    /// Create a disarmed ticker
    pub fn new() -> Self {
        Self { deadline_ms: None }
    }

    /// Arm (or rearm) the ticker to fire `delay_ms` after `now_ms`
    pub fn arm(&mut self, now_ms: u64, delay_ms: u64) {
        self.deadline_ms = Some(now_ms.saturating_add(delay_ms));
    }

    /// Disarm without firing
    pub fn disarm(&mut self) {
        self.deadline_ms = None;
    }

    /// Whether a deadline is armed
    pub fn is_armed(&self) -> bool {
        self.deadline_ms.is_some()
    }

    /// The armed deadline, if any
    pub fn deadline(&self) -> Option<u64> {
        self.deadline_ms
    }

    /// Whether the armed deadline has been reached
    pub fn is_due(&self, now_ms: u64) -> bool {
        matches!(self.deadline_ms, Some(d) if d <= now_ms)
    }

    /// Consume a due deadline
    ///
    /// Returns true and disarms when due; the caller rearms after the
    /// algorithm invocation decides the next delay.
    pub fn fire(&mut self, now_ms: u64) -> bool {
        if self.is_due(now_ms) {
            self.deadline_ms = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ticker_disarmed() {
        let ticker = Ticker::new();
        assert!(!ticker.is_armed());
        assert!(!ticker.is_due(u64::MAX));
        assert_eq!(ticker.deadline(), None);
    }

    #[test]
    fn test_arm_and_fire() {
        let mut ticker = Ticker::new();
        ticker.arm(1000, 50);
        assert!(ticker.is_armed());
        assert_eq!(ticker.deadline(), Some(1050));

        assert!(!ticker.fire(1049));
        assert!(ticker.is_armed());

        assert!(ticker.fire(1050));
        assert!(!ticker.is_armed());
    }

    #[test]
    fn test_rearm_moves_deadline() {
        let mut ticker = Ticker::new();
        ticker.arm(1000, 50);
        ticker.arm(1000, 500);
        assert_eq!(ticker.deadline(), Some(1500));
        assert!(!ticker.is_due(1050));
    }

    #[test]
    fn test_disarm() {
        let mut ticker = Ticker::new();
        ticker.arm(0, 10);
        ticker.disarm();
        assert!(!ticker.fire(100));
    }

    #[test]
    fn test_fire_is_one_shot() {
        let mut ticker = Ticker::new();
        ticker.arm(0, 10);
        assert!(ticker.fire(10));
        assert!(!ticker.fire(10));
    }

    #[test]
    fn test_arm_saturates() {
        let mut ticker = Ticker::new();
        ticker.arm(u64::MAX - 1, 100);
        assert_eq!(ticker.deadline(), Some(u64::MAX));
    }
}
