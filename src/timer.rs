//! 세션 타이머 테이블
//!
//! 세션은 스스로 잠들지 않는다. 호스트가 [`TimerTable::next_deadline`]을
//! 보고 깨운 뒤 만료 타이머를 처리한다.
//!
//! - 이미 대기 중인 타이머를 다시 arm하면 무시
//! - 만료 처리는 항상 disarm 후에 이뤄지므로 재등록해도 중복되지 않음

use std::time::Instant;

/// 타이머 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// 재전송 타임아웃
    Rto,
    /// 프로브 타임아웃
    Pto,
    /// 지연 ACK
    AckDelay,
    /// 혼잡/핸드쉐이크로 미뤄진 전송 재시도
    SendRetry,
}

impl TimerKind {
    pub const ALL: [TimerKind; 4] = [
        TimerKind::Rto,
        TimerKind::Pto,
        TimerKind::AckDelay,
        TimerKind::SendRetry,
    ];

    fn index(self) -> usize {
        match self {
            TimerKind::Rto => 0,
            TimerKind::Pto => 1,
            TimerKind::AckDelay => 2,
            TimerKind::SendRetry => 3,
        }
    }
}

/// 종류별 마감 시각
#[derive(Debug, Default)]
pub struct TimerTable {
    deadlines: [Option<Instant>; 4],
}

impl TimerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 대기 중이 아니면 등록. 등록했으면 `true`.
    pub fn arm(&mut self, kind: TimerKind, deadline: Instant) -> bool {
        let slot = &mut self.deadlines[kind.index()];
        if slot.is_some() {
            return false;
        }
        *slot = Some(deadline);
        true
    }

    /// 기존 등록과 관계없이 새 마감 시각으로 교체
    pub fn rearm(&mut self, kind: TimerKind, deadline: Instant) {
        self.deadlines[kind.index()] = Some(deadline);
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        self.deadlines[kind.index()] = None;
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadlines[kind.index()].is_some()
    }

    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        self.deadlines[kind.index()]
    }

    /// 가장 이른 마감 시각
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.iter().flatten().min().copied()
    }

    /// `now` 기준 만료된 타이머를 disarm하고 반환 (마감 시각 순)
    pub fn take_expired(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut expired: Vec<(Instant, TimerKind)> = TimerKind::ALL
            .iter()
            .filter_map(|&kind| match self.deadlines[kind.index()] {
                Some(deadline) if deadline <= now => Some((deadline, kind)),
                _ => None,
            })
            .collect();
        expired.sort_by_key(|(deadline, _)| *deadline);

        for (_, kind) in &expired {
            self.cancel(*kind);
        }
        expired.into_iter().map(|(_, kind)| kind).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_arm_is_noop_when_pending() {
        let now = Instant::now();
        let mut timers = TimerTable::new();
        assert!(timers.arm(TimerKind::Rto, now + Duration::from_millis(10)));
        assert!(!timers.arm(TimerKind::Rto, now + Duration::from_millis(99)));
        assert_eq!(
            timers.deadline(TimerKind::Rto),
            Some(now + Duration::from_millis(10))
        );

        timers.rearm(TimerKind::Rto, now + Duration::from_millis(99));
        assert_eq!(
            timers.deadline(TimerKind::Rto),
            Some(now + Duration::from_millis(99))
        );
    }

    #[test]
    fn test_take_expired_disarms_in_order() {
        let now = Instant::now();
        let mut timers = TimerTable::new();
        timers.arm(TimerKind::Pto, now + Duration::from_millis(5));
        timers.arm(TimerKind::AckDelay, now + Duration::from_millis(2));
        timers.arm(TimerKind::Rto, now + Duration::from_millis(50));

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(2)));

        let expired = timers.take_expired(now + Duration::from_millis(10));
        assert_eq!(expired, vec![TimerKind::AckDelay, TimerKind::Pto]);
        assert!(!timers.is_armed(TimerKind::Pto));
        assert!(timers.is_armed(TimerKind::Rto));
        assert!(timers.take_expired(now + Duration::from_millis(10)).is_empty());
    }
}
