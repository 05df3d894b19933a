//! 혼잡 제어 (slow start + congestion avoidance + 손실 시 곱셈 감소)
//!
//! - `cwnd < ssthresh` 동안 slow start: ACK된 바이트만큼 증가
//! - 이후 congestion avoidance: ACK마다 `max(1, MSS² / cwnd)` 증가
//! - 손실/RTO: `ssthresh = max(cwnd / 2, floor)`, `cwnd = ssthresh`
//!   (한 RTT 창 안에서는 한 번만 감소)

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::Config;

/// 혼잡 제어 상태
#[derive(Debug)]
pub struct CongestionController {
    /// 혼잡 윈도우 (바이트)
    cwnd: u64,

    /// slow start 임계값 (`u64::MAX` = 무한대)
    ssthresh: u64,

    /// ACK 대기 중인 바이트
    bytes_in_flight: u64,

    /// 최대 세그먼트 크기
    mss: u64,

    /// cwnd 하한
    min_cwnd: u64,

    /// RTT를 모를 때의 재시도 백오프
    retry_floor: Duration,

    /// 마지막 윈도우 감소 시각
    last_reduction: Option<Instant>,

    /// 실제로 적용된 윈도우 감소 횟수
    congestion_events: u64,
}

impl CongestionController {
    pub fn new(config: &Config) -> Self {
        Self {
            cwnd: config.initial_cwnd().max(config.min_cwnd()),
            ssthresh: u64::MAX,
            bytes_in_flight: 0,
            mss: config.mss() as u64,
            min_cwnd: config.min_cwnd(),
            retry_floor: config.congestion_retry_floor,
            last_reduction: None,
            congestion_events: 0,
        }
    }

    pub fn cwnd(&self) -> u64 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u64 {
        self.ssthresh
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    pub fn congestion_events(&self) -> u64 {
        self.congestion_events
    }

    /// slow start 구간 여부
    pub fn in_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }

    /// 프로브가 아닌 전송 전 승인 검사
    pub fn can_send(&self, packet_size: usize) -> bool {
        self.bytes_in_flight + packet_size as u64 <= self.cwnd
    }

    /// 전송 거부 시 재시도까지 대기 시간 (SRTT/4, RTT를 모르면 고정 하한)
    pub fn retry_delay(&self, srtt: Option<Duration>) -> Duration {
        match srtt {
            Some(srtt) => (srtt / 4).max(Duration::from_millis(1)),
            None => self.retry_floor,
        }
    }

    /// 패킷 전송 기록
    pub fn on_packet_sent(&mut self, size: usize) {
        self.bytes_in_flight += size as u64;
    }

    /// ACK/손실/재전송 변환으로 outstanding에서 빠진 패킷
    pub fn on_packet_removed(&mut self, size: usize) {
        let size = size as u64;
        if size > self.bytes_in_flight {
            warn!(
                size,
                in_flight = self.bytes_in_flight,
                "bytes_in_flight 언더플로우, 0으로 clamp"
            );
        }
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(size);
    }

    /// `sent_at`에 보낸 패킷이 마지막 윈도우 감소 이전 것인지
    pub fn in_recovery(&self, sent_at: Instant) -> bool {
        self.last_reduction.is_some_and(|start| sent_at <= start)
    }

    /// 새로 ACK된 바이트에 따른 윈도우 증가
    pub fn on_ack(&mut self, bytes_acked: u64) {
        if bytes_acked == 0 {
            return;
        }

        if self.in_slow_start() {
            self.cwnd += bytes_acked;
        } else {
            self.cwnd += (self.mss * self.mss / self.cwnd).max(1);
        }
    }

    /// 손실 감지 또는 RTO에 따른 윈도우 감소
    ///
    /// 직전 감소 후 `srtt`가 지나지 않았으면 무시하고 `false`를 반환한다.
    pub fn on_congestion_event(&mut self, now: Instant, srtt: Duration) -> bool {
        if let Some(last) = self.last_reduction {
            if now.saturating_duration_since(last) < srtt {
                debug!("같은 RTT 창 안의 추가 손실, cwnd 유지");
                return false;
            }
        }

        let before = self.cwnd;
        self.ssthresh = (self.cwnd / 2).max(self.min_cwnd);
        self.cwnd = self.ssthresh;
        self.last_reduction = Some(now);
        self.congestion_events += 1;

        debug!(before, after = self.cwnd, "혼잡 윈도우 감소");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> CongestionController {
        CongestionController::new(&Config::default())
    }

    #[test]
    fn test_slow_start_grows_by_acked_bytes() {
        let mut cc = controller();
        let start = cc.cwnd();
        assert!(cc.in_slow_start());
        assert_eq!(cc.ssthresh(), u64::MAX);

        cc.on_ack(3000);
        assert_eq!(cc.cwnd(), start + 3000);
        cc.on_ack(1);
        assert_eq!(cc.cwnd(), start + 3001);
    }

    #[test]
    fn test_congestion_avoidance_growth() {
        let mut cc = controller();
        let now = Instant::now();
        cc.on_congestion_event(now, Duration::from_millis(50));
        assert!(!cc.in_slow_start());

        let cwnd = cc.cwnd();
        let mss = Config::default().mss() as u64;
        cc.on_ack(100_000);
        assert_eq!(cc.cwnd(), cwnd + (mss * mss / cwnd).max(1));
    }

    #[test]
    fn test_loss_halves_once_per_rtt() {
        let mut cc = controller();
        cc.on_ack(20_000);
        let before = cc.cwnd();
        let now = Instant::now();
        let srtt = Duration::from_millis(100);

        assert!(cc.on_congestion_event(now, srtt));
        assert_eq!(cc.cwnd(), before / 2);
        assert_eq!(cc.ssthresh(), before / 2);

        // 같은 RTT 창 안의 두 번째 손실은 무시
        assert!(!cc.on_congestion_event(now + Duration::from_millis(30), srtt));
        assert_eq!(cc.cwnd(), before / 2);

        // 창이 지나면 다시 감소
        assert!(cc.on_congestion_event(now + Duration::from_millis(150), srtt));
        assert_eq!(cc.cwnd(), before / 4);
        assert_eq!(cc.congestion_events(), 2);
    }

    #[test]
    fn test_recovery_window_covers_earlier_sends() {
        let mut cc = controller();
        let now = Instant::now();
        assert!(!cc.in_recovery(now));

        cc.on_congestion_event(now, Duration::from_millis(50));
        assert!(cc.in_recovery(now - Duration::from_millis(5)));
        assert!(cc.in_recovery(now));
        assert!(!cc.in_recovery(now + Duration::from_millis(1)));
    }

    #[test]
    fn test_cwnd_floor() {
        let config = Config::default();
        let mut cc = controller();
        let mut now = Instant::now();
        for _ in 0..10 {
            cc.on_congestion_event(now, Duration::from_millis(10));
            now += Duration::from_millis(20);
        }
        assert_eq!(cc.cwnd(), config.min_cwnd());
        assert_eq!(cc.ssthresh(), config.min_cwnd());
    }

    #[test]
    fn test_admission_and_in_flight_clamp() {
        let mut cc = controller();
        let cwnd = cc.cwnd() as usize;
        assert!(cc.can_send(cwnd));
        cc.on_packet_sent(cwnd - 100);
        assert!(cc.can_send(100));
        assert!(!cc.can_send(101));

        cc.on_packet_removed(cwnd);
        assert_eq!(cc.bytes_in_flight(), 0);
    }

    #[test]
    fn test_retry_delay() {
        let cc = controller();
        assert_eq!(cc.retry_delay(None), Config::default().congestion_retry_floor);
        assert_eq!(
            cc.retry_delay(Some(Duration::from_millis(80))),
            Duration::from_millis(20)
        );
    }
}
