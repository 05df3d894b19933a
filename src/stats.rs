//! 세션 통계
//!
//! 카운터는 세션마다 따로 가진다. 여러 세션이 한 프로세스에 있어도 서로
//! 섞이지 않는다.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 최근 RTT 샘플 보관 개수
const RTT_HISTORY: usize = 10;

/// 세션 통계
#[derive(Debug, Clone)]
pub struct SessionStats {
    /// 세션 생성 시각
    pub start_time: Instant,

    /// 전송한 패킷 수 (재전송, 프로브 포함)
    pub packets_sent: u64,

    /// 전송한 와이어 바이트
    pub bytes_sent: u64,

    /// 수신한 패킷 수 (디코딩 성공 기준)
    pub packets_received: u64,

    /// 수신한 와이어 바이트
    pub bytes_received: u64,

    /// 처음 전송된 STREAM payload 바이트
    pub stream_bytes_sent: u64,

    /// 애플리케이션에 전달한 STREAM payload 바이트
    pub stream_bytes_delivered: u64,

    /// 재전송 패킷 수 (손실 판정 + RTO)
    pub retransmissions: u64,

    /// 손실로 판정된 패킷 수
    pub packets_lost: u64,

    /// RTO 발생 횟수
    pub rto_count: u64,

    /// PTO 발생 횟수 (프로브 전송)
    pub pto_count: u64,

    /// 실제로 적용된 혼잡 윈도우 감소 횟수
    pub congestion_events: u64,

    /// 전송한 ACK 프레임 수
    pub acks_sent: u64,

    /// 수신한 ACK 프레임 수
    pub acks_received: u64,

    /// 중복 수신 패킷 수
    pub duplicate_packets: u64,

    /// 디코딩 실패/잘린 데이터그램 수
    pub malformed_datagrams: u64,

    /// 혼잡/흐름 제어/핸드쉐이크로 미뤄진 전송 요청 수
    pub deferred_sends: u64,

    /// 수신 완료된 스트림 수
    pub streams_completed: u64,

    /// 최근 RTT 샘플
    rtt_samples: VecDeque<Duration>,
}

impl SessionStats {
    pub fn new(start_time: Instant) -> Self {
        Self {
            start_time,
            packets_sent: 0,
            bytes_sent: 0,
            packets_received: 0,
            bytes_received: 0,
            stream_bytes_sent: 0,
            stream_bytes_delivered: 0,
            retransmissions: 0,
            packets_lost: 0,
            rto_count: 0,
            pto_count: 0,
            congestion_events: 0,
            acks_sent: 0,
            acks_received: 0,
            duplicate_packets: 0,
            malformed_datagrams: 0,
            deferred_sends: 0,
            streams_completed: 0,
            rtt_samples: VecDeque::with_capacity(RTT_HISTORY),
        }
    }

    /// 패킷 전송 기록
    pub fn record_sent(&mut self, wire_size: usize) {
        self.packets_sent += 1;
        self.bytes_sent += wire_size as u64;
    }

    /// 패킷 수신 기록
    pub fn record_received(&mut self, wire_size: usize) {
        self.packets_received += 1;
        self.bytes_received += wire_size as u64;
    }

    /// RTT 샘플 기록
    pub fn record_rtt(&mut self, sample: Duration) {
        if self.rtt_samples.len() >= RTT_HISTORY {
            self.rtt_samples.pop_front();
        }
        self.rtt_samples.push_back(sample);
    }

    /// 최근 RTT 샘플 평균
    pub fn average_rtt(&self) -> Option<Duration> {
        if self.rtt_samples.is_empty() {
            return None;
        }
        let total: Duration = self.rtt_samples.iter().sum();
        Some(total / self.rtt_samples.len() as u32)
    }

    /// 경과 시간
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.start_time)
    }

    /// 유효 처리율 (전달된 스트림 바이트/초)
    pub fn goodput(&self, now: Instant) -> f64 {
        let elapsed = self.elapsed(now).as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.stream_bytes_delivered as f64 / elapsed
    }

    /// 재전송 비율
    pub fn retransmission_rate(&self) -> f64 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        self.retransmissions as f64 / self.packets_sent as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self, now: Instant) -> String {
        format!(
            "Elapsed: {:.2}s | Sent: {} pkts / {} B | Recv: {} pkts / {} B | Retx: {} ({:.2}%) | Lost: {} | RTO: {} | PTO: {} | CE: {} | Streams: {} | Goodput: {:.2} MB/s",
            self.elapsed(now).as_secs_f64(),
            self.packets_sent,
            self.bytes_sent,
            self.packets_received,
            self.bytes_received,
            self.retransmissions,
            self.retransmission_rate() * 100.0,
            self.packets_lost,
            self.rto_count,
            self.pto_count,
            self.congestion_events,
            self.streams_completed,
            self.goodput(now) / 1_000_000.0,
        )
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtt_history_is_bounded() {
        let mut stats = SessionStats::default();
        assert_eq!(stats.average_rtt(), None);
        for ms in 1..=20 {
            stats.record_rtt(Duration::from_millis(ms));
        }
        // 최근 10개 (11..=20) 평균
        assert_eq!(stats.average_rtt(), Some(Duration::from_micros(15_500)));
    }

    #[test]
    fn test_rates() {
        let start = Instant::now();
        let mut stats = SessionStats::new(start);
        assert_eq!(stats.retransmission_rate(), 0.0);
        assert_eq!(stats.goodput(start), 0.0);

        for _ in 0..4 {
            stats.record_sent(1000);
        }
        stats.retransmissions = 1;
        stats.stream_bytes_delivered = 2_000_000;

        assert_eq!(stats.retransmission_rate(), 0.25);
        assert_eq!(stats.goodput(start + Duration::from_secs(2)), 1_000_000.0);
        assert!(stats.summary(start + Duration::from_secs(2)).contains("Retx: 1"));
    }
}
