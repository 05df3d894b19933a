//! 손실 감지 및 재전송 타이머
//!
//! - outstanding 패킷 테이블 (전송 ~ ACK 또는 재전송 변환까지)
//! - RTT 추정 (SRTT / RTTVAR, 지수 평활)
//! - 패킷 임계값 + 시간 임계값 손실 감지
//! - RTO 지수 백오프 (상한 있음), ACK 진행 시 리셋
//!
//! 손실된 패킷의 번호는 재사용하지 않는다. 프레임만 꺼내 새 번호의 패킷으로
//! 다시 보내는 것은 세션의 몫이다.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::ack::{AckRecord, PacketNumber};
use crate::frame::Frame;
use crate::Config;

/// outstanding 패킷 (전송 후 ACK 대기)
#[derive(Debug, Clone)]
pub struct SentPacket {
    /// 패킷 번호
    pub number: PacketNumber,

    /// 전송 시각
    pub sent_at: Instant,

    /// 와이어 크기 (bytes_in_flight 계산 단위)
    pub size: usize,

    /// 원본 프레임 (재전송용)
    pub frames: Vec<Frame>,
}

impl SentPacket {
    /// 재전송해야 할 프레임만 추출
    pub fn into_retransmittable(self) -> impl Iterator<Item = Frame> {
        self.frames.into_iter().filter(Frame::is_retransmittable)
    }
}

/// RTT 추정기
#[derive(Debug)]
pub struct RttEstimator {
    /// 평활 RTT (샘플 전에는 None)
    srtt: Option<Duration>,

    /// RTT 변동
    rttvar: Duration,

    /// 최근 샘플
    latest: Option<Duration>,

    /// 샘플 전 사용할 초기 RTT
    initial_rtt: Duration,

    /// 현재 RTO (백오프 반영)
    current_rto: Duration,

    min_rto: Duration,
    max_rto: Duration,
}

impl RttEstimator {
    pub fn new(config: &Config) -> Self {
        let mut estimator = Self {
            srtt: None,
            rttvar: config.initial_rtt / 2,
            latest: None,
            initial_rtt: config.initial_rtt,
            current_rto: config.min_rto,
            min_rto: config.min_rto,
            max_rto: config.max_rto,
        };
        estimator.reset_rto();
        estimator
    }

    /// RTT 샘플 반영
    ///
    /// 첫 샘플: SRTT = R, RTTVAR = R/2
    /// 이후:   RTTVAR += (|R − SRTT| − RTTVAR) / 4,  SRTT += (R − SRTT) / 8
    pub fn update(&mut self, sample: Duration) {
        self.latest = Some(sample);
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                let diff = sample.abs_diff(srtt);
                self.rttvar = self.rttvar * 3 / 4 + diff / 4;
                self.srtt = Some(srtt * 7 / 8 + sample / 8);
            }
        }
    }

    /// 평활 RTT (샘플 전에는 초기 RTT)
    pub fn smoothed(&self) -> Duration {
        self.srtt.unwrap_or(self.initial_rtt)
    }

    /// 샘플이 있을 때만 SRTT
    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    pub fn latest(&self) -> Option<Duration> {
        self.latest
    }

    /// 백오프 없는 RTO: `max(SRTT + 4 × RTTVAR, floor)`, 상한 적용
    pub fn base_rto(&self) -> Duration {
        (self.smoothed() + self.rttvar * 4)
            .max(self.min_rto)
            .min(self.max_rto)
    }

    /// 현재 RTO (백오프 반영)
    pub fn rto(&self) -> Duration {
        self.current_rto
    }

    /// RTO 만료 시 두 배 (상한 있음)
    pub fn back_off(&mut self) {
        self.current_rto = (self.current_rto * 2).min(self.max_rto);
    }

    /// ACK 진행 시 백오프 해제
    pub fn reset_rto(&mut self) {
        self.current_rto = self.base_rto();
    }
}

/// ACK 처리 결과
#[derive(Debug, Default)]
pub struct AckOutcome {
    /// 이번 ACK로 새로 확인된 패킷
    pub newly_acked: Vec<SentPacket>,

    /// 손실로 판정된 패킷
    pub lost: Vec<SentPacket>,

    /// RTT 샘플 (최대 ACK 번호가 outstanding에 있었을 때)
    pub rtt_sample: Option<Duration>,
}

impl AckOutcome {
    /// 새로 확인된 바이트
    pub fn bytes_acked(&self) -> u64 {
        self.newly_acked.iter().map(|p| p.size as u64).sum()
    }
}

/// 송신측 손실 복구 상태
#[derive(Debug)]
pub struct Recovery {
    /// outstanding 패킷 (번호 순)
    sent: BTreeMap<PacketNumber, SentPacket>,

    /// outstanding 와이어 크기 합
    outstanding_bytes: u64,

    /// 지금까지 받은 최대 ACK 번호
    largest_acked: Option<PacketNumber>,

    /// RTT 추정기
    rtt: RttEstimator,

    packet_threshold: u64,
    time_threshold: f64,
    timer_granularity: Duration,
    max_ack_delay: Duration,
}

impl Recovery {
    pub fn new(config: &Config) -> Self {
        Self {
            sent: BTreeMap::new(),
            outstanding_bytes: 0,
            largest_acked: None,
            rtt: RttEstimator::new(config),
            packet_threshold: config.packet_threshold,
            time_threshold: config.time_threshold,
            timer_granularity: config.timer_granularity,
            max_ack_delay: config.max_ack_delay,
        }
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn largest_acked(&self) -> Option<PacketNumber> {
        self.largest_acked
    }

    /// outstanding 패킷 수
    pub fn outstanding(&self) -> usize {
        self.sent.len()
    }

    /// outstanding 와이어 크기 합
    pub fn outstanding_bytes(&self) -> u64 {
        self.outstanding_bytes
    }

    pub fn has_outstanding(&self) -> bool {
        !self.sent.is_empty()
    }

    /// 전송 기록
    pub fn on_packet_sent(&mut self, packet: SentPacket) {
        self.outstanding_bytes += packet.size as u64;
        if let Some(old) = self.sent.insert(packet.number, packet) {
            // 번호 재사용은 일어나면 안 됨
            debug!(number = old.number, "중복 패킷 번호 덮어씀");
            self.outstanding_bytes -= old.size as u64;
        }
    }

    fn remove(&mut self, pn: PacketNumber) -> Option<SentPacket> {
        let packet = self.sent.remove(&pn)?;
        self.outstanding_bytes -= packet.size as u64;
        Some(packet)
    }

    /// 손실 판정 지연: `max(SRTT × 시간 임계값, 타이머 해상도)`
    pub fn loss_delay(&self) -> Duration {
        self.rtt
            .smoothed()
            .mul_f64(self.time_threshold)
            .max(self.timer_granularity)
    }

    /// PTO 간격: RTO보다 조금 김 (백오프 반영 RTO + 최대 ACK 지연)
    pub fn pto_interval(&self) -> Duration {
        self.rtt.rto() + self.max_ack_delay
    }

    /// ACK 수신 처리: RTT 샘플 → ACK된 패킷 정리 → 손실 감지
    pub fn on_ack_received(&mut self, record: AckRecord, now: Instant) -> AckOutcome {
        let largest = record.largest();
        let mut outcome = AckOutcome::default();

        if let Some(packet) = self.sent.get(&largest) {
            let sample = now.saturating_duration_since(packet.sent_at);
            self.rtt.update(sample);
            outcome.rtt_sample = Some(sample);
        }

        self.largest_acked = Some(self.largest_acked.map_or(largest, |l| l.max(largest)));

        let acked: Vec<PacketNumber> = self
            .sent
            .range(record.lowest_covered()..=largest)
            .map(|(&pn, _)| pn)
            .filter(|&pn| record.acknowledges(pn))
            .collect();
        for pn in acked {
            if let Some(packet) = self.remove(pn) {
                outcome.newly_acked.push(packet);
            }
        }

        if !outcome.newly_acked.is_empty() {
            self.rtt.reset_rto();
        }

        outcome.lost = self.detect_lost(now);
        outcome
    }

    /// 패킷 임계값과 시간 임계값을 모두 넘은 패킷을 손실로 판정해 제거
    pub fn detect_lost(&mut self, now: Instant) -> Vec<SentPacket> {
        let Some(largest_acked) = self.largest_acked else {
            return Vec::new();
        };
        let loss_delay = self.loss_delay();
        let threshold = self.packet_threshold;

        let lost: Vec<PacketNumber> = self
            .sent
            .range(..largest_acked)
            .filter(|(&pn, packet)| {
                largest_acked - pn > threshold
                    && now.saturating_duration_since(packet.sent_at) > loss_delay
            })
            .map(|(&pn, _)| pn)
            .collect();

        lost.into_iter().filter_map(|pn| self.remove(pn)).collect()
    }

    /// RTO 만료: 가장 오래된 outstanding 패킷을 꺼내고 RTO 백오프
    pub fn on_rto(&mut self) -> Option<SentPacket> {
        let oldest = *self.sent.keys().next()?;
        let packet = self.remove(oldest);
        self.rtt.back_off();
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn sent(number: u64, sent_at: Instant) -> SentPacket {
        SentPacket {
            number,
            sent_at,
            size: 1000,
            frames: vec![Frame::Stream {
                stream_id: 0,
                offset: number * 100,
                data: Bytes::from(vec![0u8; 100]),
                fin: false,
            }],
        }
    }

    #[test]
    fn test_rtt_smoothing() {
        let mut rtt = RttEstimator::new(&Config::default());
        rtt.update(ms(100));
        assert_eq!(rtt.srtt(), Some(ms(100)));
        assert_eq!(rtt.rttvar(), ms(50));

        rtt.update(ms(180));
        // RTTVAR = 50 + (80 - 50)/4 = 57.5, SRTT = 100 + 80/8 = 110
        assert_eq!(rtt.srtt(), Some(ms(110)));
        assert_eq!(rtt.rttvar(), Duration::from_micros(57_500));
    }

    #[test]
    fn test_rto_backoff_and_reset() {
        let config = Config::default();
        let mut rtt = RttEstimator::new(&config);
        rtt.update(ms(100));
        rtt.reset_rto();
        let base = rtt.base_rto();
        assert_eq!(base, ms(300));

        rtt.back_off();
        assert_eq!(rtt.rto(), ms(600));
        rtt.back_off();
        assert_eq!(rtt.rto(), ms(1200));
        for _ in 0..20 {
            rtt.back_off();
        }
        assert_eq!(rtt.rto(), config.max_rto);

        rtt.reset_rto();
        assert_eq!(rtt.rto(), base);
    }

    #[test]
    fn test_rto_floor() {
        let mut rtt = RttEstimator::new(&Config::default());
        rtt.update(ms(1));
        rtt.reset_rto();
        assert_eq!(rtt.rto(), Config::default().min_rto);
    }

    #[test]
    fn test_ack_retires_and_samples_rtt() {
        let t0 = Instant::now();
        let mut recovery = Recovery::new(&Config::default());
        for pn in 0..4 {
            recovery.on_packet_sent(sent(pn, t0));
        }
        assert_eq!(recovery.outstanding_bytes(), 4000);

        let outcome = recovery.on_ack_received(
            AckRecord::Bitmap {
                largest: 3,
                bitmap: 0b100,
            },
            t0 + ms(40),
        );
        let acked: Vec<u64> = outcome.newly_acked.iter().map(|p| p.number).collect();
        assert_eq!(acked, vec![0, 3]);
        assert_eq!(outcome.rtt_sample, Some(ms(40)));
        assert_eq!(outcome.bytes_acked(), 2000);
        assert_eq!(recovery.outstanding_bytes(), 2000);
        assert!(outcome.lost.is_empty());

        // 이미 ACK된 최대 번호는 RTT 샘플을 다시 만들지 않음
        let again = recovery.on_ack_received(AckRecord::Cumulative { largest: 3 }, t0 + ms(90));
        assert_eq!(again.rtt_sample, None);
        assert_eq!(again.newly_acked.len(), 2);
        assert!(!recovery.has_outstanding());
    }

    #[test]
    fn test_loss_requires_both_thresholds() {
        let t0 = Instant::now();
        let mut recovery = Recovery::new(&Config::default());
        for pn in 0..10 {
            recovery.on_packet_sent(sent(pn, t0));
        }

        // 9만 ACK (RTT 50ms): 0..=5 는 패킷 임계값(3 초과) 충족,
        // 경과 50ms < 손실 지연 56.25ms 라 시간 임계값 미충족
        let outcome = recovery.on_ack_received(
            AckRecord::Bitmap {
                largest: 9,
                bitmap: 0,
            },
            t0 + ms(50),
        );
        assert!(outcome.lost.is_empty());
        let loss_delay = recovery.loss_delay();
        assert!(loss_delay > ms(50));

        // 충분히 시간이 지나면 패킷 임계값을 넘은 것만 손실
        let lost = recovery.detect_lost(t0 + loss_delay + ms(1));
        let lost: Vec<u64> = lost.iter().map(|p| p.number).collect();
        assert_eq!(lost, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(recovery.outstanding(), 3);
        assert_eq!(recovery.outstanding_bytes(), 3000);
    }

    #[test]
    fn test_rto_pops_oldest() {
        let t0 = Instant::now();
        let mut recovery = Recovery::new(&Config::default());
        recovery.on_packet_sent(sent(4, t0));
        recovery.on_packet_sent(sent(2, t0));
        let rto_before = recovery.rtt().rto();

        let packet = recovery.on_rto().unwrap();
        assert_eq!(packet.number, 2);
        assert_eq!(recovery.rtt().rto(), rto_before * 2);
        assert_eq!(recovery.outstanding_bytes(), 1000);
        assert_eq!(packet.into_retransmittable().count(), 1);
    }

    #[test]
    fn test_pto_follows_rto_backoff() {
        let t0 = Instant::now();
        let config = Config::default();
        let mut recovery = Recovery::new(&config);
        recovery.on_packet_sent(sent(0, t0));
        recovery.on_packet_sent(sent(1, t0));
        assert_eq!(
            recovery.pto_interval(),
            recovery.rtt().rto() + config.max_ack_delay
        );

        recovery.on_rto().unwrap();
        let backed_off = recovery.rtt().rto();
        assert!(backed_off > recovery.rtt().base_rto());
        assert!(recovery.pto_interval() > backed_off);
        assert_eq!(recovery.pto_interval(), backed_off + config.max_ack_delay);
    }
}
