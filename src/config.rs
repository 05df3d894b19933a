//! 전송 설정
//!
//! 손실 임계값, 초기 윈도우, ACK 지연 같은 상수는 실험마다 달라지므로
//! 모두 설정값으로 둔다.

use std::time::Duration;

use crate::{DEFAULT_HEADER_OVERHEAD, DEFAULT_MTU};

/// 세션 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 명목 MTU (데이터그램 최대 크기, 바이트)
    pub mtu: usize,

    /// 전송 계층 헤더 오버헤드 추정치 (IP + UDP)
    pub header_overhead: usize,

    /// 초기 혼잡 윈도우 (MSS 배수)
    pub initial_cwnd_packets: usize,

    /// 혼잡 윈도우 하한 (MSS 배수)
    pub min_cwnd_packets: usize,

    /// 패킷 임계값 K: 최대 ACK 번호보다 K 초과로 뒤처진 패킷은 손실 후보
    pub packet_threshold: u64,

    /// 시간 임계값 배수 (SRTT × 이 값)
    pub time_threshold: f64,

    /// 타이머 해상도 (시간 임계값/RTO 하한에 사용)
    pub timer_granularity: Duration,

    /// RTT 샘플이 없을 때의 초기 RTT
    pub initial_rtt: Duration,

    /// RTO 하한
    pub min_rto: Duration,

    /// RTO 상한 (지수 백오프 캡)
    pub max_rto: Duration,

    /// 즉시 ACK하는 초기 ack-eliciting 패킷 수
    pub immediate_ack_packets: u64,

    /// 지연 ACK 중이라도 이만큼 쌓이면 즉시 ACK
    pub ack_eliciting_threshold: u64,

    /// ACK 지연 = SRTT × 이 비율 (아래 범위로 clamp)
    pub ack_delay_fraction: f64,

    /// ACK 지연 하한
    pub min_ack_delay: Duration,

    /// ACK 지연 상한
    pub max_ack_delay: Duration,

    /// 연결 단위 흐름 제어 윈도우 (바이트)
    pub connection_window: u64,

    /// 스트림 단위 흐름 제어 윈도우 (바이트)
    pub stream_window: u64,

    /// RTT를 모를 때 혼잡 윈도우 재시도 백오프
    pub congestion_retry_floor: Duration,

    /// 핸드쉐이크 지연 (암호화 없이 고정 지연으로만 모델링)
    pub handshake_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            header_overhead: DEFAULT_HEADER_OVERHEAD,
            initial_cwnd_packets: 10,
            min_cwnd_packets: 2,
            packet_threshold: 3,
            time_threshold: 9.0 / 8.0,
            timer_granularity: Duration::from_millis(1),
            initial_rtt: Duration::from_millis(100),
            min_rto: Duration::from_millis(200),
            max_rto: Duration::from_secs(10),
            immediate_ack_packets: 16,
            ack_eliciting_threshold: 10,
            ack_delay_fraction: 0.25,
            min_ack_delay: Duration::from_millis(1),
            max_ack_delay: Duration::from_millis(25),
            connection_window: 4 * 1024 * 1024, // 4MB
            stream_window: 1024 * 1024,         // 1MB
            congestion_retry_floor: Duration::from_millis(5),
            handshake_delay: Duration::ZERO,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 최대 세그먼트 크기 (혼잡 제어 단위)
    pub fn mss(&self) -> usize {
        self.mtu
    }

    /// 실효 MTU: 명목 MTU에서 전송 헤더 오버헤드를 뺀 값
    pub fn effective_mtu(&self) -> usize {
        self.mtu.saturating_sub(self.header_overhead)
    }

    /// 초기 혼잡 윈도우 (바이트)
    pub fn initial_cwnd(&self) -> u64 {
        (self.initial_cwnd_packets * self.mss()) as u64
    }

    /// 혼잡 윈도우 하한 (바이트)
    pub fn min_cwnd(&self) -> u64 {
        (self.min_cwnd_packets * self.mss()) as u64
    }

    /// 손실이 잦은 링크용 설정
    pub fn lossy_link() -> Self {
        Self {
            initial_cwnd_packets: 4,
            packet_threshold: 5,
            time_threshold: 5.0 / 4.0,
            immediate_ack_packets: 32,
            ack_eliciting_threshold: 4,
            max_ack_delay: Duration::from_millis(10),
            ..Self::default()
        }
    }

    /// 저지연 링크용 설정
    pub fn low_latency() -> Self {
        Self {
            initial_rtt: Duration::from_millis(20),
            min_rto: Duration::from_millis(50),
            max_ack_delay: Duration::from_millis(5),
            congestion_retry_floor: Duration::from_millis(1),
            ..Self::default()
        }
    }

    /// 핸드쉐이크 지연 지정
    pub fn with_handshake_delay(mut self, delay: Duration) -> Self {
        self.handshake_delay = delay;
        self
    }
}
