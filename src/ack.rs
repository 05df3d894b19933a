//! ACK 엔진 (수신측)
//!
//! - 수신한 패킷 번호를 누적(cumulative) / 비트맵 ACK 레코드로 요약
//! - 초기 N개 ack-eliciting 패킷은 즉시 ACK, 이후에는 지연 + 병합
//! - 순서가 어긋난 도착, 중복 도착은 즉시 ACK (송신측 손실 감지 가속)
//!
//! 송신측 처리(RTT 샘플, outstanding 패킷 정리)는 `recovery` 모듈에서
//! [`AckRecord::acknowledges`]를 기준으로 수행한다.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::Config;

/// 패킷 번호 (송신자별 단조 증가)
pub type PacketNumber = u64;

/// 비트맵이 표현하는 이전 패킷 수
pub const ACK_BITMAP_WIDTH: u64 = 64;

/// ACK 레코드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckRecord {
    /// `largest` 이하 모든 패킷 수신
    Cumulative { largest: PacketNumber },

    /// `largest` + 직전 64개 패킷의 수신 비트맵
    /// (bit i 가 1이면 `largest - (i + 1)` 수신)
    Bitmap { largest: PacketNumber, bitmap: u64 },
}

impl AckRecord {
    /// 최대 ACK 패킷 번호
    pub fn largest(&self) -> PacketNumber {
        match *self {
            AckRecord::Cumulative { largest } => largest,
            AckRecord::Bitmap { largest, .. } => largest,
        }
    }

    /// 이 레코드가 `pn`을 확인(ack)하는지 여부
    pub fn acknowledges(&self, pn: PacketNumber) -> bool {
        match *self {
            AckRecord::Cumulative { largest } => pn <= largest,
            AckRecord::Bitmap { largest, bitmap } => {
                if pn == largest {
                    return true;
                }
                if pn > largest {
                    return false;
                }
                let distance = largest - pn;
                distance <= ACK_BITMAP_WIDTH && bitmap & (1u64 << (distance - 1)) != 0
            }
        }
    }

    /// 이 레코드가 확인할 수 있는 가장 작은 패킷 번호
    pub fn lowest_covered(&self) -> PacketNumber {
        match *self {
            AckRecord::Cumulative { .. } => 0,
            AckRecord::Bitmap { largest, .. } => largest.saturating_sub(ACK_BITMAP_WIDTH),
        }
    }
}

/// ACK 전송 시점 결정
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// ACK 불필요 (ACK-only 패킷)
    None,
    /// 지연 ACK 타이머로 병합
    Delayed,
    /// 즉시 ACK
    Immediate,
}

/// 패킷 도착 처리 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arrival {
    pub decision: AckDecision,
    pub duplicate: bool,
}

/// 수신측 ACK 상태
#[derive(Debug)]
pub struct AckTracker {
    /// 누적 구간 위쪽에서 수신한 패킷 번호 (최근 64개 범위만 유지)
    received: BTreeSet<PacketNumber>,

    /// 0..=n 이 모두 수신된 최대 n
    contiguous_through: Option<PacketNumber>,

    /// 최대 수신 패킷 번호
    largest: Option<PacketNumber>,

    /// 누적 ack-eliciting 패킷 수
    ack_eliciting_received: u64,

    /// 마지막 ACK 이후 ack-eliciting 패킷 수
    unacked_eliciting: u64,

    /// 보낼 ACK가 있는지
    ack_pending: bool,

    immediate_ack_packets: u64,
    ack_eliciting_threshold: u64,
    ack_delay_fraction: f64,
    min_ack_delay: Duration,
    max_ack_delay: Duration,
}

impl AckTracker {
    pub fn new(config: &Config) -> Self {
        Self {
            received: BTreeSet::new(),
            contiguous_through: None,
            largest: None,
            ack_eliciting_received: 0,
            unacked_eliciting: 0,
            ack_pending: false,
            immediate_ack_packets: config.immediate_ack_packets,
            ack_eliciting_threshold: config.ack_eliciting_threshold.max(1),
            ack_delay_fraction: config.ack_delay_fraction,
            min_ack_delay: config.min_ack_delay,
            max_ack_delay: config.max_ack_delay,
        }
    }

    /// 패킷 도착 기록
    pub fn on_packet_received(&mut self, pn: PacketNumber, ack_eliciting: bool) -> Arrival {
        if self.is_duplicate(pn) {
            // 중복은 우리 ACK가 유실됐다는 신호일 수 있으므로 다시 ACK
            let decision = if ack_eliciting {
                self.ack_pending = true;
                AckDecision::Immediate
            } else {
                AckDecision::None
            };
            return Arrival {
                decision,
                duplicate: true,
            };
        }

        let expected = self.largest.map_or(0, |l| l + 1);
        let out_of_order = pn != expected;

        self.insert(pn);

        if !ack_eliciting {
            return Arrival {
                decision: AckDecision::None,
                duplicate: false,
            };
        }

        self.ack_eliciting_received += 1;
        self.unacked_eliciting += 1;
        self.ack_pending = true;

        let decision = if self.ack_eliciting_received <= self.immediate_ack_packets
            || out_of_order
            || self.unacked_eliciting >= self.ack_eliciting_threshold
        {
            AckDecision::Immediate
        } else {
            AckDecision::Delayed
        };

        Arrival {
            decision,
            duplicate: false,
        }
    }

    fn is_duplicate(&self, pn: PacketNumber) -> bool {
        self.contiguous_through.map_or(false, |c| pn <= c) || self.received.contains(&pn)
    }

    fn insert(&mut self, pn: PacketNumber) {
        self.received.insert(pn);
        self.largest = Some(self.largest.map_or(pn, |l| l.max(pn)));

        // 누적 구간 확장
        let mut next = self.contiguous_through.map_or(0, |c| c + 1);
        while self.received.remove(&next) {
            self.contiguous_through = Some(next);
            next += 1;
        }

        // 비트맵 범위 밖은 더 이상 보고하지 않음
        if let Some(largest) = self.largest {
            let floor = largest.saturating_sub(ACK_BITMAP_WIDTH);
            while let Some(&lowest) = self.received.iter().next() {
                if lowest >= floor {
                    break;
                }
                self.received.remove(&lowest);
            }
        }
    }

    /// 현재 수신 상태를 ACK 레코드로 요약
    pub fn current_record(&self) -> Option<AckRecord> {
        let largest = self.largest?;
        if self.contiguous_through == Some(largest) {
            return Some(AckRecord::Cumulative { largest });
        }

        let mut bitmap = 0u64;
        for i in 0..ACK_BITMAP_WIDTH {
            let Some(pn) = largest.checked_sub(i + 1) else {
                break;
            };
            if self.is_duplicate(pn) {
                bitmap |= 1u64 << i;
            }
        }
        Some(AckRecord::Bitmap { largest, bitmap })
    }

    /// 보낼 ACK가 있으면 레코드를 꺼내고 대기 상태를 초기화
    pub fn take_ack(&mut self) -> Option<AckRecord> {
        if !self.ack_pending {
            return None;
        }
        let record = self.current_record()?;
        self.ack_pending = false;
        self.unacked_eliciting = 0;
        Some(record)
    }

    /// 보낼 ACK 존재 여부
    pub fn ack_pending(&self) -> bool {
        self.ack_pending
    }

    /// 지연 ACK 시간: SRTT의 일정 비율을 [min, max]로 clamp
    pub fn ack_delay(&self, srtt: Duration) -> Duration {
        srtt.mul_f64(self.ack_delay_fraction)
            .clamp(self.min_ack_delay, self.max_ack_delay)
    }

    /// 최대 수신 패킷 번호
    pub fn largest_received(&self) -> Option<PacketNumber> {
        self.largest
    }
}
