//! 세션: 논리 연결 하나의 전송 상태 전체
//!
//! 세션은 스스로 실행되지 않는 상태 기계다. 호스트(실제 소켓 또는 시뮬레이터)가
//! 세 가지 진입점으로만 구동한다.
//!
//! - [`Session::send_stream_data`]: 애플리케이션 쓰기
//! - [`Session::on_datagram_received`]: 데이터그램 도착
//! - [`Session::on_timeout`]: [`Session::next_timeout`] 시각 도달
//!
//! 시간은 항상 호출자가 `now`로 넘긴다. 바깥으로 나가는 효과는 생성 시 받은
//! [`DatagramSink`] / [`StreamDataSink`] 호출뿐이다.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::ack::{AckDecision, AckRecord, AckTracker, PacketNumber};
use crate::congestion::CongestionController;
use crate::flow::{FlowController, RecvWindow};
use crate::frame::{Decoded, Frame, StreamId};
use crate::packet::{packetize, Packet, PacketBuilder};
use crate::reassembly::{Delivery, Reassembler, RecvStream};
use crate::recovery::{Recovery, SentPacket};
use crate::stats::SessionStats;
use crate::stream::SendStream;
use crate::timer::{TimerKind, TimerTable};
use crate::{Config, Error, Result};

/// 데이터그램 출력 (소켓, 시뮬레이터 링크 등)
pub trait DatagramSink: Send {
    fn send_datagram(&mut self, datagram: Bytes);
}

/// 재조립된 스트림 데이터 수신자
///
/// 같은 스트림에 대해 오프셋 순서대로, 바이트마다 한 번씩 호출된다.
/// `fin = true`는 스트림당 정확히 한 번.
pub trait StreamDataSink: Send {
    fn on_stream_data(&mut self, stream_id: StreamId, offset: u64, data: Bytes, fin: bool);
}

/// 전송이 미뤄진 이유
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// 혼잡 윈도우 부족
    Congestion,
    /// 흐름 제어 윈도우 부족 (상대의 MAX_DATA / MAX_STREAM_DATA 대기)
    FlowControl,
    /// 핸드쉐이크 지연 중
    Handshake,
}

/// 전송 요청 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// 모든 데이터가 패킷으로 나감
    Sent,

    /// 일부 또는 전부가 스트림에 남아 있음. 세션이 알아서 재시도한다.
    Deferred {
        reason: DeferReason,
        retry_after: Option<Duration>,
    },
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent)
    }
}

/// 세션
pub struct Session<D, S> {
    /// 설정
    config: Config,

    /// 생성 시각
    created_at: Instant,

    /// 핸드쉐이크 완료 시각 (생성 + 고정 지연)
    handshake_done_at: Instant,

    /// 다음 패킷 번호
    next_packet_number: PacketNumber,

    /// 혼잡 제어
    cc: CongestionController,

    /// 손실 복구 (outstanding, RTT, RTO)
    recovery: Recovery,

    /// 수신측 ACK 상태
    acks: AckTracker,

    /// 다음 flush에서 ACK를 바로 보내야 하는지
    ack_immediate: bool,

    /// 송신 흐름 제어
    flow: FlowController,

    /// 수신 연결 윈도우
    conn_recv: RecvWindow,

    /// 수신 스트림 윈도우
    stream_recv: HashMap<StreamId, RecvWindow>,

    /// 수신 스트림 재조립
    reassembler: Reassembler,

    /// 송신 스트림
    send_streams: BTreeMap<StreamId, SendStream>,

    /// 라운드 로빈: 마지막으로 데이터를 보낸 스트림
    last_served: Option<StreamId>,

    /// 손실/RTO로 다시 보낼 프레임
    retransmit: VecDeque<Frame>,

    /// 보낼 흐름 제어 프레임
    control: VecDeque<Frame>,

    /// 애플리케이션이 요청한 PING
    ping_pending: bool,

    /// 타이머
    timers: TimerTable,

    /// 통계
    stats: SessionStats,

    datagrams: D,
    deliveries: S,
}

impl<D: DatagramSink, S: StreamDataSink> Session<D, S> {
    /// 새 세션 생성
    pub fn new(config: Config, now: Instant, datagrams: D, deliveries: S) -> Self {
        Self {
            created_at: now,
            handshake_done_at: now + config.handshake_delay,
            next_packet_number: 0,
            cc: CongestionController::new(&config),
            recovery: Recovery::new(&config),
            acks: AckTracker::new(&config),
            ack_immediate: false,
            flow: FlowController::new(&config),
            conn_recv: RecvWindow::new(config.connection_window),
            stream_recv: HashMap::new(),
            reassembler: Reassembler::new(),
            send_streams: BTreeMap::new(),
            last_served: None,
            retransmit: VecDeque::new(),
            control: VecDeque::new(),
            ping_pending: false,
            timers: TimerTable::new(),
            stats: SessionStats::new(now),
            config,
            datagrams,
            deliveries,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// 송신 스트림 열기 (이미 열려 있으면 무시)
    pub fn open_stream(&mut self, stream_id: StreamId) {
        if self.send_streams.contains_key(&stream_id) {
            debug!(stream_id, "이미 열린 스트림");
            return;
        }
        self.send_streams.insert(stream_id, SendStream::new(stream_id));
        self.flow.open_stream(stream_id);
        debug!(stream_id, "스트림 열림");
    }

    /// 스트림에 데이터 쓰기
    ///
    /// 데이터는 스트림의 현재 전송 오프셋 뒤에 붙는다. 흐름/혼잡 제어로
    /// 당장 보낼 수 없는 부분은 스트림에 남고 [`SendOutcome::Deferred`]가
    /// 반환된다. 남은 데이터는 윈도우가 열리면 세션이 보낸다.
    pub fn send_stream_data(
        &mut self,
        stream_id: StreamId,
        data: Bytes,
        fin: bool,
        now: Instant,
    ) -> Result<SendOutcome> {
        let stream = self
            .send_streams
            .get_mut(&stream_id)
            .ok_or(Error::UnknownStream { stream_id })?;
        stream.write(data, fin)?;

        self.flush(now);
        Ok(self.stream_outcome(stream_id, now))
    }

    /// 수신 스트림의 전체 크기를 외부에서 선언 (헤더 등)
    pub fn declare_stream_size(&mut self, stream_id: StreamId, total: u64) {
        let deliveries = self.reassembler.declare_size(stream_id, total);
        self.deliver(stream_id, deliveries);
    }

    /// ACK를 유도하는 PING 전송
    pub fn send_ping(&mut self, now: Instant) {
        self.ping_pending = true;
        self.flush(now);
    }

    /// 데이터그램 수신
    ///
    /// 디코딩 실패는 로그와 통계만 남기고 무시한다.
    pub fn on_datagram_received(&mut self, datagram: &[u8], now: Instant) {
        let packet = match Packet::from_bytes(datagram) {
            Ok(Decoded::Complete { value, .. }) => value,
            Ok(Decoded::Incomplete { needed }) => {
                self.stats.malformed_datagrams += 1;
                warn!(len = datagram.len(), needed, "잘린 데이터그램 폐기");
                return;
            }
            Err(e) => {
                self.stats.malformed_datagrams += 1;
                warn!("데이터그램 디코딩 실패, 폐기: {}", e);
                return;
            }
        };

        self.stats.record_received(datagram.len());
        let arrival = self
            .acks
            .on_packet_received(packet.number, packet.is_ack_eliciting());

        match arrival.decision {
            AckDecision::Immediate => self.ack_immediate = true,
            AckDecision::Delayed => {
                let delay = self.acks.ack_delay(self.recovery.rtt().smoothed());
                self.timers.arm(TimerKind::AckDelay, now + delay);
            }
            AckDecision::None => {}
        }

        if arrival.duplicate {
            self.stats.duplicate_packets += 1;
            debug!(number = packet.number, "중복 패킷, 프레임 무시");
        } else {
            for frame in packet.frames {
                self.on_frame(frame, now);
            }
        }

        self.flush(now);
    }

    /// 만료된 타이머 처리
    pub fn on_timeout(&mut self, now: Instant) {
        for kind in self.timers.take_expired(now) {
            match kind {
                TimerKind::AckDelay => {
                    if self.acks.ack_pending() {
                        self.ack_immediate = true;
                    }
                }
                TimerKind::SendRetry => trace!("전송 재시도"),
                TimerKind::Rto => self.on_rto(now),
                TimerKind::Pto => self.on_pto(now),
            }
        }
        self.flush(now);
    }

    /// 다음에 [`Session::on_timeout`]을 불러야 할 시각
    pub fn next_timeout(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.cc.bytes_in_flight()
    }

    pub fn cwnd_bytes(&self) -> u64 {
        self.cc.cwnd()
    }

    pub fn ssthresh_bytes(&self) -> u64 {
        self.cc.ssthresh()
    }

    /// 평활 RTT (샘플 전에는 초기 RTT)
    pub fn smoothed_rtt(&self) -> Duration {
        self.recovery.rtt().smoothed()
    }

    /// 현재 RTO (백오프 반영)
    pub fn rto(&self) -> Duration {
        self.recovery.rtt().rto()
    }

    /// outstanding 패킷 와이어 크기 합
    pub fn outstanding_bytes(&self) -> u64 {
        self.recovery.outstanding_bytes()
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn send_stream(&self, stream_id: StreamId) -> Option<&SendStream> {
        self.send_streams.get(&stream_id)
    }

    pub fn recv_stream(&self, stream_id: StreamId) -> Option<&RecvStream> {
        self.reassembler.stream(stream_id)
    }

    /// 핸드쉐이크 지연이 끝났는지
    pub fn is_established(&self, now: Instant) -> bool {
        now >= self.handshake_done_at
    }

    /// 보낼 것도, ACK 기다리는 것도 없는 상태
    pub fn is_idle(&self) -> bool {
        !self.recovery.has_outstanding()
            && self.retransmit.is_empty()
            && self.control.is_empty()
            && !self.ping_pending
            && !self.acks.ack_pending()
            && !self.send_streams.values().any(SendStream::has_pending)
    }

    fn max_packet_size(&self) -> usize {
        self.config.effective_mtu()
    }

    fn take_packet_number(&mut self) -> PacketNumber {
        let number = self.next_packet_number;
        self.next_packet_number += 1;
        number
    }

    fn stream_outcome(&mut self, stream_id: StreamId, now: Instant) -> SendOutcome {
        let Some(stream) = self.send_streams.get(&stream_id) else {
            return SendOutcome::Sent;
        };
        if !stream.has_pending() {
            return SendOutcome::Sent;
        }

        let (reason, retry_after) = if now < self.handshake_done_at {
            (DeferReason::Handshake, Some(self.handshake_done_at - now))
        } else if stream.pending_bytes() > 0 && self.flow.available(stream_id) == 0 {
            (DeferReason::FlowControl, None)
        } else {
            (
                DeferReason::Congestion,
                Some(self.cc.retry_delay(self.recovery.rtt().srtt())),
            )
        };

        self.stats.deferred_sends += 1;
        debug!(
            stream_id,
            pending = stream.pending_bytes(),
            ?reason,
            "전송 보류"
        );
        SendOutcome::Deferred {
            reason,
            retry_after,
        }
    }

    fn on_frame(&mut self, frame: Frame, now: Instant) {
        match frame {
            Frame::Stream {
                stream_id,
                offset,
                data,
                fin,
            } => self.on_stream_frame(stream_id, offset, data, fin),
            Frame::Ack(record) => self.on_ack_frame(record, now),
            Frame::Ping => trace!("PING 수신"),
            Frame::MaxData { limit } => {
                self.flow.on_max_data(limit);
            }
            Frame::MaxStreamData { stream_id, limit } => {
                self.flow.on_max_stream_data(stream_id, limit);
            }
        }
    }

    fn on_stream_frame(&mut self, stream_id: StreamId, offset: u64, data: Bytes, fin: bool) {
        let stream_window = self.config.stream_window;
        let window = self
            .stream_recv
            .entry(stream_id)
            .or_insert_with(|| RecvWindow::new(stream_window));
        let end = offset + data.len() as u64;
        if !window.permits(end) {
            warn!(
                stream_id,
                end,
                limit = window.limit(),
                "스트림 흐름 제어 한도를 넘는 데이터 수신"
            );
        }

        let deliveries = self.reassembler.on_data(stream_id, offset, data, fin);
        self.deliver(stream_id, deliveries);
    }

    /// 재조립된 데이터를 애플리케이션에 넘기고 수신 윈도우 갱신
    fn deliver(&mut self, stream_id: StreamId, chunks: Vec<Delivery>) {
        let stream_window = self.config.stream_window;
        for Delivery { offset, data, fin } in chunks {
            let len = data.len() as u64;
            self.stats.stream_bytes_delivered += len;
            self.deliveries.on_stream_data(stream_id, offset, data, fin);

            if len > 0 {
                let window = self
                    .stream_recv
                    .entry(stream_id)
                    .or_insert_with(|| RecvWindow::new(stream_window));
                if let Some(limit) = window.on_consumed(len) {
                    if !fin {
                        self.control
                            .push_back(Frame::MaxStreamData { stream_id, limit });
                    }
                }
                if let Some(limit) = self.conn_recv.on_consumed(len) {
                    self.control.push_back(Frame::MaxData { limit });
                }
            }

            if fin {
                self.stats.streams_completed += 1;
                debug!(stream_id, size = offset + len, "스트림 전달 완료");
            }
        }
    }

    /// ACK 처리: RTT/outstanding 정리 → 손실 감지 → 혼잡 제어 → 타이머
    fn on_ack_frame(&mut self, record: AckRecord, now: Instant) {
        self.stats.acks_received += 1;
        let outcome = self.recovery.on_ack_received(record, now);

        if let Some(sample) = outcome.rtt_sample {
            self.stats.record_rtt(sample);
        }
        for packet in &outcome.newly_acked {
            self.cc.on_packet_removed(packet.size);
        }
        let progressed = !outcome.newly_acked.is_empty();

        if !outcome.lost.is_empty() {
            for packet in outcome.lost {
                self.cc.on_packet_removed(packet.size);
                self.stats.packets_lost += 1;
                debug!(number = packet.number, "패킷 손실 판정");
                self.queue_retransmit(packet);
            }
            self.congestion_event(now);
        }

        // 복구 구간 시작 전에 보낸 패킷의 ACK로는 윈도우를 키우지 않음
        let bytes_acked: u64 = outcome
            .newly_acked
            .iter()
            .filter(|packet| !self.cc.in_recovery(packet.sent_at))
            .map(|packet| packet.size as u64)
            .sum();
        self.cc.on_ack(bytes_acked);
        self.update_loss_timers(now, progressed);
    }

    fn queue_retransmit(&mut self, packet: SentPacket) {
        let before = self.retransmit.len();
        self.retransmit.extend(packet.into_retransmittable());
        if self.retransmit.len() > before {
            self.stats.retransmissions += 1;
        }
    }

    fn congestion_event(&mut self, now: Instant) {
        if self.cc.on_congestion_event(now, self.recovery.rtt().smoothed()) {
            self.stats.congestion_events += 1;
        }
    }

    fn update_loss_timers(&mut self, now: Instant, progressed: bool) {
        if !self.recovery.has_outstanding() {
            self.timers.cancel(TimerKind::Rto);
            self.timers.cancel(TimerKind::Pto);
            return;
        }
        if progressed {
            self.timers
                .rearm(TimerKind::Rto, now + self.recovery.rtt().rto());
            self.timers
                .rearm(TimerKind::Pto, now + self.recovery.pto_interval());
        }
    }

    /// RTO: 가장 오래된 패킷을 혼잡 윈도우와 무관하게 즉시 재전송
    fn on_rto(&mut self, now: Instant) {
        let Some(packet) = self.recovery.on_rto() else {
            return;
        };
        self.stats.rto_count += 1;
        self.cc.on_packet_removed(packet.size);
        warn!(
            number = packet.number,
            next_rto = ?self.recovery.rtt().rto(),
            "RTO 만료, 가장 오래된 패킷 재전송"
        );
        self.congestion_event(now);

        let frames: Vec<Frame> = packet.into_retransmittable().collect();
        if frames.is_empty() {
            self.send_probe(now);
        } else {
            self.stats.retransmissions += 1;
            match packetize(frames, self.max_packet_size(), &mut self.next_packet_number) {
                Ok(packets) => {
                    for packet in packets {
                        self.transmit(packet, now);
                    }
                }
                Err(e) => warn!("재전송 패킷 구성 실패: {}", e),
            }
        }

        if self.recovery.has_outstanding() {
            self.timers
                .rearm(TimerKind::Rto, now + self.recovery.rtt().rto());
        }
    }

    /// PTO: ACK 진행이 없으면 PING으로 ACK를 유도
    fn on_pto(&mut self, now: Instant) {
        if !self.recovery.has_outstanding() {
            return;
        }
        self.stats.pto_count += 1;
        debug!(in_flight = self.cc.bytes_in_flight(), "PTO 만료, 프로브 전송");
        self.send_probe(now);
        self.timers
            .rearm(TimerKind::Pto, now + self.recovery.pto_interval());
    }

    fn send_probe(&mut self, now: Instant) {
        let number = self.take_packet_number();
        self.transmit(Packet::new(number, vec![Frame::Ping]), now);
    }

    /// 패킷 직렬화 후 전송. ack-eliciting이면 outstanding에 등록한다.
    fn transmit(&mut self, packet: Packet, now: Instant) -> bool {
        let bytes = match packet.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(number = packet.number, "패킷 직렬화 실패: {}", e);
                self.retransmit.extend(
                    packet
                        .frames
                        .into_iter()
                        .filter(Frame::is_retransmittable),
                );
                return false;
            }
        };

        let number = packet.number;
        let size = bytes.len();
        self.stats.record_sent(size);
        self.stats.acks_sent += packet
            .frames
            .iter()
            .filter(|f| matches!(f, Frame::Ack(_)))
            .count() as u64;

        if packet.is_ack_eliciting() {
            self.cc.on_packet_sent(size);
            self.recovery.on_packet_sent(SentPacket {
                number,
                sent_at: now,
                size,
                frames: packet.frames,
            });
            self.timers
                .arm(TimerKind::Rto, now + self.recovery.rtt().rto());
            self.timers
                .arm(TimerKind::Pto, now + self.recovery.pto_interval());
        }

        trace!(number, size, in_flight = self.cc.bytes_in_flight(), "패킷 전송");
        self.datagrams.send_datagram(Bytes::from(bytes));
        true
    }

    /// 보낼 수 있는 만큼 패킷을 만들어 전송
    ///
    /// ACK 프레임과 흐름 제어 프레임, PING은 혼잡 윈도우와 무관하게 나간다.
    /// 데이터(재전송 포함)는 혼잡 윈도우 승인이 있을 때만.
    fn flush(&mut self, now: Instant) -> Option<DeferReason> {
        let max_size = self.max_packet_size();
        let mut blocked = None;

        loop {
            let mut builder = PacketBuilder::new(max_size);

            let ack = if self.acks.ack_pending() {
                self.acks.current_record()
            } else {
                None
            };
            if let Some(record) = ack {
                if builder.try_push(Frame::Ack(record)).is_err() {
                    warn!(max_size, "ACK 프레임이 빈 패킷에 들어가지 않음");
                }
            }

            while let Some(frame) = self.control.pop_front() {
                if let Err(frame) = builder.try_push(frame) {
                    self.control.push_front(frame);
                    break;
                }
            }
            if self.ping_pending && builder.try_push(Frame::Ping).is_ok() {
                self.ping_pending = false;
            }

            if self.has_sendable_data() {
                if now < self.handshake_done_at {
                    blocked = Some(DeferReason::Handshake);
                } else if !self.cc.can_send(max_size) {
                    blocked = Some(DeferReason::Congestion);
                } else {
                    blocked = None;
                    self.fill_retransmits(&mut builder);
                    self.fill_streams(&mut builder);
                }
            }

            if builder.is_empty() {
                break;
            }
            let eliciting = builder.is_ack_eliciting();
            if !eliciting && !self.ack_immediate {
                // 지연 ACK만 있으면 타이머나 다음 데이터 패킷을 기다림
                break;
            }

            if ack.is_some() {
                self.acks.take_ack();
                self.ack_immediate = false;
                self.timers.cancel(TimerKind::AckDelay);
            }

            let number = self.take_packet_number();
            if !self.transmit(builder.finish(number), now) || !eliciting {
                break;
            }
        }

        match blocked {
            Some(DeferReason::Handshake) => {
                self.timers.arm(TimerKind::SendRetry, self.handshake_done_at);
            }
            Some(DeferReason::Congestion) => {
                let delay = self.cc.retry_delay(self.recovery.rtt().srtt());
                self.timers.arm(TimerKind::SendRetry, now + delay);
            }
            _ => {}
        }

        if blocked.is_none() && self.flow_blocked() {
            blocked = Some(DeferReason::FlowControl);
        }
        blocked
    }

    /// 혼잡 윈도우만 열리면 보낼 수 있는 데이터가 있는지
    fn has_sendable_data(&self) -> bool {
        !self.retransmit.is_empty()
            || self.send_streams.iter().any(|(&id, stream)| {
                stream.has_pending()
                    && (stream.pending_bytes() == 0 || self.flow.available(id) > 0)
            })
    }

    fn flow_blocked(&self) -> bool {
        self.send_streams
            .iter()
            .any(|(&id, stream)| stream.pending_bytes() > 0 && self.flow.available(id) == 0)
    }

    fn fill_retransmits(&mut self, builder: &mut PacketBuilder) {
        while let Some(frame) = self.retransmit.pop_front() {
            let frame = match builder.try_push(frame) {
                Ok(()) => continue,
                Err(frame) => frame,
            };

            // 남은 공간에 맞게 STREAM 프레임을 나눠 앞부분만 담음
            let room = builder.stream_room();
            if room == 0 {
                self.retransmit.push_front(frame);
                return;
            }
            match frame.split_stream(room) {
                (head, Some(tail)) => {
                    self.retransmit.push_front(tail);
                    if let Err(head) = builder.try_push(head) {
                        self.retransmit.push_front(head);
                    }
                }
                (frame, None) => self.retransmit.push_front(frame),
            }
            return;
        }
    }

    /// 라운드 로빈: 패킷마다 스트림당 최대 한 조각
    fn fill_streams(&mut self, builder: &mut PacketBuilder) {
        for stream_id in self.round_robin_order() {
            let room = builder.stream_room();
            if room == 0 {
                break;
            }
            let credit = usize::try_from(self.flow.available(stream_id)).unwrap_or(usize::MAX);

            let Some(stream) = self.send_streams.get_mut(&stream_id) else {
                continue;
            };
            let Some(frame) = stream.next_frame(room.min(credit)) else {
                continue;
            };

            if let Frame::Stream { data, .. } = &frame {
                let len = data.len() as u64;
                self.flow.consume(stream_id, len);
                self.stats.stream_bytes_sent += len;
            }
            self.last_served = Some(stream_id);

            if let Err(frame) = builder.try_push(frame) {
                // 크기를 맞춰 꺼냈으므로 들어가지 않으면 다음 패킷에서 재전송 경로로 보냄
                warn!(stream_id, "STREAM 프레임이 패킷에 들어가지 않음");
                self.retransmit.push_back(frame);
            }
        }
    }

    /// 보낼 데이터가 있는 스트림을 마지막 서비스 스트림 다음부터 나열
    fn round_robin_order(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self
            .send_streams
            .iter()
            .filter(|(_, stream)| stream.has_pending())
            .map(|(&id, _)| id)
            .collect();
        if let Some(last) = self.last_served {
            let split = ids.partition_point(|&id| id <= last);
            ids.rotate_left(split);
        }
        ids
    }
}
