//! 결정적 링크 시뮬레이터
//!
//! 가상 시계 위에서 세션 두 개를 손실/지연/대역폭 제한 링크로 연결한다.
//! 같은 시드면 같은 결과가 나온다.
//!
//! | 요소        | 모델                                              |
//! |-------------|---------------------------------------------------|
//! | 대역폭      | 방향별 직렬화 지연 `size × 8 / bps`               |
//! | 전파 지연   | 고정 `delay`                                      |
//! | 지터        | `[0, jitter]` 균등 분포 추가 지연 (재정렬 유발)   |
//! | 손실        | 확률 `loss_rate`로 폐기 (시드 고정 RNG)           |
//! | 큐          | 직렬화 대기 패킷이 `queue_limit` 이상이면 drop-tail |

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::frame::StreamId;
use crate::session::{DatagramSink, Session, StreamDataSink};
use crate::stats::SessionStats;
use crate::Config;

/// 링크 설정
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// 대역폭 (bits/sec)
    pub bandwidth_bps: u64,

    /// 단방향 전파 지연
    pub delay: Duration,

    /// 추가 무작위 지연 상한
    pub jitter: Duration,

    /// 패킷 손실 확률 `[0.0, 1.0]`
    pub loss_rate: f64,

    /// 직렬화 대기 큐 크기 (패킷)
    pub queue_limit: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            bandwidth_bps: 10_000_000, // 10Mbps
            delay: Duration::from_millis(10),
            jitter: Duration::ZERO,
            loss_rate: 0.0,
            queue_limit: 256,
        }
    }
}

impl LinkConfig {
    pub fn new(bandwidth_bps: u64, delay: Duration, loss_rate: f64) -> Self {
        Self {
            bandwidth_bps,
            delay,
            loss_rate,
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// 패킷 하나의 직렬화 시간
    pub fn serialization_delay(&self, size: usize) -> Duration {
        if self.bandwidth_bps == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos((size as u64 * 8).saturating_mul(1_000_000_000) / self.bandwidth_bps)
    }
}

/// 링크 통계
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkStats {
    pub delivered: u64,
    pub random_drops: u64,
    pub queue_drops: u64,
}

/// 단방향 링크
#[derive(Debug)]
struct Link {
    config: LinkConfig,
    rng: StdRng,

    /// 송신 인터페이스가 비는 시각
    busy_until: Option<Instant>,

    /// 직렬화 대기/진행 중 패킷의 완료 시각
    departures: VecDeque<Instant>,

    stats: LinkStats,
}

impl Link {
    fn new(config: LinkConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
            busy_until: None,
            departures: VecDeque::new(),
            stats: LinkStats::default(),
        }
    }

    /// 패킷 투입. 도착 시각 또는 `None`(폐기).
    fn transmit(&mut self, now: Instant, size: usize) -> Option<Instant> {
        while self.departures.front().is_some_and(|&t| t <= now) {
            self.departures.pop_front();
        }
        if self.departures.len() >= self.config.queue_limit {
            self.stats.queue_drops += 1;
            return None;
        }

        let start = self.busy_until.map_or(now, |busy| busy.max(now));
        let finish = start + self.config.serialization_delay(size);
        self.busy_until = Some(finish);
        self.departures.push_back(finish);

        if self.config.loss_rate > 0.0 && self.rng.gen::<f64>() < self.config.loss_rate {
            self.stats.random_drops += 1;
            return None;
        }

        let jitter = if self.config.jitter.is_zero() {
            Duration::ZERO
        } else {
            let max = self.config.jitter.as_nanos() as u64;
            Duration::from_nanos(self.rng.gen_range(0..=max))
        };

        self.stats.delivered += 1;
        Some(finish + self.config.delay + jitter)
    }
}

/// 세션 출력 데이터그램 버퍼
#[derive(Debug, Clone, Default)]
pub struct Outbox(Arc<Mutex<Vec<Bytes>>>);

impl Outbox {
    pub fn drain(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl DatagramSink for Outbox {
    fn send_datagram(&mut self, datagram: Bytes) {
        self.0.lock().push(datagram);
    }
}

/// 스트림별 수신 진행
#[derive(Default)]
struct StreamProgress {
    bytes: u64,
    hasher: crc32fast::Hasher,
    checksum: Option<u32>,
}

/// 수신 데이터 집계 (바이트 수 + CRC32)
#[derive(Clone, Default)]
pub struct Collector(Arc<Mutex<CollectorState>>);

#[derive(Default)]
struct CollectorState {
    streams: HashMap<StreamId, StreamProgress>,
    /// 아직 시각이 기록되지 않은 완료 스트림
    newly_finished: Vec<StreamId>,
}

impl Collector {
    /// 수신 바이트 수
    pub fn bytes(&self, stream_id: StreamId) -> u64 {
        self.0.lock().streams.get(&stream_id).map_or(0, |p| p.bytes)
    }

    /// 완료된 스트림의 CRC32
    pub fn checksum(&self, stream_id: StreamId) -> Option<u32> {
        self.0
            .lock()
            .streams
            .get(&stream_id)
            .and_then(|p| p.checksum)
    }

    fn take_finished(&self) -> Vec<StreamId> {
        std::mem::take(&mut self.0.lock().newly_finished)
    }
}

impl StreamDataSink for Collector {
    fn on_stream_data(&mut self, stream_id: StreamId, _offset: u64, data: Bytes, fin: bool) {
        let mut state = self.0.lock();
        let progress = state.streams.entry(stream_id).or_default();
        progress.bytes += data.len() as u64;
        progress.hasher.update(&data);
        if fin {
            progress.checksum = Some(progress.hasher.clone().finalize());
            state.newly_finished.push(stream_id);
        }
    }
}

/// 시뮬레이터 세션 타입
pub type SimSession = Session<Outbox, Collector>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

/// 링크 위의 데이터그램
#[derive(Debug)]
struct InFlight {
    at: Instant,
    seq: u64,
    to: Side,
    datagram: Bytes,
}

impl PartialEq for InFlight {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for InFlight {}

impl PartialOrd for InFlight {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InFlight {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

/// 클라이언트-서버 세션 쌍과 양방향 링크
pub struct Simulation {
    start: Instant,
    now: Instant,

    client: SimSession,
    server: SimSession,
    client_out: Outbox,
    server_out: Outbox,
    client_rx: Collector,
    server_rx: Collector,

    /// 클라이언트 → 서버
    uplink: Link,
    /// 서버 → 클라이언트
    downlink: Link,

    events: BinaryHeap<Reverse<InFlight>>,
    seq: u64,

    /// 클라이언트 수신 완료 시각 (시작 기준)
    completions: HashMap<StreamId, Duration>,
}

impl Simulation {
    pub fn new(config: Config, link: LinkConfig, seed: u64) -> Self {
        let start = Instant::now();
        let client_out = Outbox::default();
        let server_out = Outbox::default();
        let client_rx = Collector::default();
        let server_rx = Collector::default();

        Self {
            start,
            now: start,
            client: Session::new(config.clone(), start, client_out.clone(), client_rx.clone()),
            server: Session::new(config, start, server_out.clone(), server_rx.clone()),
            client_out,
            server_out,
            client_rx,
            server_rx,
            uplink: Link::new(link.clone(), seed),
            downlink: Link::new(link, seed.wrapping_add(1)),
            events: BinaryHeap::new(),
            seq: 0,
            completions: HashMap::new(),
        }
    }

    /// 현재 가상 시각
    pub fn now(&self) -> Instant {
        self.now
    }

    /// 시작 후 경과 가상 시간
    pub fn elapsed(&self) -> Duration {
        self.now - self.start
    }

    pub fn client(&self) -> &SimSession {
        &self.client
    }

    pub fn server(&self) -> &SimSession {
        &self.server
    }

    /// 클라이언트 세션 조작 (조작 후 출력은 링크로 투입)
    pub fn with_client<R>(&mut self, f: impl FnOnce(&mut SimSession, Instant) -> R) -> R {
        let result = f(&mut self.client, self.now);
        self.pump();
        result
    }

    /// 서버 세션 조작
    pub fn with_server<R>(&mut self, f: impl FnOnce(&mut SimSession, Instant) -> R) -> R {
        let result = f(&mut self.server, self.now);
        self.pump();
        result
    }

    pub fn client_rx(&self) -> &Collector {
        &self.client_rx
    }

    pub fn server_rx(&self) -> &Collector {
        &self.server_rx
    }

    /// 클라이언트가 수신 완료한 시각 (시작 기준)
    pub fn completion(&self, stream_id: StreamId) -> Option<Duration> {
        self.completions.get(&stream_id).copied()
    }

    pub fn uplink_stats(&self) -> LinkStats {
        self.uplink.stats
    }

    pub fn downlink_stats(&self) -> LinkStats {
        self.downlink.stats
    }

    /// 세션 출력을 링크로 투입
    fn pump(&mut self) {
        for datagram in self.client_out.drain() {
            if let Some(at) = self.uplink.transmit(self.now, datagram.len()) {
                self.schedule(at, Side::Server, datagram);
            }
        }
        for datagram in self.server_out.drain() {
            if let Some(at) = self.downlink.transmit(self.now, datagram.len()) {
                self.schedule(at, Side::Client, datagram);
            }
        }

        let elapsed = self.elapsed();
        for stream_id in self.client_rx.take_finished() {
            self.completions.entry(stream_id).or_insert(elapsed);
        }
    }

    fn schedule(&mut self, at: Instant, to: Side, datagram: Bytes) {
        self.seq += 1;
        self.events.push(Reverse(InFlight {
            at,
            seq: self.seq,
            to,
            datagram,
        }));
    }

    /// 다음 이벤트(데이터그램 도착 또는 타이머) 하나 처리. 없으면 `false`.
    pub fn step(&mut self) -> bool {
        let arrival = self.events.peek().map(|Reverse(e)| e.at);
        let timer = [self.client.next_timeout(), self.server.next_timeout()]
            .into_iter()
            .flatten()
            .min();

        let next = match (arrival, timer) {
            (Some(a), Some(t)) => a.min(t),
            (Some(a), None) => a,
            (None, Some(t)) => t,
            (None, None) => return false,
        };
        self.now = self.now.max(next);

        if arrival.is_some_and(|a| a <= self.now) {
            if let Some(Reverse(event)) = self.events.pop() {
                match event.to {
                    Side::Client => self.client.on_datagram_received(&event.datagram, self.now),
                    Side::Server => self.server.on_datagram_received(&event.datagram, self.now),
                }
            }
        } else {
            if self.client.next_timeout().is_some_and(|t| t <= self.now) {
                self.client.on_timeout(self.now);
            }
            if self.server.next_timeout().is_some_and(|t| t <= self.now) {
                self.server.on_timeout(self.now);
            }
        }

        self.pump();
        true
    }

    /// `done`이 참이 되거나 가상 시간이 `limit`을 넘을 때까지 실행
    pub fn run_until(&mut self, limit: Duration, mut done: impl FnMut(&Self) -> bool) -> bool {
        while !done(self) {
            if self.elapsed() > limit || !self.step() {
                return done(self);
            }
        }
        true
    }
}

/// 결정적 페이로드 (스트림마다 다른 패턴)
pub fn object_payload(stream_id: StreamId, size: usize) -> Bytes {
    (0..size)
        .map(|i| ((stream_id as usize * 31 + i) % 251) as u8)
        .collect()
}

/// 전송 실험 결과
#[derive(Debug, Clone)]
pub struct TransferReport {
    /// 스트림별 완료 시각 (미완료면 `None`)
    pub completions: Vec<(StreamId, Option<Duration>)>,

    /// 모든 스트림이 완료된 시각
    pub finished_at: Option<Duration>,

    /// 수신 데이터 CRC가 모두 일치하는지
    pub integrity_ok: bool,

    pub server_stats: SessionStats,
    pub client_stats: SessionStats,
    pub downlink: LinkStats,
    pub uplink: LinkStats,
}

impl TransferReport {
    /// 완료된 스트림의 평균 완료 시각
    pub fn mean_completion(&self) -> Option<Duration> {
        let done: Vec<Duration> = self.completions.iter().filter_map(|(_, t)| *t).collect();
        if done.is_empty() {
            return None;
        }
        Some(done.iter().sum::<Duration>() / done.len() as u32)
    }

    pub fn all_completed(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// 서버가 `streams`개 객체를 동시에 보내고 클라이언트가 받는 실험
///
/// 스트림 크기는 클라이언트에 미리 선언한다 (응답 헤더에 해당).
pub fn run_transfer(
    config: Config,
    link: LinkConfig,
    seed: u64,
    streams: usize,
    object_size: usize,
    time_limit: Duration,
) -> TransferReport {
    let mut sim = Simulation::new(config, link, seed);
    let ids: Vec<StreamId> = (0..streams as u64).map(|i| i * 4).collect();

    sim.with_client(|client, _| {
        for &id in &ids {
            client.declare_stream_size(id, object_size as u64);
        }
    });
    sim.with_server(|server, now| {
        for &id in &ids {
            server.open_stream(id);
            if let Err(e) = server.send_stream_data(id, object_payload(id, object_size), true, now) {
                debug!(stream_id = id, "전송 요청 실패: {}", e);
            }
        }
    });

    let finished = sim.run_until(time_limit, |sim| {
        ids.iter().all(|id| sim.completion(*id).is_some())
    });

    let completions: Vec<(StreamId, Option<Duration>)> =
        ids.iter().map(|&id| (id, sim.completion(id))).collect();
    let finished_at = if finished {
        completions.iter().filter_map(|(_, t)| *t).max()
    } else {
        None
    };
    let integrity_ok = ids.iter().all(|&id| match sim.client_rx().checksum(id) {
        Some(crc) => crc == crc32fast::hash(&object_payload(id, object_size)),
        None => !finished,
    });

    info!(
        streams,
        object_size,
        finished = finished_at.is_some(),
        elapsed = ?sim.elapsed(),
        "시뮬레이션 종료"
    );

    TransferReport {
        completions,
        finished_at,
        integrity_ok,
        server_stats: sim.server().stats().clone(),
        client_stats: sim.client().stats().clone(),
        downlink: sim.downlink_stats(),
        uplink: sim.uplink_stats(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization_delay() {
        let link = LinkConfig::new(8_000_000, Duration::ZERO, 0.0);
        assert_eq!(link.serialization_delay(1000), Duration::from_millis(1));
    }

    #[test]
    fn test_link_queues_behind_busy_interface() {
        let config = LinkConfig {
            bandwidth_bps: 8_000_000,
            delay: Duration::from_millis(10),
            queue_limit: 2,
            ..LinkConfig::default()
        };
        let mut link = Link::new(config, 1);
        let now = Instant::now();

        assert_eq!(link.transmit(now, 1000), Some(now + Duration::from_millis(11)));
        assert_eq!(link.transmit(now, 1000), Some(now + Duration::from_millis(12)));
        // 큐가 가득 참
        assert_eq!(link.transmit(now, 1000), None);
        assert_eq!(link.stats.queue_drops, 1);

        // 첫 패킷이 빠진 뒤에는 다시 투입 가능
        let later = now + Duration::from_millis(1);
        assert_eq!(link.transmit(later, 1000), Some(now + Duration::from_millis(13)));
    }

    #[test]
    fn test_lossless_transfer() {
        let report = run_transfer(
            Config::default(),
            LinkConfig::default(),
            1,
            4,
            20_000,
            Duration::from_secs(30),
        );
        assert!(report.all_completed());
        assert!(report.integrity_ok);
        assert_eq!(report.server_stats.retransmissions, 0);
        assert_eq!(report.client_stats.streams_completed, 4);
        // 최소한 한 RTT(20ms) 이상 걸림
        assert!(report.finished_at.unwrap() >= Duration::from_millis(20));
    }

    #[test]
    fn test_same_seed_same_result() {
        let link = LinkConfig::new(5_000_000, Duration::from_millis(15), 0.05)
            .with_jitter(Duration::from_millis(3));
        let a = run_transfer(Config::default(), link.clone(), 42, 3, 30_000, Duration::from_secs(60));
        let b = run_transfer(Config::default(), link, 42, 3, 30_000, Duration::from_secs(60));
        assert_eq!(a.completions, b.completions);
        assert_eq!(a.downlink.random_drops, b.downlink.random_drops);
        assert_eq!(a.server_stats.retransmissions, b.server_stats.retransmissions);
    }
}
