//! 흐름 제어
//!
//! 송신측: 연결 윈도우와 스트림 윈도우 두 겹. STREAM payload가 패킷에 실제로
//! 들어갈 때만 차감하고, 상대의 MAX_DATA / MAX_STREAM_DATA로 한도를 올린다.
//! 한도는 내려가지 않는다.
//!
//! 수신측: 애플리케이션에 연속으로 넘긴 바이트를 소비량으로 보고, 윈도우의
//! 절반을 소비하면 `소비량 + 윈도우`를 새 한도로 광고한다.

use std::collections::HashMap;

use tracing::debug;

use crate::frame::StreamId;
use crate::Config;

/// 송신 한도 (절대 오프셋 기준)
#[derive(Debug, Clone, Copy)]
pub struct SendCredit {
    /// 상대가 허용한 누적 바이트 한도
    limit: u64,

    /// 지금까지 사용한 바이트
    used: u64,
}

impl SendCredit {
    pub fn new(limit: u64) -> Self {
        Self { limit, used: 0 }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    /// 남은 한도
    pub fn available(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }

    fn consume(&mut self, n: u64) {
        self.used += n;
    }

    /// 한도 상향. 실제로 올랐으면 `true`.
    pub fn raise(&mut self, limit: u64) -> bool {
        if limit <= self.limit {
            return false;
        }
        self.limit = limit;
        true
    }
}

/// 송신측 흐름 제어기
#[derive(Debug)]
pub struct FlowController {
    connection: SendCredit,
    streams: HashMap<StreamId, SendCredit>,
    stream_window: u64,
}

impl FlowController {
    pub fn new(config: &Config) -> Self {
        Self {
            connection: SendCredit::new(config.connection_window),
            streams: HashMap::new(),
            stream_window: config.stream_window,
        }
    }

    /// 스트림 윈도우 등록 (이미 있으면 유지)
    pub fn open_stream(&mut self, stream_id: StreamId) {
        let window = self.stream_window;
        self.streams
            .entry(stream_id)
            .or_insert_with(|| SendCredit::new(window));
    }

    pub fn connection(&self) -> &SendCredit {
        &self.connection
    }

    pub fn stream(&self, stream_id: StreamId) -> Option<&SendCredit> {
        self.streams.get(&stream_id)
    }

    /// 이 스트림이 지금 보낼 수 있는 바이트 (두 윈도우 중 작은 쪽)
    pub fn available(&self, stream_id: StreamId) -> u64 {
        let stream = self.streams.get(&stream_id).map_or(0, SendCredit::available);
        stream.min(self.connection.available())
    }

    /// 패킷에 들어간 payload만큼 차감
    ///
    /// 호출자는 [`FlowController::available`] 이내로만 차감해야 한다.
    pub fn consume(&mut self, stream_id: StreamId, n: u64) {
        debug_assert!(n <= self.available(stream_id));
        self.connection.consume(n);
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.consume(n);
        }
    }

    /// MAX_DATA 수신
    pub fn on_max_data(&mut self, limit: u64) -> bool {
        let raised = self.connection.raise(limit);
        if raised {
            debug!(limit, "연결 송신 한도 상향");
        }
        raised
    }

    /// MAX_STREAM_DATA 수신. 모르는 스트림이면 미리 등록한다.
    pub fn on_max_stream_data(&mut self, stream_id: StreamId, limit: u64) -> bool {
        self.open_stream(stream_id);
        let raised = self
            .streams
            .get_mut(&stream_id)
            .map_or(false, |s| s.raise(limit));
        if raised {
            debug!(stream_id, limit, "스트림 송신 한도 상향");
        }
        raised
    }
}

/// 수신 윈도우 (한 스트림 또는 연결 전체)
#[derive(Debug, Clone, Copy)]
pub struct RecvWindow {
    /// 소비된(애플리케이션에 전달된) 바이트
    consumed: u64,

    /// 마지막으로 광고한 한도
    advertised: u64,

    window: u64,
}

impl RecvWindow {
    pub fn new(window: u64) -> Self {
        Self {
            consumed: 0,
            advertised: window,
            window,
        }
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// 상대에게 허용한 한도
    pub fn limit(&self) -> u64 {
        self.advertised
    }

    /// 수신한 끝 오프셋이 한도 안인지
    pub fn permits(&self, end: u64) -> bool {
        end <= self.advertised
    }

    /// 소비 기록. 새 한도를 광고할 때가 되면 그 한도를 반환한다.
    pub fn on_consumed(&mut self, n: u64) -> Option<u64> {
        self.consumed += n;
        let next = self.consumed + self.window;
        if next.saturating_sub(self.advertised) >= self.window / 2 {
            self.advertised = next;
            return Some(next);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            connection_window: 1000,
            stream_window: 600,
            ..Config::default()
        }
    }

    #[test]
    fn test_nested_windows() {
        let mut fc = FlowController::new(&config());
        assert_eq!(fc.available(1), 0, "열리지 않은 스트림은 보낼 수 없음");

        fc.open_stream(1);
        fc.open_stream(2);
        assert_eq!(fc.available(1), 600);

        fc.consume(1, 600);
        assert_eq!(fc.available(1), 0);
        // 연결 윈도우가 스트림 2를 제한
        assert_eq!(fc.available(2), 400);
        fc.consume(2, 400);
        assert_eq!(fc.available(2), 0);
    }

    #[test]
    fn test_limits_only_grow() {
        let mut fc = FlowController::new(&config());
        fc.open_stream(1);
        fc.consume(1, 500);

        assert!(!fc.on_max_stream_data(1, 300));
        assert_eq!(fc.stream(1).unwrap().limit(), 600);
        assert!(fc.on_max_stream_data(1, 2000));
        assert_eq!(fc.available(1), 500);

        assert!(fc.on_max_data(5000));
        assert!(!fc.on_max_data(4000));
        assert_eq!(fc.available(1), 1500);
    }

    #[test]
    fn test_reopen_keeps_usage() {
        let mut fc = FlowController::new(&config());
        fc.open_stream(3);
        fc.consume(3, 100);
        fc.open_stream(3);
        assert_eq!(fc.stream(3).unwrap().used(), 100);
    }

    #[test]
    fn test_recv_window_update_after_half() {
        let mut window = RecvWindow::new(1000);
        assert!(window.permits(1000));
        assert!(!window.permits(1001));

        assert_eq!(window.on_consumed(300), None);
        assert_eq!(window.on_consumed(200), Some(1500));
        assert!(window.permits(1500));

        assert_eq!(window.on_consumed(499), None);
        assert_eq!(window.on_consumed(1), Some(2000));
        assert_eq!(window.consumed(), 1000);
    }
}
