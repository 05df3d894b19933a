//! # H3Lab
//!
//! 손실 많은 링크 위에서 HTTP/3 스타일 멀티플렉싱을 실험하기 위한
//! QUIC 유사 전송 계층
//!
//! ## 핵심 특징
//! - **선택적 ACK**: 누적 ACK + 64비트 비트맵, 초기 즉시 ACK 후 지연 병합
//! - **손실 감지**: 패킷 임계값 + 시간 임계값, RTO 지수 백오프, PTO 프로브
//! - **혼잡 제어**: slow start / congestion avoidance / RTT당 한 번의 곱셈 감소
//! - **흐름 제어**: 연결 + 스트림 윈도우, MAX_DATA / MAX_STREAM_DATA 갱신
//! - **재조립**: 바이트 구간 병합, 연속 구간만 전달, 완료는 정확히 한 번
//! - **호스트 독립**: 세션은 시간을 인자로 받는 상태 기계 (UDP 호스트, 시뮬레이터)

pub mod ack;
pub mod config;
pub mod congestion;
pub mod error;
pub mod flow;
pub mod frame;
pub mod host;
pub mod packet;
pub mod reassembly;
pub mod recovery;
pub mod session;
pub mod sim;
pub mod stats;
pub mod stream;
pub mod timer;

pub use ack::{AckRecord, AckTracker, PacketNumber};
pub use config::Config;
pub use congestion::CongestionController;
pub use error::{Error, Result};
pub use frame::{Decoded, Frame, FrameKind, StreamId};
pub use host::{Endpoint, SessionHandle, StreamEvent};
pub use packet::{Packet, PacketBuilder};
pub use reassembly::{RangeSet, RecvStream};
pub use recovery::{Recovery, RttEstimator};
pub use session::{DatagramSink, DeferReason, SendOutcome, Session, StreamDataSink};
pub use sim::{LinkConfig, Simulation, TransferReport};
pub use stats::SessionStats;

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 기본 MTU (바이트)
pub const DEFAULT_MTU: usize = 1200;

/// 기본 전송 계층 헤더 오버헤드 추정치 (IPv4 20 + UDP 8)
pub const DEFAULT_HEADER_OVERHEAD: usize = 28;

/// 매직 넘버 (패킷 식별용)
pub const MAGIC_NUMBER: u32 = 0x48334C42; // "H3LB"
