//! 에러 타입 정의

use thiserror::Error;

/// H3Lab 전송 계층 에러 타입
///
/// 세션은 수신 경로의 에러로 중단되지 않는다. 디코딩 에러는 로그와 통계로만
/// 남고, 호출자에게 돌아가는 에러는 API 오용(열리지 않은 스트림 등)뿐이다.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("유효하지 않은 매직 넘버: expected {expected:08X}, got {got:08X}")]
    InvalidMagicNumber { expected: u32, got: u32 },

    #[error("유효하지 않은 프로토콜 버전: expected {expected}, got {got}")]
    InvalidVersion { expected: u8, got: u8 },

    #[error("CRC 불일치: expected {expected:08X}, got {got:08X}")]
    CrcMismatch { expected: u32, got: u32 },

    #[error("알 수 없는 프레임 타입: {kind}")]
    UnknownFrameKind { kind: u8 },

    #[error("잘못된 프레임: {reason}")]
    MalformedFrame { reason: &'static str },

    #[error("프레임이 패킷에 들어가지 않음: {frame_len} > {max_len}")]
    FrameTooLarge { frame_len: usize, max_len: usize },

    #[error("열리지 않은 스트림: stream_id={stream_id}")]
    UnknownStream { stream_id: u64 },

    #[error("이미 FIN이 전송된 스트림: stream_id={stream_id}")]
    StreamFinished { stream_id: u64 },

    #[error("채널 에러")]
    ChannelError,

    #[error("연결 종료")]
    ConnectionClosed,
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
