//! 프레임 정의 및 코덱
//!
//! 프레임 = `HLEN(u16 LE) | bincode 헤더 | payload`
//!
//! - STREAM: 스트림 바이트 구간 `[offset, offset + len)`
//! - ACK: `offset`에 최대 ACK 번호, payload가 비어 있으면 누적 ACK,
//!   8바이트면 64비트 비트맵
//! - PING: 생존 확인 / ACK 유도용 프로브
//! - MAX_DATA / MAX_STREAM_DATA: 흐름 제어 한도 갱신 (`offset`에 새 한도)

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ack::AckRecord;
use crate::{Error, Result};

/// 스트림 ID
pub type StreamId = u64;

/// bincode 고정 길이 헤더 크기: kind(1) + stream_id(8) + offset(8) + fin(1) + payload_len(4)
pub const FRAME_HEADER_LEN: usize = 22;

/// 프레임 하나의 고정 오버헤드 (HLEN 포함)
pub const FRAME_OVERHEAD: usize = 2 + FRAME_HEADER_LEN;

/// 프레임 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Stream = 0,
    Ack = 1,
    Ping = 2,
    MaxData = 3,
    MaxStreamData = 4,
}

impl TryFrom<u8> for FrameKind {
    type Error = Error;

    fn try_from(kind: u8) -> Result<Self> {
        match kind {
            0 => Ok(FrameKind::Stream),
            1 => Ok(FrameKind::Ack),
            2 => Ok(FrameKind::Ping),
            3 => Ok(FrameKind::MaxData),
            4 => Ok(FrameKind::MaxStreamData),
            other => Err(Error::UnknownFrameKind { kind: other }),
        }
    }
}

/// 프레임 헤더 (와이어 표현)
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FrameHeader {
    kind: u8,
    stream_id: StreamId,
    offset: u64,
    fin: bool,
    payload_len: u32,
}

/// 디코딩 결과: 완료 또는 "바이트 더 필요"
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<T> {
    /// 디코딩 완료, `consumed` 바이트 사용
    Complete { value: T, consumed: usize },

    /// 입력이 잘림: 최소 `needed` 바이트 필요
    Incomplete { needed: usize },
}

/// 프레임
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Stream {
        stream_id: StreamId,
        offset: u64,
        data: Bytes,
        fin: bool,
    },
    Ack(AckRecord),
    Ping,
    MaxData {
        limit: u64,
    },
    MaxStreamData {
        stream_id: StreamId,
        limit: u64,
    },
}

impl Frame {
    /// 프레임 타입
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Stream { .. } => FrameKind::Stream,
            Frame::Ack(_) => FrameKind::Ack,
            Frame::Ping => FrameKind::Ping,
            Frame::MaxData { .. } => FrameKind::MaxData,
            Frame::MaxStreamData { .. } => FrameKind::MaxStreamData,
        }
    }

    /// ACK 이외 프레임은 상대의 ACK를 유도
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(self, Frame::Ack(_))
    }

    /// 손실 시 새 패킷으로 다시 보내야 하는 프레임인지
    pub fn is_retransmittable(&self) -> bool {
        matches!(
            self,
            Frame::Stream { .. } | Frame::MaxData { .. } | Frame::MaxStreamData { .. }
        )
    }

    fn payload_len(&self) -> usize {
        match self {
            Frame::Stream { data, .. } => data.len(),
            Frame::Ack(AckRecord::Bitmap { .. }) => 8,
            _ => 0,
        }
    }

    /// 직렬화 크기
    pub fn encoded_len(&self) -> usize {
        FRAME_OVERHEAD + self.payload_len()
    }

    fn header(&self) -> FrameHeader {
        let (stream_id, offset, fin) = match *self {
            Frame::Stream {
                stream_id,
                offset,
                fin,
                ..
            } => (stream_id, offset, fin),
            Frame::Ack(record) => (0, record.largest(), false),
            Frame::Ping => (0, 0, false),
            Frame::MaxData { limit } => (0, limit, false),
            Frame::MaxStreamData { stream_id, limit } => (stream_id, limit, false),
        };

        FrameHeader {
            kind: self.kind() as u8,
            stream_id,
            offset,
            fin,
            payload_len: self.payload_len() as u32,
        }
    }

    /// 버퍼 끝에 직렬화
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        let header_bytes = bincode::serialize(&self.header())?;
        buf.reserve(2 + header_bytes.len() + self.payload_len());
        buf.extend_from_slice(&(header_bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(&header_bytes);

        match self {
            Frame::Stream { data, .. } => buf.extend_from_slice(data),
            Frame::Ack(AckRecord::Bitmap { bitmap, .. }) => {
                buf.extend_from_slice(&bitmap.to_le_bytes())
            }
            _ => {}
        }
        Ok(())
    }

    /// 바이트로 직렬화
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// 바이트에서 역직렬화
    ///
    /// 입력이 잘렸으면 에러가 아니라 [`Decoded::Incomplete`]를 반환한다.
    pub fn from_bytes(bytes: &[u8]) -> Result<Decoded<Frame>> {
        if bytes.len() < 2 {
            return Ok(Decoded::Incomplete { needed: 2 });
        }

        let header_len = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        if bytes.len() < 2 + header_len {
            return Ok(Decoded::Incomplete {
                needed: 2 + header_len,
            });
        }
        if header_len > FRAME_HEADER_LEN {
            // 상위 버전 헤더: 선언된 길이를 믿고 뒤쪽 필드는 건너뜀
            debug!(header_len, "프레임 헤더가 예상보다 김, 초과분 무시");
        }

        let header: FrameHeader = bincode::deserialize(&bytes[2..2 + header_len])?;
        let kind = FrameKind::try_from(header.kind)?;

        let payload_start = 2 + header_len;
        let total = payload_start + header.payload_len as usize;
        if bytes.len() < total {
            return Ok(Decoded::Incomplete { needed: total });
        }
        let payload = &bytes[payload_start..total];

        let frame = match kind {
            FrameKind::Stream if header.offset.checked_add(payload.len() as u64).is_none() => {
                return Err(Error::MalformedFrame {
                    reason: "STREAM 오프셋 + 길이가 u64 범위를 넘음",
                })
            }
            FrameKind::Stream => Frame::Stream {
                stream_id: header.stream_id,
                offset: header.offset,
                data: Bytes::copy_from_slice(payload),
                fin: header.fin,
            },
            FrameKind::Ack => match payload.len() {
                0 => Frame::Ack(AckRecord::Cumulative {
                    largest: header.offset,
                }),
                8 => {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(payload);
                    Frame::Ack(AckRecord::Bitmap {
                        largest: header.offset,
                        bitmap: u64::from_le_bytes(raw),
                    })
                }
                _ => {
                    return Err(Error::MalformedFrame {
                        reason: "ACK 비트맵 길이는 0 또는 8",
                    })
                }
            },
            FrameKind::Ping => Frame::Ping,
            FrameKind::MaxData => Frame::MaxData {
                limit: header.offset,
            },
            FrameKind::MaxStreamData => Frame::MaxStreamData {
                stream_id: header.stream_id,
                limit: header.offset,
            },
        };

        Ok(Decoded::Complete {
            value: frame,
            consumed: total,
        })
    }

    /// STREAM 프레임을 payload `max_payload` 바이트 기준으로 둘로 나눔
    ///
    /// FIN은 뒤쪽 조각에만 남는다. STREAM이 아니거나 나눌 필요가 없으면
    /// 그대로 반환한다.
    pub fn split_stream(self, max_payload: usize) -> (Frame, Option<Frame>) {
        match self {
            Frame::Stream {
                stream_id,
                offset,
                data,
                fin,
            } if data.len() > max_payload => {
                let head = data.slice(..max_payload);
                let tail = data.slice(max_payload..);
                (
                    Frame::Stream {
                        stream_id,
                        offset,
                        data: head,
                        fin: false,
                    },
                    Some(Frame::Stream {
                        stream_id,
                        offset: offset + max_payload as u64,
                        data: tail,
                        fin,
                    }),
                )
            }
            other => (other, None),
        }
    }
}
