//! 패킷 정의 및 코덱
//!
//! 패킷 = bincode 헤더 `{magic, version, packet_number, frame_count, crc32}`
//! + `frame_count`번 반복되는 `FLEN(u16 LE) | 프레임`.
//!
//! 손실 많은 매체에서도 세션이 죽지 않도록 FLEN과 실제 프레임 길이가
//! 어긋나면 선언 길이(FLEN) 기준으로 재동기화하고 진단 로그만 남긴다.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ack::PacketNumber;
use crate::frame::{Decoded, Frame};
use crate::{Error, Result, MAGIC_NUMBER, PROTOCOL_VERSION};

/// bincode 고정 길이 헤더 크기: magic(4) + version(1) + number(8) + count(2) + crc(4)
pub const PACKET_HEADER_LEN: usize = 19;

/// 패킷 안에서 프레임 하나가 차지하는 FLEN 크기
pub const FRAME_LEN_PREFIX: usize = 2;

/// 패킷 헤더 (와이어 표현)
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PacketHeader {
    magic: u32,
    version: u8,
    packet_number: PacketNumber,
    frame_count: u16,
    crc32: u32,
}

/// 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// 패킷 번호
    pub number: PacketNumber,

    /// 프레임 목록 (디코딩 순서 유지)
    pub frames: Vec<Frame>,
}

impl Packet {
    pub fn new(number: PacketNumber, frames: Vec<Frame>) -> Self {
        Self { number, frames }
    }

    /// 직렬화 크기
    pub fn encoded_len(&self) -> usize {
        PACKET_HEADER_LEN
            + self
                .frames
                .iter()
                .map(|f| FRAME_LEN_PREFIX + f.encoded_len())
                .sum::<usize>()
    }

    /// ACK 이외 프레임을 하나라도 담고 있는지
    pub fn is_ack_eliciting(&self) -> bool {
        self.frames.iter().any(Frame::is_ack_eliciting)
    }

    /// 바이트로 직렬화
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(self.encoded_len() - PACKET_HEADER_LEN);
        for frame in &self.frames {
            let flen = frame.encoded_len();
            if flen > u16::MAX as usize {
                return Err(Error::FrameTooLarge {
                    frame_len: flen,
                    max_len: u16::MAX as usize,
                });
            }
            body.extend_from_slice(&(flen as u16).to_le_bytes());
            frame.encode_into(&mut body)?;
        }

        let header = PacketHeader {
            magic: MAGIC_NUMBER,
            version: PROTOCOL_VERSION,
            packet_number: self.number,
            frame_count: self.frames.len() as u16,
            crc32: crc32fast::hash(&body),
        };

        let mut buf = bincode::serialize(&header)?;
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// 바이트에서 역직렬화
    ///
    /// 잘린 데이터그램은 [`Decoded::Incomplete`], 헤더/CRC 불일치는 에러.
    pub fn from_bytes(bytes: &[u8]) -> Result<Decoded<Packet>> {
        if bytes.len() < PACKET_HEADER_LEN {
            return Ok(Decoded::Incomplete {
                needed: PACKET_HEADER_LEN,
            });
        }

        let header: PacketHeader = bincode::deserialize(&bytes[..PACKET_HEADER_LEN])?;
        if header.magic != MAGIC_NUMBER {
            return Err(Error::InvalidMagicNumber {
                expected: MAGIC_NUMBER,
                got: header.magic,
            });
        }
        if header.version != PROTOCOL_VERSION {
            return Err(Error::InvalidVersion {
                expected: PROTOCOL_VERSION,
                got: header.version,
            });
        }

        // 1차: FLEN으로 프레임 경계 확정
        let mut bounds = Vec::with_capacity(header.frame_count as usize);
        let mut pos = PACKET_HEADER_LEN;
        for _ in 0..header.frame_count {
            if bytes.len() < pos + FRAME_LEN_PREFIX {
                return Ok(Decoded::Incomplete {
                    needed: pos + FRAME_LEN_PREFIX,
                });
            }
            let flen = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]) as usize;
            let start = pos + FRAME_LEN_PREFIX;
            if bytes.len() < start + flen {
                return Ok(Decoded::Incomplete {
                    needed: start + flen,
                });
            }
            bounds.push((start, start + flen));
            pos = start + flen;
        }

        if pos < bytes.len() {
            debug!(
                packet_number = header.packet_number,
                trailing = bytes.len() - pos,
                "패킷 뒤쪽 잉여 바이트 무시"
            );
        }

        let crc = crc32fast::hash(&bytes[PACKET_HEADER_LEN..pos]);
        if crc != header.crc32 {
            return Err(Error::CrcMismatch {
                expected: header.crc32,
                got: crc,
            });
        }

        // 2차: 각 프레임 디코딩 (FLEN 기준 재동기화)
        let mut frames = Vec::with_capacity(bounds.len());
        for (start, end) in bounds {
            let declared = end - start;
            match Frame::from_bytes(&bytes[start..end]) {
                Ok(Decoded::Complete { value, consumed }) => {
                    if consumed != declared {
                        warn!(
                            packet_number = header.packet_number,
                            declared, consumed, "프레임 길이 불일치, 선언 길이로 재동기화"
                        );
                    }
                    frames.push(value);
                }
                Ok(Decoded::Incomplete { needed }) => {
                    warn!(
                        packet_number = header.packet_number,
                        declared, needed, "프레임이 선언 길이를 넘음, 프레임 폐기"
                    );
                }
                Err(e) => {
                    warn!(
                        packet_number = header.packet_number,
                        "프레임 디코딩 실패, 건너뜀: {}", e
                    );
                }
            }
        }

        Ok(Decoded::Complete {
            value: Packet::new(header.packet_number, frames),
            consumed: pos,
        })
    }
}

/// MTU 한도 안에서 프레임을 채우는 패킷 빌더
#[derive(Debug)]
pub struct PacketBuilder {
    max_size: usize,
    size: usize,
    frames: Vec<Frame>,
}

impl PacketBuilder {
    /// `max_size`: 실효 MTU (명목 MTU - 전송 헤더 오버헤드)
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            size: PACKET_HEADER_LEN,
            frames: Vec::new(),
        }
    }

    /// 남은 공간 (바이트)
    pub fn remaining(&self) -> usize {
        self.max_size.saturating_sub(self.size)
    }

    /// 지금 넣을 수 있는 STREAM payload 최대 크기
    pub fn stream_room(&self) -> usize {
        self.remaining()
            .saturating_sub(FRAME_LEN_PREFIX + crate::frame::FRAME_OVERHEAD)
    }

    /// 프레임 추가. 공간이 없으면 프레임을 그대로 돌려준다.
    pub fn try_push(&mut self, frame: Frame) -> std::result::Result<(), Frame> {
        let cost = FRAME_LEN_PREFIX + frame.encoded_len();
        if cost > self.remaining() {
            return Err(frame);
        }
        self.size += cost;
        self.frames.push(frame);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// 현재 직렬화 크기
    pub fn size(&self) -> usize {
        self.size
    }

    /// ACK 이외 프레임 포함 여부
    pub fn is_ack_eliciting(&self) -> bool {
        self.frames.iter().any(Frame::is_ack_eliciting)
    }

    /// 패킷 번호를 붙여 완성
    pub fn finish(self, number: PacketNumber) -> Packet {
        Packet::new(number, self.frames)
    }
}

/// 프레임들을 탐욕적으로 패킷에 채움
///
/// 넘치는 프레임은 새 패킷을 시작한다. 빈 패킷에도 들어가지 않는 STREAM
/// 프레임은 나눠서 담고, 그 외 프레임이면 에러.
pub fn packetize(
    frames: impl IntoIterator<Item = Frame>,
    max_size: usize,
    next_number: &mut PacketNumber,
) -> Result<Vec<Packet>> {
    let mut packets = Vec::new();
    let mut builder = PacketBuilder::new(max_size);
    let mut queue: std::collections::VecDeque<Frame> = frames.into_iter().collect();

    while let Some(frame) = queue.pop_front() {
        let frame = match builder.try_push(frame) {
            Ok(()) => continue,
            Err(frame) => frame,
        };

        if !builder.is_empty() {
            let full = std::mem::replace(&mut builder, PacketBuilder::new(max_size));
            packets.push(full.finish(*next_number));
            *next_number += 1;
            queue.push_front(frame);
            continue;
        }

        // 빈 패킷에도 안 들어감
        let room = builder.stream_room();
        let frame_len = frame.encoded_len();
        match frame.split_stream(room) {
            (head, Some(tail)) if room > 0 => {
                queue.push_front(tail);
                queue.push_front(head);
            }
            _ => {
                return Err(Error::FrameTooLarge {
                    frame_len,
                    max_len: max_size,
                })
            }
        }
    }

    if !builder.is_empty() {
        packets.push(builder.finish(*next_number));
        *next_number += 1;
    }

    Ok(packets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ack::AckRecord;
    use bytes::Bytes;

    fn sample_packet() -> Packet {
        Packet::new(
            17,
            vec![
                Frame::Ack(AckRecord::Bitmap {
                    largest: 30,
                    bitmap: 0b1011,
                }),
                Frame::Stream {
                    stream_id: 1,
                    offset: 0,
                    data: Bytes::from_static(b"GET /index.html"),
                    fin: false,
                },
                Frame::Ping,
            ],
        )
    }

    fn decode(bytes: &[u8]) -> Packet {
        match Packet::from_bytes(bytes).unwrap() {
            Decoded::Complete { value, .. } => value,
            Decoded::Incomplete { needed } => panic!("incomplete, needed {}", needed),
        }
    }

    fn raw_packet(number: u64, frame_count: u16, body: &[u8]) -> Vec<u8> {
        let header = PacketHeader {
            magic: MAGIC_NUMBER,
            version: PROTOCOL_VERSION,
            packet_number: number,
            frame_count,
            crc32: crc32fast::hash(body),
        };
        let mut buf = bincode::serialize(&header).unwrap();
        buf.extend_from_slice(body);
        buf
    }

    #[test]
    fn test_header_len_matches_bincode() {
        let header = PacketHeader {
            magic: MAGIC_NUMBER,
            version: PROTOCOL_VERSION,
            packet_number: 0,
            frame_count: 0,
            crc32: 0,
        };
        assert_eq!(
            bincode::serialized_size(&header).unwrap() as usize,
            PACKET_HEADER_LEN
        );
    }

    #[test]
    fn test_packet_round_trip() {
        let packet = sample_packet();
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(bytes.len(), packet.encoded_len());
        assert_eq!(decode(&bytes), packet);
    }

    #[test]
    fn test_truncated_datagram_needs_more() {
        let bytes = sample_packet().to_bytes().unwrap();
        assert!(matches!(
            Packet::from_bytes(&bytes[..5]).unwrap(),
            Decoded::Incomplete {
                needed: PACKET_HEADER_LEN
            }
        ));
        assert!(matches!(
            Packet::from_bytes(&bytes[..bytes.len() - 3]).unwrap(),
            Decoded::Incomplete { .. }
        ));
    }

    #[test]
    fn test_corruption_detected() {
        let mut bytes = sample_packet().to_bytes().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            Packet::from_bytes(&bytes),
            Err(Error::CrcMismatch { .. })
        ));

        let mut bytes = sample_packet().to_bytes().unwrap();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            Packet::from_bytes(&bytes),
            Err(Error::InvalidMagicNumber { .. })
        ));
    }

    #[test]
    fn test_declared_length_resync() {
        let stream = Frame::Stream {
            stream_id: 2,
            offset: 10,
            data: Bytes::from_static(b"abc"),
            fin: false,
        };
        let stream_bytes = stream.to_bytes().unwrap();
        let ping_bytes = Frame::Ping.to_bytes().unwrap();

        // FLEN이 실제보다 3바이트 큼 → 선언 길이만큼 건너뛰고 다음 프레임 정상 처리
        let mut body = Vec::new();
        body.extend_from_slice(&((stream_bytes.len() + 3) as u16).to_le_bytes());
        body.extend_from_slice(&stream_bytes);
        body.extend_from_slice(&[0, 0, 0]);
        body.extend_from_slice(&(ping_bytes.len() as u16).to_le_bytes());
        body.extend_from_slice(&ping_bytes);

        let packet = decode(&raw_packet(5, 2, &body));
        assert_eq!(packet.number, 5);
        assert_eq!(packet.frames, vec![stream, Frame::Ping]);
    }

    #[test]
    fn test_frame_overrunning_declared_length_dropped() {
        let stream_bytes = Frame::Stream {
            stream_id: 2,
            offset: 0,
            data: Bytes::from_static(b"abcdef"),
            fin: false,
        }
        .to_bytes()
        .unwrap();
        let ping_bytes = Frame::Ping.to_bytes().unwrap();

        // FLEN이 실제보다 작음 → 해당 프레임만 폐기
        let short = stream_bytes.len() - 2;
        let mut body = Vec::new();
        body.extend_from_slice(&(short as u16).to_le_bytes());
        body.extend_from_slice(&stream_bytes[..short]);
        body.extend_from_slice(&(ping_bytes.len() as u16).to_le_bytes());
        body.extend_from_slice(&ping_bytes);

        let packet = decode(&raw_packet(6, 2, &body));
        assert_eq!(packet.frames, vec![Frame::Ping]);
    }

    #[test]
    fn test_builder_respects_mtu() {
        let mut builder = PacketBuilder::new(100);
        assert_eq!(builder.remaining(), 100 - PACKET_HEADER_LEN);
        assert!(builder.try_push(Frame::Ping).is_ok());
        let room = builder.stream_room();
        let fits = Frame::Stream {
            stream_id: 0,
            offset: 0,
            data: Bytes::from(vec![0u8; room]),
            fin: false,
        };
        assert!(builder.try_push(fits).is_ok());
        assert_eq!(builder.remaining(), 0);
        assert!(builder.try_push(Frame::Ping).is_err());
        assert_eq!(builder.finish(0).to_bytes().unwrap().len(), 100);
    }

    #[test]
    fn test_packetize_starts_new_packet_on_overflow() {
        let frames: Vec<Frame> = (0..4)
            .map(|i| Frame::Stream {
                stream_id: i,
                offset: 0,
                data: Bytes::from(vec![1u8; 400]),
                fin: false,
            })
            .collect();

        let mut next = 10;
        let packets = packetize(frames, 1000, &mut next).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].number, 10);
        assert_eq!(packets[1].number, 11);
        assert_eq!(next, 12);
        for packet in &packets {
            assert!(packet.encoded_len() <= 1000);
            assert_eq!(packet.frames.len(), 2);
        }
    }

    #[test]
    fn test_packetize_splits_oversized_stream() {
        let frame = Frame::Stream {
            stream_id: 9,
            offset: 0,
            data: Bytes::from(vec![7u8; 3000]),
            fin: true,
        };
        let mut next = 0;
        let packets = packetize([frame], 1200, &mut next).unwrap();
        assert_eq!(packets.len(), 3);

        let mut expected_offset = 0;
        for (i, packet) in packets.iter().enumerate() {
            assert!(packet.encoded_len() <= 1200);
            match &packet.frames[0] {
                Frame::Stream {
                    offset, data, fin, ..
                } => {
                    assert_eq!(*offset, expected_offset);
                    assert_eq!(*fin, i == packets.len() - 1);
                    expected_offset += data.len() as u64;
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }
        assert_eq!(expected_offset, 3000);
    }

    #[test]
    fn test_packetize_rejects_unsplittable() {
        let mut next = 0;
        let result = packetize([Frame::Ping], 30, &mut next);
        assert!(matches!(result, Err(Error::FrameTooLarge { .. })));
    }
}
