//! 송신 스트림
//!
//! 애플리케이션이 쓴 데이터는 패킷에 들어갈 때까지 스트림에 남아 있다.
//! 혼잡/흐름 제어로 미뤄져도 버려지지 않고, 같은 오프셋에서 다시 시도된다.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::frame::{Frame, StreamId};
use crate::{Error, Result};

/// 송신 스트림 상태
#[derive(Debug)]
pub struct SendStream {
    stream_id: StreamId,

    /// 다음에 패킷에 넣을 바이트의 오프셋
    send_offset: u64,

    /// 애플리케이션이 쓴 데이터의 끝 오프셋
    write_offset: u64,

    /// 아직 패킷에 넣지 않은 데이터
    pending: VecDeque<Bytes>,

    /// 애플리케이션이 FIN을 요청했는지
    fin_requested: bool,

    /// FIN이 담긴 프레임을 보냈는지
    fin_sent: bool,
}

impl SendStream {
    pub fn new(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            send_offset: 0,
            write_offset: 0,
            pending: VecDeque::new(),
            fin_requested: false,
            fin_sent: false,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// 다음 전송 오프셋
    pub fn send_offset(&self) -> u64 {
        self.send_offset
    }

    /// 지금까지 쓴 전체 바이트
    pub fn write_offset(&self) -> u64 {
        self.write_offset
    }

    /// 전송 대기 바이트
    pub fn pending_bytes(&self) -> u64 {
        self.write_offset - self.send_offset
    }

    /// 보낼 것이 남았는지 (데이터 또는 FIN)
    pub fn has_pending(&self) -> bool {
        self.pending_bytes() > 0 || (self.fin_requested && !self.fin_sent)
    }

    pub fn is_finished(&self) -> bool {
        self.fin_sent
    }

    /// 데이터 추가
    pub fn write(&mut self, data: Bytes, fin: bool) -> Result<()> {
        if self.fin_requested {
            return Err(Error::StreamFinished {
                stream_id: self.stream_id,
            });
        }
        self.write_offset += data.len() as u64;
        if !data.is_empty() {
            self.pending.push_back(data);
        }
        self.fin_requested = fin;
        Ok(())
    }

    /// 최대 `max_len` 바이트를 꺼내 STREAM 프레임으로 만든다
    ///
    /// 남은 데이터가 없고 FIN만 남았으면 빈 FIN 프레임을 만든다.
    /// 보낼 수 있는 것이 없으면 `None`.
    pub fn next_frame(&mut self, max_len: usize) -> Option<Frame> {
        if self.pending_bytes() == 0 {
            if self.fin_requested && !self.fin_sent {
                self.fin_sent = true;
                return Some(Frame::Stream {
                    stream_id: self.stream_id,
                    offset: self.send_offset,
                    data: Bytes::new(),
                    fin: true,
                });
            }
            return None;
        }
        if max_len == 0 {
            return None;
        }

        let front = self.pending.front_mut()?;
        let data = if front.len() <= max_len {
            self.pending.pop_front()?
        } else {
            front.split_to(max_len)
        };

        let offset = self.send_offset;
        self.send_offset += data.len() as u64;

        let fin = self.fin_requested && self.pending_bytes() == 0;
        if fin {
            self.fin_sent = true;
        }

        Some(Frame::Stream {
            stream_id: self.stream_id,
            offset,
            data,
            fin,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_parts(frame: Frame) -> (u64, Bytes, bool) {
        match frame {
            Frame::Stream {
                offset, data, fin, ..
            } => (offset, data, fin),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_chunks_advance_offset() {
        let mut stream = SendStream::new(1);
        stream.write(Bytes::from_static(b"hello "), false).unwrap();
        stream.write(Bytes::from_static(b"world"), true).unwrap();
        assert_eq!(stream.pending_bytes(), 11);

        let (offset, data, fin) = stream_parts(stream.next_frame(4).unwrap());
        assert_eq!((offset, &data[..], fin), (0, &b"hell"[..], false));

        let (offset, data, fin) = stream_parts(stream.next_frame(100).unwrap());
        assert_eq!((offset, &data[..], fin), (4, &b"o "[..], false));

        let (offset, data, fin) = stream_parts(stream.next_frame(100).unwrap());
        assert_eq!((offset, &data[..], fin), (6, &b"world"[..], true));

        assert!(stream.is_finished());
        assert!(!stream.has_pending());
        assert!(stream.next_frame(100).is_none());
    }

    #[test]
    fn test_zero_budget_keeps_data() {
        let mut stream = SendStream::new(2);
        stream.write(Bytes::from_static(b"abc"), false).unwrap();
        assert!(stream.next_frame(0).is_none());
        assert_eq!(stream.pending_bytes(), 3);
        assert_eq!(stream.send_offset(), 0);
    }

    #[test]
    fn test_fin_only_frame() {
        let mut stream = SendStream::new(3);
        stream.write(Bytes::from_static(b"xy"), false).unwrap();
        stream.next_frame(10).unwrap();
        stream.write(Bytes::new(), true).unwrap();

        let (offset, data, fin) = stream_parts(stream.next_frame(0).unwrap());
        assert_eq!((offset, data.len(), fin), (2, 0, true));
    }

    #[test]
    fn test_write_after_fin_rejected() {
        let mut stream = SendStream::new(4);
        stream.write(Bytes::new(), true).unwrap();
        assert!(matches!(
            stream.write(Bytes::from_static(b"late"), false),
            Err(Error::StreamFinished { stream_id: 4 })
        ));
    }
}
