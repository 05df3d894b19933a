//! 스트림 재조립
//!
//! 수신한 바이트 구간을 서로 겹치지 않는 정렬된 반열린 구간 목록으로 합치고,
//! 0부터 이어지는 연속 구간만 애플리케이션에 넘긴다.
//!
//! - 중복/겹침 수신은 구간 병합으로 흡수 (바이트 중복 집계 없음)
//! - 버퍼에는 새로 채워진 부분만 저장
//! - 완료(FIN 전달)는 최종 크기를 알고 `[0, 최종 크기)`가 채워진 순간 한 번만

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::frame::StreamId;

/// 정렬된 서로소 반열린 구간 집합 `[start, end)`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<(u64, u64)>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// `[offset, offset + len)` 수신 기록, 새로 채워진 바이트 수 반환
    ///
    /// 겹치거나 맞닿은 앞뒤 구간과 모두 병합한다.
    pub fn mark_received(&mut self, offset: u64, len: u64) -> u64 {
        if len == 0 {
            return 0;
        }
        let start = offset;
        let end = offset + len;

        // 병합 대상: end >= start 인 첫 구간부터 start <= end 인 마지막 구간까지
        let first = self.ranges.partition_point(|&(_, e)| e < start);
        let last = self.ranges.partition_point(|&(s, _)| s <= end);

        if first == last {
            self.ranges.insert(first, (start, end));
            return len;
        }

        let merged_start = start.min(self.ranges[first].0);
        let merged_end = end.max(self.ranges[last - 1].1);
        let covered: u64 = self.ranges[first..last].iter().map(|&(s, e)| e - s).sum();

        self.ranges
            .splice(first..last, std::iter::once((merged_start, merged_end)));
        (merged_end - merged_start) - covered
    }

    /// 수신 바이트 합 (정보용)
    pub fn bytes_received(&self) -> u64 {
        self.ranges.iter().map(|&(s, e)| e - s).sum()
    }

    /// 0부터 빈틈없이 `n`까지 채워졌는지
    pub fn has_contiguous_prefix(&self, n: u64) -> bool {
        n == 0 || self.contiguous_end() >= n
    }

    /// 0에서 시작하는 연속 구간의 끝 (없으면 0)
    pub fn contiguous_end(&self) -> u64 {
        match self.ranges.first() {
            Some(&(0, end)) => end,
            _ => 0,
        }
    }

    /// 가장 큰 수신 오프셋의 끝
    pub fn max_end(&self) -> u64 {
        self.ranges.last().map_or(0, |&(_, e)| e)
    }

    /// `[start, end)` 안에서 아직 비어 있는 구간들
    pub fn gaps_within(&self, start: u64, end: u64) -> Vec<(u64, u64)> {
        let mut gaps = Vec::new();
        let mut cursor = start;
        let first = self.ranges.partition_point(|&(_, e)| e <= start);

        for &(s, e) in &self.ranges[first..] {
            if s >= end {
                break;
            }
            if s > cursor {
                gaps.push((cursor, s));
            }
            cursor = cursor.max(e);
            if cursor >= end {
                break;
            }
        }
        if cursor < end {
            gaps.push((cursor, end));
        }
        gaps
    }

    /// 구간 개수
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().copied()
    }
}

/// 애플리케이션에 넘길 연속 데이터
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub offset: u64,
    pub data: Bytes,
    pub fin: bool,
}

/// 수신 스트림
#[derive(Debug)]
pub struct RecvStream {
    stream_id: StreamId,

    /// 수신 구간
    ranges: RangeSet,

    /// 아직 전달하지 않은 조각 (시작 오프셋 → 데이터, 서로 겹치지 않음)
    pending: BTreeMap<u64, Bytes>,

    /// 애플리케이션에 전달한 연속 바이트 끝
    delivered: u64,

    /// 최종 크기 (FIN 또는 외부 선언)
    final_size: Option<u64>,

    /// 완료 여부 (한 번만 true)
    completed: bool,
}

impl RecvStream {
    pub fn new(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            ranges: RangeSet::new(),
            pending: BTreeMap::new(),
            delivered: 0,
            final_size: None,
            completed: false,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn bytes_received(&self) -> u64 {
        self.ranges.bytes_received()
    }

    pub fn has_contiguous_prefix(&self, n: u64) -> bool {
        self.ranges.has_contiguous_prefix(n)
    }

    pub fn final_size(&self) -> Option<u64> {
        self.final_size
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }

    /// 전달 대기 중인 바이트
    pub fn buffered_bytes(&self) -> u64 {
        self.pending.values().map(|b| b.len() as u64).sum()
    }

    /// 최종 크기 설정. 먼저 정해진 값이 우선한다.
    fn set_final_size(&mut self, size: u64) -> bool {
        match self.final_size {
            Some(known) if known == size => true,
            Some(known) => {
                warn!(
                    stream_id = self.stream_id,
                    known, size, "최종 크기 충돌, 기존 값 유지"
                );
                false
            }
            None if size < self.ranges.max_end() => {
                warn!(
                    stream_id = self.stream_id,
                    size,
                    received_end = self.ranges.max_end(),
                    "이미 받은 데이터보다 작은 최종 크기, 무시"
                );
                false
            }
            None => {
                self.final_size = Some(size);
                true
            }
        }
    }

    /// 최종 크기 외부 선언 (헤더 등)
    pub fn declare_size(&mut self, total: u64) -> Vec<Delivery> {
        self.set_final_size(total);
        let mut deliveries = Vec::new();
        self.finish_if_complete(&mut deliveries);
        deliveries
    }

    /// STREAM 프레임 수신. 새로 연속이 된 데이터를 오프셋 순으로 반환한다.
    pub fn on_data(&mut self, offset: u64, data: Bytes, fin: bool) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        if self.completed {
            debug!(stream_id = self.stream_id, offset, "완료된 스트림의 중복 데이터");
            return deliveries;
        }

        let end = offset + data.len() as u64;
        if fin {
            self.set_final_size(end);
        }

        // 최종 크기 밖은 버림
        let end = match self.final_size {
            Some(size) if end > size => {
                debug!(
                    stream_id = self.stream_id,
                    offset,
                    end,
                    final_size = size,
                    "최종 크기를 넘는 데이터 잘라냄"
                );
                size.max(offset)
            }
            _ => end,
        };

        if end > offset {
            for (gap_start, gap_end) in self.ranges.gaps_within(offset, end) {
                let from = (gap_start - offset) as usize;
                let to = (gap_end - offset) as usize;
                self.pending.insert(gap_start, data.slice(from..to));
            }
            self.ranges.mark_received(offset, end - offset);
        }

        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() != self.delivered {
                break;
            }
            let chunk = entry.remove();
            let chunk_offset = self.delivered;
            self.delivered += chunk.len() as u64;
            deliveries.push(Delivery {
                offset: chunk_offset,
                data: chunk,
                fin: false,
            });
        }

        self.finish_if_complete(&mut deliveries);
        deliveries
    }

    fn finish_if_complete(&mut self, deliveries: &mut Vec<Delivery>) {
        if self.completed {
            return;
        }
        let Some(size) = self.final_size else {
            return;
        };
        if !self.ranges.has_contiguous_prefix(size) || self.delivered < size {
            return;
        }

        self.completed = true;
        match deliveries.last_mut() {
            Some(last) => last.fin = true,
            None => deliveries.push(Delivery {
                offset: size,
                data: Bytes::new(),
                fin: true,
            }),
        }
        debug!(stream_id = self.stream_id, size, "스트림 수신 완료");
    }
}

/// 세션의 수신 스트림 모음
#[derive(Debug, Default)]
pub struct Reassembler {
    streams: HashMap<StreamId, RecvStream>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream_mut(&mut self, stream_id: StreamId) -> &mut RecvStream {
        self.streams
            .entry(stream_id)
            .or_insert_with(|| RecvStream::new(stream_id))
    }

    pub fn stream(&self, stream_id: StreamId) -> Option<&RecvStream> {
        self.streams.get(&stream_id)
    }

    pub fn on_data(
        &mut self,
        stream_id: StreamId,
        offset: u64,
        data: Bytes,
        fin: bool,
    ) -> Vec<Delivery> {
        self.stream_mut(stream_id).on_data(offset, data, fin)
    }

    pub fn declare_size(&mut self, stream_id: StreamId, total: u64) -> Vec<Delivery> {
        self.stream_mut(stream_id).declare_size(total)
    }

    /// 완료된 스트림 수
    pub fn completed(&self) -> usize {
        self.streams.values().filter(|s| s.is_complete()).count()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
