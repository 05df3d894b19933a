//! tokio UDP 호스트
//!
//! - 세션 하나당 태스크 하나. 세션 상태는 그 태스크만 만진다.
//! - 외부에서는 명령 채널을 가진 [`SessionHandle`]로만 조작
//! - [`Endpoint`]는 UDP 소켓 하나를 피어 주소별 세션으로 분배

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::frame::StreamId;
use crate::session::{DatagramSink, SendOutcome, Session, StreamDataSink};
use crate::stats::SessionStats;
use crate::{Config, Error, Result};

/// 수신 데이터 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub stream_id: StreamId,
    pub offset: u64,
    pub data: Bytes,
    pub fin: bool,
}

/// 스트림 이벤트 수신기 타입
pub type StreamEventReceiver = mpsc::UnboundedReceiver<StreamEvent>;

/// 소켓 출력: 논블로킹 전송, 버퍼가 차면 손실로 취급
struct SocketSink {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl DatagramSink for SocketSink {
    fn send_datagram(&mut self, datagram: Bytes) {
        if let Err(e) = self.socket.try_send_to(&datagram, self.peer) {
            debug!(peer = %self.peer, "데이터그램 전송 실패 (손실로 처리): {}", e);
        }
    }
}

/// 재조립 데이터를 채널로 전달
struct ChannelSink {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl StreamDataSink for ChannelSink {
    fn on_stream_data(&mut self, stream_id: StreamId, offset: u64, data: Bytes, fin: bool) {
        let event = StreamEvent {
            stream_id,
            offset,
            data,
            fin,
        };
        if self.tx.send(event).is_err() {
            debug!(stream_id, "스트림 이벤트 수신자 없음");
        }
    }
}

/// 세션 태스크 명령
enum HostCmd {
    Datagram(Bytes),
    Open(StreamId),
    Send {
        stream_id: StreamId,
        data: Bytes,
        fin: bool,
        reply: oneshot::Sender<Result<SendOutcome>>,
    },
    Declare {
        stream_id: StreamId,
        total: u64,
    },
    Ping,
    Stop,
}

/// 세션 핸들 (외부에서 제어용)
#[derive(Clone)]
pub struct SessionHandle {
    peer: SocketAddr,
    cmd_tx: mpsc::UnboundedSender<HostCmd>,
    stats: Arc<RwLock<SessionStats>>,
    running: Arc<AtomicBool>,
}

impl SessionHandle {
    /// 세션 태스크 시작
    fn spawn(
        config: Config,
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    ) -> (Self, StreamEventReceiver) {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<HostCmd>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<StreamEvent>();

        let now = Instant::now();
        let stats = Arc::new(RwLock::new(SessionStats::new(now)));
        let running = Arc::new(AtomicBool::new(true));

        let mut session = Session::new(
            config,
            now,
            SocketSink { socket, peer },
            ChannelSink { tx: event_tx },
        );

        let stats_main = stats.clone();
        let running_main = running.clone();

        tokio::spawn(async move {
            loop {
                let deadline = session.next_timeout();
                let timer = async move {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at.into()).await,
                        None => std::future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    cmd = cmd_rx.recv() => {
                        let now = Instant::now();
                        match cmd {
                            Some(HostCmd::Datagram(datagram)) => {
                                session.on_datagram_received(&datagram, now);
                            }
                            Some(HostCmd::Open(stream_id)) => session.open_stream(stream_id),
                            Some(HostCmd::Send { stream_id, data, fin, reply }) => {
                                let result = session.send_stream_data(stream_id, data, fin, now);
                                let _ = reply.send(result);
                            }
                            Some(HostCmd::Declare { stream_id, total }) => {
                                session.declare_stream_size(stream_id, total);
                            }
                            Some(HostCmd::Ping) => session.send_ping(now),
                            Some(HostCmd::Stop) | None => break,
                        }
                    }
                    _ = timer => {
                        session.on_timeout(Instant::now());
                    }
                }

                // 통계 업데이트
                *stats_main.write() = session.stats().clone();
            }

            running_main.store(false, Ordering::SeqCst);
            info!(peer = %peer, "세션 종료: {}", session.stats().summary(Instant::now()));
        });

        let handle = Self {
            peer,
            cmd_tx,
            stats,
            running,
        };
        (handle, event_rx)
    }

    fn send_cmd(&self, cmd: HostCmd) -> Result<()> {
        self.cmd_tx.send(cmd).map_err(|_| Error::ChannelError)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn open_stream(&self, stream_id: StreamId) -> Result<()> {
        self.send_cmd(HostCmd::Open(stream_id))
    }

    /// 스트림에 데이터 쓰기. 미뤄진 데이터는 세션 태스크가 알아서 보낸다.
    pub async fn send(&self, stream_id: StreamId, data: Bytes, fin: bool) -> Result<SendOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send_cmd(HostCmd::Send {
            stream_id,
            data,
            fin,
            reply,
        })?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    pub fn declare_stream_size(&self, stream_id: StreamId, total: u64) -> Result<()> {
        self.send_cmd(HostCmd::Declare { stream_id, total })
    }

    pub fn ping(&self) -> Result<()> {
        self.send_cmd(HostCmd::Ping)
    }

    fn deliver(&self, datagram: Bytes) -> Result<()> {
        self.send_cmd(HostCmd::Datagram(datagram))
    }

    /// 정지
    pub fn stop(&self) {
        let _ = self.cmd_tx.send(HostCmd::Stop);
    }

    /// 통계 반환
    pub fn stats(&self) -> SessionStats {
        self.stats.read().clone()
    }

    /// 실행 중 여부
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// 새로 생긴 연결
pub struct Connection {
    pub handle: SessionHandle,
    pub events: StreamEventReceiver,
}

/// 새 연결 수신기 타입
pub type ConnectionReceiver = mpsc::UnboundedReceiver<Connection>;

/// UDP 엔드포인트: 피어별 세션 분배
pub struct Endpoint {
    config: Config,
    socket: Arc<UdpSocket>,
    sessions: Arc<DashMap<SocketAddr, SessionHandle>>,
    running: Arc<AtomicBool>,
}

impl Endpoint {
    /// 소켓 바인딩 후 수신 루프 시작
    ///
    /// 모르는 주소에서 온 데이터그램은 새 세션을 만들고 반환된 수신기로 알린다.
    pub async fn bind(config: Config, addr: SocketAddr) -> Result<(Self, ConnectionReceiver)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let sessions: Arc<DashMap<SocketAddr, SessionHandle>> = Arc::new(DashMap::new());
        let running = Arc::new(AtomicBool::new(true));
        let (accept_tx, accept_rx) = mpsc::unbounded_channel::<Connection>();

        info!("H3Lab endpoint started on {}", socket.local_addr()?);

        let socket_recv = socket.clone();
        let sessions_recv = sessions.clone();
        let running_recv = running.clone();
        let config_recv = config.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];

            while running_recv.load(Ordering::SeqCst) {
                match tokio::time::timeout(
                    Duration::from_millis(10),
                    socket_recv.recv_from(&mut buf),
                )
                .await
                {
                    Ok(Ok((len, peer))) => {
                        let datagram = Bytes::copy_from_slice(&buf[..len]);
                        let existing = sessions_recv.get(&peer).map(|entry| entry.value().clone());
                        let handle = match existing {
                            Some(handle) => handle,
                            None => {
                                let (handle, events) = SessionHandle::spawn(
                                    config_recv.clone(),
                                    socket_recv.clone(),
                                    peer,
                                );
                                sessions_recv.insert(peer, handle.clone());
                                info!(peer = %peer, "새 연결");
                                let _ = accept_tx.send(Connection {
                                    handle: handle.clone(),
                                    events,
                                });
                                handle
                            }
                        };
                        if handle.deliver(datagram).is_err() {
                            debug!(peer = %peer, "종료된 세션, 제거");
                            sessions_recv.remove(&peer);
                        }
                    }
                    Ok(Err(e)) => {
                        warn!("수신 에러: {}", e);
                    }
                    Err(_) => {
                        // 타임아웃, 계속
                    }
                }
            }

            for entry in sessions_recv.iter() {
                entry.value().stop();
            }
        });

        let endpoint = Self {
            config,
            socket,
            sessions,
            running,
        };
        Ok((endpoint, accept_rx))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// 피어와 세션을 만들고 PING으로 상대 세션 생성을 유도
    pub fn connect(&self, peer: SocketAddr) -> Result<Connection> {
        let (handle, events) =
            SessionHandle::spawn(self.config.clone(), self.socket.clone(), peer);
        self.sessions.insert(peer, handle.clone());
        handle.ping()?;
        info!(peer = %peer, "연결 시작");
        Ok(Connection { handle, events })
    }

    pub fn session(&self, peer: &SocketAddr) -> Option<SessionHandle> {
        self.sessions.get(peer).map(|entry| entry.value().clone())
    }

    /// 활성 세션 수
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// 정지 (모든 세션 포함)
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::object_payload;

    async fn endpoint() -> (Endpoint, ConnectionReceiver) {
        Endpoint::bind(Config::default(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap()
    }

    async fn collect_stream(events: &mut StreamEventReceiver, stream_id: StreamId) -> Vec<u8> {
        let mut data = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .expect("스트림 수신 타임아웃")
                .expect("이벤트 채널 닫힘");
            if event.stream_id != stream_id {
                continue;
            }
            assert_eq!(event.offset, data.len() as u64);
            data.extend_from_slice(&event.data);
            if event.fin {
                return data;
            }
        }
    }

    #[tokio::test]
    async fn test_udp_transfer() {
        let (server, mut incoming) = endpoint().await;
        let (client, _) = endpoint().await;
        let server_addr = server.local_addr().unwrap();

        let mut conn = client.connect(server_addr).unwrap();
        let accepted = tokio::time::timeout(Duration::from_secs(5), incoming.recv())
            .await
            .unwrap()
            .unwrap();

        let payload = object_payload(8, 100_000);
        accepted.handle.open_stream(8).unwrap();
        accepted
            .handle
            .send(8, payload.clone(), true)
            .await
            .unwrap();

        let received = collect_stream(&mut conn.events, 8).await;
        assert_eq!(received, payload.to_vec());

        assert_eq!(server.session_count(), 1);
        assert!(accepted.handle.is_running());

        conn.handle.stop();
        server.stop();
        client.stop();
    }

    #[tokio::test]
    async fn test_send_on_unknown_stream_fails() {
        let (server, _incoming) = endpoint().await;
        let (client, _) = endpoint().await;
        let conn = client.connect(server.local_addr().unwrap()).unwrap();

        let result = conn.handle.send(1, Bytes::from_static(b"x"), false).await;
        assert!(matches!(result, Err(Error::UnknownStream { stream_id: 1 })));

        conn.handle.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!conn.handle.is_running());
        assert!(matches!(
            conn.handle.send(1, Bytes::new(), true).await,
            Err(Error::ChannelError)
        ));

        server.stop();
        client.stop();
    }
}
