//! H3Lab 서버 (객체 송신자)
//!
//! 새 피어가 연결하면 스트림 N개를 열어 각각 객체 하나씩 보낸다.
//!
//! 사용법:
//!   cargo run --release --bin h3lab-server -- [OPTIONS]
//!
//! 예시:
//!   cargo run --release --bin h3lab-server -- --bind 0.0.0.0:9000 --streams 8 --size 262144

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use h3lab::host::Connection;
use h3lab::sim::object_payload;
use h3lab::{Config, Endpoint, SendOutcome};

/// 서버 설정
struct ServerConfig {
    bind_addr: SocketAddr,
    streams: usize,
    object_size: usize,
    config: Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            streams: 4,
            object_size: 256 * 1024,
            config: Config::default(),
        }
    }
}

fn parse_args() -> ServerConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ServerConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--streams" | "-n" => {
                if i + 1 < args.len() {
                    config.streams = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--size" | "-s" => {
                if i + 1 < args.len() {
                    config.object_size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--lossy" => {
                config.config = Config::lossy_link();
            }
            "--handshake-ms" => {
                if i + 1 < args.len() {
                    let ms: u64 = args[i + 1].parse().expect("유효한 숫자 필요");
                    config.config.handshake_delay = Duration::from_millis(ms);
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"H3Lab Server - QUIC 유사 전송 실험 서버

연결한 피어마다 스트림 N개로 객체를 동시에 전송

사용법:
  cargo run --release --bin h3lab-server -- [OPTIONS]

옵션:
  -b, --bind <ADDR>       바인드 주소 (기본: 0.0.0.0:9000)
  -n, --streams <N>       피어당 스트림 수 (기본: 4)
  -s, --size <BYTES>      스트림당 객체 크기 (기본: 262144)
  --lossy                 손실 링크용 설정 사용
  --handshake-ms <MS>     핸드쉐이크 지연 (기본: 0)
  -h, --help              이 도움말 출력

로그 레벨은 RUST_LOG 환경 변수로 조절 (예: RUST_LOG=h3lab=debug)
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

/// 연결 하나에 객체 전송
async fn serve(conn: Connection, streams: usize, object_size: usize) {
    let handle = conn.handle;
    let peer = handle.peer();
    let started = Instant::now();

    for i in 0..streams as u64 {
        let stream_id = i * 4;
        if let Err(e) = handle.open_stream(stream_id) {
            warn!(peer = %peer, "스트림 열기 실패: {}", e);
            return;
        }
        match handle
            .send(stream_id, object_payload(stream_id, object_size), true)
            .await
        {
            Ok(SendOutcome::Sent) => info!(peer = %peer, stream_id, "전송 시작"),
            Ok(SendOutcome::Deferred { reason, .. }) => {
                info!(peer = %peer, stream_id, ?reason, "전송 대기 (세션이 이어서 전송)")
            }
            Err(e) => {
                warn!(peer = %peer, stream_id, "전송 실패: {}", e);
                return;
            }
        }
    }

    // 재전송이 끝날 때까지 주기적으로 상태 출력
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    while handle.is_running() {
        interval.tick().await;
        let stats = handle.stats();
        info!(peer = %peer, "{}", stats.summary(Instant::now()));
        if started.elapsed() > Duration::from_secs(60) {
            info!(peer = %peer, "세션 정리");
            handle.stop();
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let server_config = parse_args();

    info!("H3Lab Server starting...");
    info!("Bind address: {}", server_config.bind_addr);
    info!(
        "Streams per peer: {}, object size: {} bytes",
        server_config.streams, server_config.object_size
    );
    info!("Effective MTU: {} bytes", server_config.config.effective_mtu());

    let (endpoint, mut incoming) =
        Endpoint::bind(server_config.config.clone(), server_config.bind_addr).await?;
    info!("Server listening on {}", endpoint.local_addr()?);

    loop {
        tokio::select! {
            conn = incoming.recv() => {
                let Some(conn) = conn else { break };
                tokio::spawn(serve(conn, server_config.streams, server_config.object_size));
            }
            _ = tokio::signal::ctrl_c() => {
                info!("종료 요청");
                break;
            }
        }
    }

    endpoint.stop();
    Ok(())
}
