//! H3Lab 클라이언트 (객체 수신자)
//!
//! 서버에 PING으로 연결하고 스트림별 완료 시간과 무결성을 출력한다.
//!
//! 사용법:
//!   cargo run --release --bin h3lab-client -- [OPTIONS]
//!
//! 예시:
//!   cargo run --release --bin h3lab-client -- --server 127.0.0.1:9000 --streams 8 --size 262144

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use h3lab::sim::object_payload;
use h3lab::{Config, Endpoint, StreamId};

/// 클라이언트 설정
struct ClientConfig {
    server_addr: SocketAddr,
    bind_addr: SocketAddr,
    streams: usize,
    object_size: usize,
    timeout: Duration,
    config: Config,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 9000)),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            streams: 4,
            object_size: 256 * 1024,
            timeout: Duration::from_secs(30),
            config: Config::default(),
        }
    }
}

fn parse_args() -> ClientConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ClientConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--server" | "-s" => {
                if i + 1 < args.len() {
                    config.server_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
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
            "--size" => {
                if i + 1 < args.len() {
                    config.object_size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--timeout" | "-t" => {
                if i + 1 < args.len() {
                    let secs: u64 = args[i + 1].parse().expect("유효한 숫자 필요");
                    config.timeout = Duration::from_secs(secs);
                    i += 1;
                }
            }
            "--lossy" => {
                config.config = Config::lossy_link();
            }
            "--help" | "-h" => {
                println!(
                    r#"H3Lab Client - QUIC 유사 전송 실험 클라이언트

사용법:
  cargo run --release --bin h3lab-client -- [OPTIONS]

옵션:
  -s, --server <ADDR>     서버 주소 (기본: 127.0.0.1:9000)
  -b, --bind <ADDR>       로컬 바인드 주소 (기본: 0.0.0.0:0)
  -n, --streams <N>       기대하는 스트림 수 (기본: 4, 서버와 같아야 함)
  --size <BYTES>          스트림당 객체 크기 (기본: 262144)
  -t, --timeout <SECS>    전체 타임아웃 (기본: 30)
  --lossy                 손실 링크용 설정 사용
  -h, --help              이 도움말 출력
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

/// 스트림별 수신 진행 상황
struct Progress {
    received: Vec<u8>,
    completed_at: Option<Duration>,
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

    let client_config = parse_args();

    info!("H3Lab Client starting...");
    info!("Server address: {}", client_config.server_addr);

    let (endpoint, _incoming) =
        Endpoint::bind(client_config.config.clone(), client_config.bind_addr).await?;
    info!("Bound to local address: {}", endpoint.local_addr()?);

    let mut conn = endpoint.connect(client_config.server_addr)?;
    let started = Instant::now();

    let ids: Vec<StreamId> = (0..client_config.streams as u64).map(|i| i * 4).collect();
    let mut progress: BTreeMap<StreamId, Progress> = BTreeMap::new();
    for &id in &ids {
        conn.handle
            .declare_stream_size(id, client_config.object_size as u64)?;
        progress.insert(
            id,
            Progress {
                received: Vec::with_capacity(client_config.object_size),
                completed_at: None,
            },
        );
    }

    let deadline = tokio::time::Instant::now() + client_config.timeout;
    while progress.values().any(|p| p.completed_at.is_none()) {
        let event = match tokio::time::timeout_at(deadline, conn.events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                warn!("세션 종료됨");
                break;
            }
            Err(_) => {
                warn!("타임아웃");
                break;
            }
        };

        let Some(entry) = progress.get_mut(&event.stream_id) else {
            warn!(stream_id = event.stream_id, "예상하지 못한 스트림");
            continue;
        };
        entry.received.extend_from_slice(&event.data);
        if event.fin {
            entry.completed_at = Some(started.elapsed());
            info!(
                stream_id = event.stream_id,
                bytes = entry.received.len(),
                "스트림 완료: {:?}",
                started.elapsed()
            );
        }
    }

    println!();
    println!("{:>8} {:>12} {:>12} {:>8}", "stream", "bytes", "time", "crc");
    for (id, p) in &progress {
        let expected = crc32fast::hash(&object_payload(*id, client_config.object_size));
        let crc_ok = p.completed_at.is_some() && crc32fast::hash(&p.received) == expected;
        let time = p
            .completed_at
            .map(|t| format!("{:.1}ms", t.as_secs_f64() * 1000.0))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>8} {:>12} {:>12} {:>8}",
            id,
            p.received.len(),
            time,
            if crc_ok { "ok" } else { "FAIL" }
        );
    }

    let stats = conn.handle.stats();
    println!();
    println!("{}", stats.summary(Instant::now()));

    conn.handle.stop();
    endpoint.stop();
    Ok(())
}
