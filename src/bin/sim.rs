//! H3Lab 시뮬레이터
//!
//! 손실률/대역폭/지연 조합마다 결정적 시뮬레이션을 돌려 완료 시간을 표로 출력한다.
//! 조합들은 서로 독립이므로 rayon으로 병렬 실행.
//!
//! 사용법:
//!   cargo run --release --bin h3lab-sim -- [OPTIONS]

use std::time::Duration;

use rayon::prelude::*;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use h3lab::sim::run_transfer;
use h3lab::{Config, LinkConfig, TransferReport};

/// 시뮬레이션 설정
struct SimConfig {
    streams: usize,
    object_size: usize,
    seed: u64,
    time_limit: Duration,
    loss_rates: Vec<f64>,
    bandwidths_mbps: Vec<u64>,
    delays_ms: Vec<u64>,
    lossy_preset: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            streams: 4,
            object_size: 128 * 1024,
            seed: 1,
            time_limit: Duration::from_secs(120),
            loss_rates: vec![0.0, 0.01, 0.05, 0.1],
            bandwidths_mbps: vec![10],
            delays_ms: vec![10, 50],
            lossy_preset: false,
        }
    }
}

fn parse_list<T>(arg: &str) -> Vec<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Debug,
{
    arg.split(',')
        .map(|s| s.trim().parse().expect("유효한 숫자 목록 필요"))
        .collect()
}

fn parse_args() -> SimConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = SimConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
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
            "--seed" => {
                if i + 1 < args.len() {
                    config.seed = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--loss" => {
                if i + 1 < args.len() {
                    config.loss_rates = parse_list(&args[i + 1]);
                    i += 1;
                }
            }
            "--bandwidth" => {
                if i + 1 < args.len() {
                    config.bandwidths_mbps = parse_list(&args[i + 1]);
                    i += 1;
                }
            }
            "--delay" => {
                if i + 1 < args.len() {
                    config.delays_ms = parse_list(&args[i + 1]);
                    i += 1;
                }
            }
            "--limit" => {
                if i + 1 < args.len() {
                    let secs: u64 = args[i + 1].parse().expect("유효한 숫자 필요");
                    config.time_limit = Duration::from_secs(secs);
                    i += 1;
                }
            }
            "--lossy" => {
                config.lossy_preset = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"H3Lab Sim - 결정적 링크 시뮬레이션 스윕

사용법:
  cargo run --release --bin h3lab-sim -- [OPTIONS]

옵션:
  -n, --streams <N>       동시 스트림 수 (기본: 4)
  -s, --size <BYTES>      스트림당 객체 크기 (기본: 131072)
  --seed <N>              난수 시드 (기본: 1)
  --loss <LIST>           손실률 목록 (기본: 0,0.01,0.05,0.1)
  --bandwidth <LIST>      대역폭 Mbps 목록 (기본: 10)
  --delay <LIST>          단방향 지연 ms 목록 (기본: 10,50)
  --limit <SECS>          시뮬레이션 시간 상한 (기본: 120)
  --lossy                 손실 링크용 설정 사용
  -h, --help              이 도움말 출력

예시:
  cargo run --release --bin h3lab-sim -- --loss 0,0.02,0.2 --delay 5,100 --streams 16
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

fn format_ms(d: Option<Duration>) -> String {
    d.map(|d| format!("{:.1}", d.as_secs_f64() * 1000.0))
        .unwrap_or_else(|| "-".to_string())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let sim_config = parse_args();
    let config = if sim_config.lossy_preset {
        Config::lossy_link()
    } else {
        Config::default()
    };

    let mut cases = Vec::new();
    for &bandwidth in &sim_config.bandwidths_mbps {
        for &delay in &sim_config.delays_ms {
            for &loss in &sim_config.loss_rates {
                cases.push((bandwidth, delay, loss));
            }
        }
    }
    info!(cases = cases.len(), "시뮬레이션 시작");

    let results: Vec<((u64, u64, f64), TransferReport)> = cases
        .par_iter()
        .map(|&(bandwidth, delay, loss)| {
            let link = LinkConfig::new(
                bandwidth * 1_000_000,
                Duration::from_millis(delay),
                loss,
            );
            let report = run_transfer(
                config.clone(),
                link,
                sim_config.seed,
                sim_config.streams,
                sim_config.object_size,
                sim_config.time_limit,
            );
            ((bandwidth, delay, loss), report)
        })
        .collect();

    println!(
        "{:>6} {:>6} {:>6} {:>10} {:>10} {:>8} {:>7} {:>6} {:>5}",
        "Mbps", "ms", "loss", "mean(ms)", "last(ms)", "retx", "retx%", "rto", "crc"
    );
    for ((bandwidth, delay, loss), report) in &results {
        let stats = &report.server_stats;
        println!(
            "{:>6} {:>6} {:>6.3} {:>10} {:>10} {:>8} {:>6.1}% {:>6} {:>5}",
            bandwidth,
            delay,
            loss,
            format_ms(report.mean_completion()),
            format_ms(report.finished_at),
            stats.retransmissions,
            stats.retransmission_rate() * 100.0,
            stats.rto_count,
            if report.integrity_ok { "ok" } else { "FAIL" }
        );
    }

    Ok(())
}
