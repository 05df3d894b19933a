//! 시뮬레이션 링크 위 통합 테스트
//!
//! 가상 시계라 실제 시간은 거의 걸리지 않고, 시드가 같으면 결과도 같다.

use std::time::Duration;

use h3lab::sim::{object_payload, run_transfer};
use h3lab::{Config, LinkConfig, Simulation};

fn assert_complete(report: &h3lab::TransferReport) {
    assert!(
        report.all_completed(),
        "미완료 스트림: {:?}",
        report.completions
    );
    assert!(report.integrity_ok, "수신 데이터 CRC 불일치");
}

// ---------------------------------------------------------------------------
// 손실 링크
// ---------------------------------------------------------------------------

#[test]
fn test_transfer_survives_random_loss() {
    let link = LinkConfig::new(10_000_000, Duration::from_millis(20), 0.05);
    let report = run_transfer(Config::default(), link, 7, 8, 64 * 1024, Duration::from_secs(120));

    assert_complete(&report);
    assert!(report.downlink.random_drops > 0);
    assert!(report.server_stats.retransmissions > 0);
    assert!(report.server_stats.congestion_events > 0);
    assert_eq!(report.client_stats.streams_completed, 8);
}

#[test]
fn test_transfer_survives_heavy_loss() {
    let link = LinkConfig::new(10_000_000, Duration::from_millis(10), 0.2);
    let report = run_transfer(
        Config::lossy_link(),
        link,
        3,
        4,
        32 * 1024,
        Duration::from_secs(600),
    );

    assert_complete(&report);
    assert!(report.server_stats.packets_lost > 0);
}

#[test]
fn test_jitter_reordering_is_reassembled() {
    let link = LinkConfig::new(20_000_000, Duration::from_millis(10), 0.0)
        .with_jitter(Duration::from_millis(8));
    let report = run_transfer(Config::default(), link, 11, 4, 100_000, Duration::from_secs(60));

    assert_complete(&report);
    assert_eq!(report.downlink.random_drops, 0);
}

#[test]
fn test_queue_overflow_recovers() {
    let link = LinkConfig {
        bandwidth_bps: 1_000_000,
        delay: Duration::from_millis(10),
        queue_limit: 4,
        ..LinkConfig::default()
    };
    let report = run_transfer(Config::default(), link, 5, 2, 50_000, Duration::from_secs(120));

    assert_complete(&report);
    assert!(report.downlink.queue_drops > 0);
}

// ---------------------------------------------------------------------------
// 멀티플렉싱
// ---------------------------------------------------------------------------

#[test]
fn test_streams_progress_together() {
    let report = run_transfer(
        Config::default(),
        LinkConfig::default(),
        1,
        4,
        200_000,
        Duration::from_secs(60),
    );
    assert_complete(&report);

    let times: Vec<Duration> = report.completions.iter().filter_map(|(_, t)| *t).collect();
    let first = *times.iter().min().unwrap();
    let last = *times.iter().max().unwrap();
    // 라운드 로빈이라 한 스트림이 다른 스트림을 굶기지 않는다
    assert!(last - first < last / 4, "완료 시각 편차가 큼: {:?}", times);
}

#[test]
fn test_handshake_delays_first_byte() {
    let config = Config::default().with_handshake_delay(Duration::from_millis(100));
    let report = run_transfer(config, LinkConfig::default(), 1, 1, 1000, Duration::from_secs(10));

    assert_complete(&report);
    assert!(report.finished_at.unwrap() >= Duration::from_millis(110));
}

// ---------------------------------------------------------------------------
// 불변식
// ---------------------------------------------------------------------------

#[test]
fn test_in_flight_matches_outstanding_under_loss() {
    let link = LinkConfig::new(5_000_000, Duration::from_millis(15), 0.1);
    let mut sim = Simulation::new(Config::default(), link, 9);

    sim.with_server(|server, now| {
        server.open_stream(0);
        server
            .send_stream_data(0, object_payload(0, 80_000), true, now)
            .unwrap();
    });

    let mut steps = 0;
    while sim.completion(0).is_none() && steps < 200_000 {
        assert!(sim.step());
        let server = sim.server();
        assert_eq!(server.bytes_in_flight(), server.outstanding_bytes());
        assert!(server.cwnd_bytes() >= server.config().min_cwnd());
        steps += 1;
    }
    assert!(sim.completion(0).is_some());
}

#[test]
fn test_upload_from_client() {
    let link = LinkConfig::new(10_000_000, Duration::from_millis(5), 0.02);
    let mut sim = Simulation::new(Config::default(), link, 21);
    let payload = object_payload(2, 40_000);
    let expected = crc32fast::hash(&payload);

    sim.with_client(|client, now| {
        client.open_stream(2);
        client.send_stream_data(2, payload, true, now).unwrap();
    });

    let done = sim.run_until(Duration::from_secs(60), |sim| {
        sim.server_rx().checksum(2).is_some()
    });
    assert!(done);
    assert_eq!(sim.server_rx().checksum(2), Some(expected));
    assert_eq!(sim.server_rx().bytes(2), 40_000);
}

#[test]
fn test_different_seeds_differ() {
    let link = LinkConfig::new(10_000_000, Duration::from_millis(10), 0.1);
    let a = run_transfer(Config::default(), link.clone(), 1, 2, 64 * 1024, Duration::from_secs(120));
    let b = run_transfer(Config::default(), link, 2, 2, 64 * 1024, Duration::from_secs(120));

    assert_complete(&a);
    assert_complete(&b);
    assert_ne!(
        (a.downlink.random_drops, a.server_stats.packets_sent),
        (b.downlink.random_drops, b.server_stats.packets_sent)
    );
}
