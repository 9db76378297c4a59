use crate::config::CallConfig;
use crate::peer::types::IceCandidate;
use log::debug;
use std::io::Write;
use webrtc::peer_connection::RTCPeerConnection;

/// Installs the `env_logger` backend. `RUST_LOG` wins over the configured
/// filter. Returns false when a logger was already installed.
pub fn init(config: &CallConfig) -> bool {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_filter.as_str()),
    )
    .format(|buf, record| writeln!(buf, "{}", render(record)))
    .try_init()
    .is_ok()
}

/// `<timestamp> [LEVEL] target - message`
fn render(record: &log::Record) -> String {
    format!(
        "{} [{:<5}] {} - {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        record.level(),
        record.target(),
        record.args()
    )
}

/// Logs a trickled candidate.
pub fn dump_candidate(label: &str, remote_id: &str, cand: &IceCandidate) {
    debug!(
        "Trickle {label} [{remote_id}]: candidate={} sdp_mid={:?} sdp_mline_index={:?}",
        cand.candidate, cand.sdp_mid, cand.sdp_mline_index
    );
}

/// Quick getStats snapshot of the nominated pair.
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    if !log::log_enabled!(log::Level::Debug) {
        return;
    }
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                debug!(
                    "STATS {moment}: {}:{}  type: {:?}  bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.stats_type,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}

/// Counts candidate types; a mesh with no relay candidates may not cross NAT.
pub fn analyze_candidates(candidates: &[IceCandidate]) -> (usize, usize, usize) {
    let mut host_count = 0;
    let mut srflx_count = 0;
    let mut relay_count = 0;

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            host_count += 1;
        } else if candidate.candidate.contains("typ srflx") {
            srflx_count += 1;
        } else if candidate.candidate.contains("typ relay") {
            relay_count += 1;
        }
    }

    debug!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        host_count, srflx_count, relay_count
    );
    (host_count, srflx_count, relay_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(s: &str) -> IceCandidate {
        IceCandidate {
            candidate: s.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[test]
    fn candidate_types_are_counted() {
        let counts = analyze_candidates(&[
            cand("candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host"),
            cand("candidate:2 1 udp 1694498815 203.0.113.7 50001 typ srflx raddr 10.0.0.2 rport 50000"),
            cand("candidate:3 1 udp 16777215 198.51.100.1 3478 typ relay raddr 203.0.113.7 rport 50001"),
            cand("candidate:4 1 udp 2130706431 10.0.0.3 50002 typ host"),
        ]);
        assert_eq!(counts, (2, 1, 1));
    }

    #[test]
    fn line_carries_level_target_and_message() {
        let line = render(
            &log::Record::builder()
                .args(format_args!("link up"))
                .level(log::Level::Info)
                .target("callmesh::peer")
                .build(),
        );
        assert!(line.ends_with(" [INFO ] callmesh::peer - link up"), "{line}");
    }

    #[test]
    fn init_is_idempotent() {
        let config = CallConfig::default();
        init(&config);
        assert!(!init(&config));
    }
}
