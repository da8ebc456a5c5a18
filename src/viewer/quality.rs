use std::sync::atomic::{AtomicU64, Ordering};

use webrtc::stats::{StatsReport, StatsReportType};

/// Loss at or above this percentage of the remote sender's packets reads
/// as `Poor`.
const POOR_LOSS_THRESHOLD: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionQuality {
    Unknown,
    Good,
    Poor,
}

/// Coarse inbound-quality counters sampled from the peer's stats reports.
/// This is a UX signal, not a congestion-control input.
///
/// A receive-only peer carries no remote-inbound-rtp entries (those describe
/// streams it sends), so loss is derived instead: the remote sender's
/// cumulative `packets_sent` from its sender reports minus the packets
/// counted locally on inbound-rtp, clamped at zero for in-flight packets.
#[derive(Default)]
pub struct QualityStats {
    packets_received: AtomicU64,
    packets_sent: AtomicU64,
}

impl QualityStats {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn set_packets_received(&self, count: u64) {
        self.packets_received.store(count, Ordering::Relaxed);
    }

    pub fn set_packets_sent(&self, count: u64) {
        self.packets_sent.store(count, Ordering::Relaxed);
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn packets_lost(&self) -> u64 {
        self.packets_sent().saturating_sub(self.packets_received())
    }

    /// Packet loss as a percentage of the remote sender's packets. Zero
    /// until the first sender report arrives.
    pub fn loss_percentage(&self) -> f64 {
        let sent = self.packets_sent();
        if sent == 0 {
            return 0.0;
        }
        (self.packets_lost() as f64 / sent as f64) * 100.0
    }

    pub fn classify(&self) -> ConnectionQuality {
        if self.packets_received() + self.packets_sent() == 0 {
            return ConnectionQuality::Unknown;
        }
        if self.loss_percentage() < POOR_LOSS_THRESHOLD {
            ConnectionQuality::Good
        } else {
            ConnectionQuality::Poor
        }
    }

    /// Sums counters across every SSRC in one report so multi-track
    /// sessions do not flap on per-track ordering.
    pub(crate) fn update_from_stats(&self, report: &StatsReport) {
        let mut received = 0;
        let mut sent = 0;
        for value in report.reports.values() {
            match value {
                StatsReportType::InboundRTP(inbound) => {
                    received += inbound.packets_received;
                }
                StatsReportType::RemoteOutboundRTP(remote) => {
                    sent += remote.packets_sent;
                }
                _ => {}
            }
        }
        self.set_packets_received(received);
        self.set_packets_sent(sent);
    }
}
