//! Progress display
//!
//! Terminal rendering of a running task. The engine only emits events and
//! exposes counters; everything printed lives here.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use crate::session::TorrentSession;

/// Point-in-time counters of one torrent session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadStats {
    pub downloaded: u64,
    pub uploaded: u64,
    /// Bytes per second since the previous sample
    pub download_speed: f64,
    pub upload_speed: f64,
    pub peers: usize,
    /// 0.0 to 1.0 of the selected bytes
    pub progress: f64,
    pub total: u64,
}

impl DownloadStats {
    pub async fn sample(session: &TorrentSession) -> Self {
        let total = session.wanted_size();
        let left = session.left().await;
        let progress = if total == 0 {
            1.0
        } else {
            total.saturating_sub(left) as f64 / total as f64
        };
        Self {
            downloaded: session.downloaded(),
            uploaded: session.uploaded(),
            download_speed: 0.0,
            upload_speed: 0.0,
            peers: session.channel_count().await,
            progress,
            total,
        }
    }

    /// Fill in the transfer rates against an earlier sample
    pub fn with_rates(mut self, previous: &DownloadStats, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            self.download_speed = self.downloaded.saturating_sub(previous.downloaded) as f64 / secs;
            self.upload_speed = self.uploaded.saturating_sub(previous.uploaded) as f64 / secs;
        }
        self
    }

    pub fn format_bytes(bytes: u64) -> String {
        const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit = 0;
        while size >= 1024.0 && unit < UNITS.len() - 1 {
            size /= 1024.0;
            unit += 1;
        }
        format!("{:.2} {}", size, UNITS[unit])
    }

    pub fn format_speed(bytes_per_sec: f64) -> String {
        format!("{}/s", Self::format_bytes(bytes_per_sec as u64))
    }

    pub fn format_duration(duration: Duration) -> String {
        let secs = duration.as_secs();
        match (secs / 3600, (secs % 3600) / 60, secs % 60) {
            (0, 0, s) => format!("{}s", s),
            (0, m, s) => format!("{}m {}s", m, s),
            (h, m, s) => format!("{}h {}m {}s", h, m, s),
        }
    }

    /// Remaining time at the current download rate
    pub fn eta(&self) -> Option<Duration> {
        let remaining = self.total as f64 * (1.0 - self.progress);
        if self.download_speed <= 0.0 || remaining <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining / self.download_speed))
    }
}

#[derive(Debug)]
pub struct ProgressDisplay {
    started: Instant,
    last_update: Option<Instant>,
    interval: Duration,
    quiet: bool,
}

impl ProgressDisplay {
    pub fn new(quiet: bool) -> Self {
        Self::with_interval(quiet, Duration::from_millis(500))
    }

    pub fn with_interval(quiet: bool, interval: Duration) -> Self {
        Self {
            started: Instant::now(),
            last_update: None,
            interval,
            quiet,
        }
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// One status line: bar, percentage, bytes, rates, peers and ETA
    pub fn render(stats: &DownloadStats) -> String {
        const BAR_WIDTH: usize = 40;
        let percent = (stats.progress * 100.0).clamp(0.0, 100.0);
        let filled = ((percent / 100.0) * BAR_WIDTH as f64) as usize;
        let eta = stats
            .eta()
            .map(DownloadStats::format_duration)
            .unwrap_or_else(|| "-".to_string());
        format!(
            "[{}{}] {:.1}% | {} / {} | down {} | up {} | peers {} | eta {}",
            "=".repeat(filled),
            " ".repeat(BAR_WIDTH - filled),
            percent,
            DownloadStats::format_bytes((stats.total as f64 * stats.progress) as u64),
            DownloadStats::format_bytes(stats.total),
            DownloadStats::format_speed(stats.download_speed),
            DownloadStats::format_speed(stats.upload_speed),
            stats.peers,
            eta,
        )
    }

    /// Redraw the status line, at most once per interval
    pub fn update(&mut self, stats: &DownloadStats) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        if let Some(last) = self.last_update {
            if last.elapsed() < self.interval {
                return Ok(());
            }
        }
        self.last_update = Some(Instant::now());
        let mut out = io::stdout().lock();
        write!(out, "\r\x1b[2K{}", Self::render(stats))?;
        out.flush()
    }

    pub fn print_status(&self, message: &str) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        let mut out = io::stdout().lock();
        writeln!(out, "\r\x1b[2K{}", message)
    }

    pub fn print_complete(&self, stats: &DownloadStats) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        let mut out = io::stdout().lock();
        writeln!(out, "\r\x1b[2KDownload complete")?;
        writeln!(out, "  Size: {}", DownloadStats::format_bytes(stats.total))?;
        writeln!(out, "  Downloaded: {}", DownloadStats::format_bytes(stats.downloaded))?;
        writeln!(out, "  Uploaded: {}", DownloadStats::format_bytes(stats.uploaded))?;
        writeln!(out, "  Elapsed: {}", DownloadStats::format_duration(self.elapsed()))
    }

    /// The single user-facing notice for a failed task; printed even in quiet mode
    pub fn print_task_failed(&self, task_id: &str, cause: &str) -> io::Result<()> {
        let mut err = io::stderr().lock();
        writeln!(err, "\r\x1b[2KTask {} failed: {}", task_id, cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_helpers() {
        assert_eq!(DownloadStats::format_bytes(0), "0.00 B");
        assert_eq!(DownloadStats::format_bytes(1536), "1.50 KB");
        assert_eq!(DownloadStats::format_bytes(1024 * 1024 * 1024), "1.00 GB");
        assert_eq!(DownloadStats::format_speed(2048.0), "2.00 KB/s");
        assert_eq!(DownloadStats::format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(DownloadStats::format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(DownloadStats::format_duration(Duration::from_secs(3661)), "1h 1m 1s");
    }

    #[test]
    fn test_rates_and_eta() {
        let before = DownloadStats {
            downloaded: 1000,
            total: 10_000,
            ..DownloadStats::default()
        };
        let after = DownloadStats {
            downloaded: 3000,
            uploaded: 500,
            progress: 0.5,
            total: 10_000,
            ..DownloadStats::default()
        }
        .with_rates(&before, Duration::from_secs(2));

        assert_eq!(after.download_speed, 1000.0);
        assert_eq!(after.upload_speed, 250.0);
        assert_eq!(after.eta(), Some(Duration::from_secs(5)));
        assert_eq!(before.eta(), None);
    }

    #[test]
    fn test_render_line() {
        let stats = DownloadStats {
            progress: 0.25,
            total: 4096,
            peers: 3,
            ..DownloadStats::default()
        };
        let line = ProgressDisplay::render(&stats);
        assert!(line.starts_with(&format!("[{}{}]", "=".repeat(10), " ".repeat(30))));
        assert!(line.contains("25.0%"));
        assert!(line.contains("1.00 KB / 4.00 KB"));
        assert!(line.contains("peers 3"));
        assert!(line.ends_with("eta -"));
    }

    #[test]
    fn test_quiet_display_skips_output() {
        let mut display = ProgressDisplay::with_interval(true, Duration::from_secs(1));
        assert!(display.is_quiet());
        assert!(display.update(&DownloadStats::default()).is_ok());
        assert!(display.print_status("hidden").is_ok());
    }
}
