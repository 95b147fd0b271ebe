use std::time::{Duration, Instant};

/// Minimum time between two speed samples.
pub const SAMPLE_WINDOW: Duration = Duration::from_millis(300);

/// Smoothed transfer speed of one running body.
///
/// Bytes are accumulated until a full sampling window has elapsed, then the
/// instant rate is folded into the running value (0.8 old, 0.2 new).
#[derive(Debug, Clone)]
pub struct SpeedMeter {
    window: Duration,
    started_at: Instant,
    last_sample: Instant,
    pending_bytes: u64,
    total_bytes: u64,
    speed_bps: Option<u64>,
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::with_window(SAMPLE_WINDOW)
    }
}

impl SpeedMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_window(window: Duration) -> Self {
        let now = Instant::now();
        Self {
            window,
            started_at: now,
            last_sample: now,
            pending_bytes: 0,
            total_bytes: 0,
            speed_bps: None,
        }
    }

    /// Records `bytes` written now and returns the current speed in bytes/s.
    pub fn record(&mut self, bytes: u64) -> u64 {
        self.record_at(bytes, Instant::now())
    }

    pub fn record_at(&mut self, bytes: u64, now: Instant) -> u64 {
        self.pending_bytes += bytes;
        self.total_bytes += bytes;

        let elapsed = now.saturating_duration_since(self.last_sample);
        if elapsed >= self.window {
            let instant = (self.pending_bytes as f64 / elapsed.as_secs_f64()) as u64;
            let smoothed = match self.speed_bps {
                Some(previous) => (previous as f64 * 0.8 + instant as f64 * 0.2) as u64,
                None => instant,
            };
            self.speed_bps = Some(smoothed);
            self.pending_bytes = 0;
            self.last_sample = now;
        }
        self.speed()
    }

    pub fn speed(&self) -> u64 {
        self.speed_bps.unwrap_or(0)
    }

    /// Mean rate since the meter was created.
    pub fn average(&self) -> u64 {
        let elapsed = self.started_at.elapsed().as_secs_f64().max(0.001);
        (self.total_bytes as f64 / elapsed) as u64
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}
