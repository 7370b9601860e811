// Download speed - moving average over the last few progress samples

use std::collections::VecDeque;
use std::time::Duration;

pub struct SpeedMeter {
    window: usize,
    samples: VecDeque<u64>,
}

impl SpeedMeter {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: VecDeque::with_capacity(window.max(1)),
        }
    }

    /// Add a sample of `bytes` received over `elapsed`; returns the averaged bytes/sec
    pub fn record(&mut self, bytes: u64, elapsed: Duration) -> u64 {
        let secs = elapsed.as_secs_f64();
        let speed = if secs > 0.0 { (bytes as f64 / secs) as u64 } else { 0 };

        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(speed);
        self.current()
    }

    pub fn current(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        self.samples.iter().sum::<u64>() / self.samples.len() as u64
    }
}
