//! Host CPU and memory readings for node heartbeats.
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut sampler = SystemSampler::new();
//! let info = sampler.sample();
//! println!("CPU: {}%, Memory: {}%", info.cpu_percent, info.memory_percent);
//! ```

use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

/// Host resource usage, as published in node stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemInfo {
    /// CPU usage as a percentage (0-100).
    pub cpu_percent: u32,
    /// Memory usage as a percentage (0-100).
    pub memory_percent: u32,
}

/// Keeps one `System` alive between heartbeats.
///
/// CPU usage is a delta between refreshes, so the first sample reads 0 and
/// later samples cover the time since the previous heartbeat.
pub struct SystemSampler {
    system: System,
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemSampler {
    #[must_use]
    pub fn new() -> Self {
        let refresh = RefreshKind::new()
            .with_cpu(CpuRefreshKind::new().with_cpu_usage())
            .with_memory(MemoryRefreshKind::new().with_ram());
        Self {
            system: System::new_with_specifics(refresh),
        }
    }

    /// Refresh and read current usage, clamped to 0-100.
    pub fn sample(&mut self) -> SystemInfo {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let cpu_percent = self.system.global_cpu_info().cpu_usage().clamp(0.0, 100.0) as u32;

        SystemInfo {
            cpu_percent,
            memory_percent: memory_percent(self.system.used_memory(), self.system.total_memory()),
        }
    }
}

fn memory_percent(used: u64, total: u64) -> u32 {
    if total == 0 {
        return 0;
    }
    let percent = u128::from(used) * 100 / u128::from(total);
    u32::try_from(percent.min(100)).unwrap_or(100)
}
