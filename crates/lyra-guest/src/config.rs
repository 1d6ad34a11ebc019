//! Device context configuration.

use std::time::Duration;

use thiserror::Error;

use lyra_protocol::ring::ENGINE_0;

#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// Ring slots; must be a power of two. Also the number of staging
    /// regions (a submission's command/table bytes live in region
    /// `i mod ring_entry_count` until its fence retires).
    pub ring_entry_count: u32,
    /// Capacity of one command stream, header included.
    pub cmd_buffer_bytes: u32,
    /// Allocation-table slots the guest is willing to emit per submission.
    /// The effective capacity is the smaller of this and
    /// `device_max_alloc_slots` when advertised.
    pub alloc_table_slots: u32,
    /// Device-advertised maximum table size, if the transport reported one.
    pub device_max_alloc_slots: Option<u32>,
    /// Minimum spacing between privileged fence queries issued on behalf of
    /// polling callers.
    pub fence_query_throttle: Duration,
    /// How long the producer will wait for the device to drain a full ring
    /// or retire a busy staging region before reporting the device busy.
    pub busy_wait_budget: Duration,
    /// Present pacing depth (clamped to 1..=16).
    pub max_frame_latency: u32,
    /// Mark every submission NO_IRQ: the guest resolves completion by
    /// polling and the device may skip the completion interrupt.
    pub poll_completions: bool,
    pub context_id: u32,
    pub engine_id: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            ring_entry_count: 64,
            cmd_buffer_bytes: 64 * 1024,
            alloc_table_slots: 256,
            device_max_alloc_slots: None,
            fence_query_throttle: Duration::from_millis(2),
            busy_wait_budget: Duration::from_millis(100),
            max_frame_latency: 3,
            poll_completions: false,
            context_id: 0,
            engine_id: ENGINE_0,
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("ring_entry_count {0} must be a nonzero power of two")]
    BadRingEntryCount(u32),
    #[error("cmd_buffer_bytes {0} cannot hold a stream header")]
    CmdBufferTooSmall(u32),
    #[error("alloc_table_slots must be nonzero")]
    NoAllocSlots,
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_entry_count == 0 || !self.ring_entry_count.is_power_of_two() {
            return Err(ConfigError::BadRingEntryCount(self.ring_entry_count));
        }
        if (self.cmd_buffer_bytes as usize)
            < lyra_protocol::cmd::CmdStreamHeader::SIZE_BYTES + lyra_protocol::cmd::CmdHdr::SIZE_BYTES
        {
            return Err(ConfigError::CmdBufferTooSmall(self.cmd_buffer_bytes));
        }
        if self.alloc_table_slots == 0 {
            return Err(ConfigError::NoAllocSlots);
        }
        Ok(())
    }

    /// Effective allocation-table capacity after the device-advertised clamp.
    pub fn effective_alloc_slots(&self) -> u32 {
        match self.device_max_alloc_slots {
            Some(max) => self.alloc_table_slots.min(max),
            None => self.alloc_table_slots,
        }
    }

    pub fn clamped_frame_latency(&self) -> u32 {
        self.max_frame_latency.clamp(1, 16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(DeviceConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_ring() {
        let cfg = DeviceConfig {
            ring_entry_count: 12,
            ..DeviceConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::BadRingEntryCount(12)));
    }

    #[test]
    fn device_clamp_applies() {
        let cfg = DeviceConfig {
            alloc_table_slots: 256,
            device_max_alloc_slots: Some(16),
            ..DeviceConfig::default()
        };
        assert_eq!(cfg.effective_alloc_slots(), 16);
    }

    #[test]
    fn frame_latency_is_clamped() {
        let cfg = DeviceConfig {
            max_frame_latency: 0,
            ..DeviceConfig::default()
        };
        assert_eq!(cfg.clamped_frame_latency(), 1);
        let cfg = DeviceConfig {
            max_frame_latency: 99,
            ..DeviceConfig::default()
        };
        assert_eq!(cfg.clamped_frame_latency(), 16);
    }
}
