use crate::protocol::CommandKind;
use heapless::Vec;
use serde::{Deserialize, Serialize};

const MAX_SCRIPTED_FAULTS: usize = 8;

// Per-transmission fault rates, loosely matching a congested 2.4 GHz link
const DROP_REPLY_RATE_PERCENT: f32 = 2.0;
const BLACKHOLE_RATE_PERCENT: f32 = 1.0;
const BUSY_RATE_PERCENT: f32 = 1.0;
const REJECT_RATE_PERCENT: f32 = 0.0;

/// How the simulated link misbehaves for one transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkFault {
    /// Command executes, reply is lost.
    DropReply,
    /// Command never reaches the vehicle and nothing comes back.
    Blackhole,
    /// Vehicle answers with an error and does nothing.
    Reject,
    /// Vehicle reports its sensors are not ready and does nothing.
    Busy,
    /// Vehicle acknowledges but does nothing.
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptedFault {
    /// First word of the wire command, `None` matches everything.
    pub keyword: Option<&'static str>,
    pub fault: LinkFault,
    /// Transmissions left to affect; `u32::MAX` never runs out.
    pub remaining: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LinkFaultStats {
    pub total_faults_injected: u32,
    pub scripted_faults: u32,
    pub dropped_replies: u32,
    pub blackholed: u32,
    pub rejected: u32,
    pub busy: u32,
    pub ignored: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkFaultConfig {
    /// Random faults only; scripted faults always apply.
    pub enabled: bool,
    pub drop_reply_rate_percent: f32,
    pub blackhole_rate_percent: f32,
    pub busy_rate_percent: f32,
    pub reject_rate_percent: f32,
    /// Emergency stop is never faulted at random.
    pub spare_emergency: bool,
}

impl Default for LinkFaultConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            drop_reply_rate_percent: DROP_REPLY_RATE_PERCENT,
            blackhole_rate_percent: BLACKHOLE_RATE_PERCENT,
            busy_rate_percent: BUSY_RATE_PERCENT,
            reject_rate_percent: REJECT_RATE_PERCENT,
            spare_emergency: true,
        }
    }
}

/// Scripted and probabilistic link faults for the simulated vehicle.
#[derive(Debug)]
pub struct LinkFaultInjector {
    config: LinkFaultConfig,
    scripted: Vec<ScriptedFault, MAX_SCRIPTED_FAULTS>,
    stats: LinkFaultStats,

    // Linear congruential generator, fixed seed for repeatable runs
    rng_state: u64,
}

impl LinkFaultInjector {
    pub fn new() -> Self {
        Self::new_with_config(LinkFaultConfig::default())
    }

    pub fn new_with_config(config: LinkFaultConfig) -> Self {
        Self {
            config,
            scripted: Vec::new(),
            stats: LinkFaultStats::default(),
            rng_state: 0x1234_5678_9ABC_DEF0,
        }
    }

    /// Affect the next `count` transmissions whose keyword matches.
    /// Returns false when the script table is full.
    pub fn script(&mut self, keyword: Option<&'static str>, fault: LinkFault, count: u32) -> bool {
        self.scripted.push(ScriptedFault { keyword, fault, remaining: count }).is_ok()
    }

    pub fn set_config(&mut self, config: LinkFaultConfig) {
        self.config = config;
    }

    pub fn stats(&self) -> &LinkFaultStats {
        &self.stats
    }

    /// Fault to apply to this transmission, if any.
    pub fn next_fault(&mut self, command: &CommandKind) -> Option<LinkFault> {
        let wire = command.to_wire();
        let keyword = wire.split_whitespace().next().unwrap_or("");

        let scripted = self
            .scripted
            .iter_mut()
            .find(|s| s.remaining > 0 && s.keyword.map_or(true, |k| k == keyword));
        if let Some(script) = scripted {
            if script.remaining != u32::MAX {
                script.remaining -= 1;
            }
            let fault = script.fault;
            self.scripted.retain(|s| s.remaining > 0);
            self.stats.scripted_faults += 1;
            self.count(fault);
            return Some(fault);
        }

        if !self.config.enabled || (self.config.spare_emergency && *command == CommandKind::EmergencyStop) {
            return None;
        }
        let fault = self.roll()?;
        self.count(fault);
        Some(fault)
    }

    fn roll(&mut self) -> Option<LinkFault> {
        let value = self.random_float() * 100.0;
        let bands = [
            (self.config.drop_reply_rate_percent, LinkFault::DropReply),
            (self.config.blackhole_rate_percent, LinkFault::Blackhole),
            (self.config.busy_rate_percent, LinkFault::Busy),
            (self.config.reject_rate_percent, LinkFault::Reject),
        ];
        let mut upper = 0.0;
        for (rate, fault) in bands {
            upper += rate.max(0.0);
            if value < upper {
                return Some(fault);
            }
        }
        None
    }

    fn count(&mut self, fault: LinkFault) {
        self.stats.total_faults_injected += 1;
        match fault {
            LinkFault::DropReply => self.stats.dropped_replies += 1,
            LinkFault::Blackhole => self.stats.blackholed += 1,
            LinkFault::Reject => self.stats.rejected += 1,
            LinkFault::Busy => self.stats.busy += 1,
            LinkFault::Ignore => self.stats.ignored += 1,
        }
    }

    fn next_random(&mut self) -> u64 {
        // Numerical Recipes parameters
        self.rng_state = self.rng_state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        self.rng_state
    }

    fn random_float(&mut self) -> f32 {
        (self.next_random() >> 40) as f32 / (1u64 << 24) as f32
    }
}

impl Default for LinkFaultInjector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_fault_matches_keyword_and_runs_out() {
        let mut injector = LinkFaultInjector::new();
        assert!(injector.script(Some("forward"), LinkFault::DropReply, 2));

        assert_eq!(injector.next_fault(&CommandKind::Land), None);
        assert_eq!(injector.next_fault(&CommandKind::forward(60)), Some(LinkFault::DropReply));
        assert_eq!(injector.next_fault(&CommandKind::forward(60)), Some(LinkFault::DropReply));
        assert_eq!(injector.next_fault(&CommandKind::forward(60)), None);
        assert_eq!(injector.stats().dropped_replies, 2);
    }

    #[test]
    fn test_permanent_script() {
        let mut injector = LinkFaultInjector::new();
        injector.script(None, LinkFault::Blackhole, u32::MAX);
        for _ in 0..20 {
            assert_eq!(injector.next_fault(&CommandKind::Hover), Some(LinkFault::Blackhole));
        }
    }

    #[test]
    fn test_random_faults_respect_rates() {
        let config = LinkFaultConfig {
            enabled: true,
            drop_reply_rate_percent: 10.0,
            blackhole_rate_percent: 0.0,
            busy_rate_percent: 0.0,
            reject_rate_percent: 0.0,
            spare_emergency: true,
        };
        let mut injector = LinkFaultInjector::new_with_config(config);
        let faulted = (0..2000)
            .filter(|_| injector.next_fault(&CommandKind::forward(40)).is_some())
            .count();
        assert!(faulted > 100 && faulted < 300, "faulted {faulted}");
        assert_eq!(injector.next_fault(&CommandKind::EmergencyStop), None);
    }
}
