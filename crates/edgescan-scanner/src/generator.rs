//! Smart candidate generator
//!
//! Draws random addresses from a set of CIDR ranges with an exploit/explore
//! policy: 40% of draws (when any priority subnet matches the requested
//! family) come from a narrow subnet around a previously successful
//! candidate, the rest from the full range set. Addresses inside the same
//! /24 tend to land on the same edge PoP, so the bias converges on
//! productive neighborhoods without locking in.

use edgescan_core::IpVersion;
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::trace;

/// Probability of drawing from a priority subnet when one is available
const EXPLOIT_PROBABILITY: f64 = 0.4;

/// Address returned when the filtered range set is empty or malformed
const FALLBACK_ADDR: Ipv4Addr = Ipv4Addr::new(1, 1, 1, 1);

#[derive(Debug, Default)]
struct GeneratorState {
    priority: Vec<IpNetwork>,
    seen_priority: HashSet<IpNetwork>,
    tried: u64,
}

/// Stateful lazy candidate producer
///
/// Shared between the scheduler's feed (draws) and its workers
/// (success reports); internally synchronized, so it hangs off an `Arc`.
/// The priority set only grows during a scan and is discarded with the
/// generator at scan end.
#[derive(Debug)]
pub struct SmartIpGenerator {
    ranges: Vec<IpNetwork>,
    state: Mutex<GeneratorState>,
}

impl SmartIpGenerator {
    pub fn new(ranges: Vec<IpNetwork>) -> Self {
        Self {
            ranges,
            state: Mutex::new(GeneratorState::default()),
        }
    }

    /// Number of draws performed so far
    pub fn tried_count(&self) -> u64 {
        self.state.lock().tried
    }

    /// Number of distinct priority subnets learned so far
    pub fn priority_len(&self) -> usize {
        self.state.lock().priority.len()
    }

    /// Draw the next candidate address for the requested family
    pub fn draw(&self, family: IpVersion) -> IpAddr {
        let mut rng = rand::thread_rng();
        let mut state = self.state.lock();
        state.tried += 1;

        // Exploit a known-good neighborhood 40% of the time
        if rng.gen::<f64>() < EXPLOIT_PROBABILITY {
            let matching: Vec<IpNetwork> = state
                .priority
                .iter()
                .filter(|net| family_matches(net, family))
                .copied()
                .collect();
            if let Some(net) = pick(&matching, &mut rng) {
                trace!("exploit draw from {}", net);
                return random_addr_in(&net, &mut rng);
            }
        }

        // Default: explore the full range set
        let matching: Vec<IpNetwork> = self
            .ranges
            .iter()
            .filter(|net| family_matches(net, family))
            .copied()
            .collect();
        match pick(&matching, &mut rng) {
            Some(net) => random_addr_in(&net, &mut rng),
            None => IpAddr::V4(FALLBACK_ADDR),
        }
    }

    /// Record a proven-good address, widening it to its /24 (v4) or /120 (v6)
    pub fn report_success(&self, ip: IpAddr) {
        let subnet = match enclosing_subnet(ip) {
            Some(net) => net,
            None => return,
        };
        let mut state = self.state.lock();
        if state.seen_priority.insert(subnet) {
            trace!("priority subnet added: {}", subnet);
            state.priority.push(subnet);
        }
    }
}

fn family_matches(net: &IpNetwork, family: IpVersion) -> bool {
    match family {
        IpVersion::Ipv4 => matches!(net, IpNetwork::V4(_)),
        IpVersion::Ipv6 => matches!(net, IpNetwork::V6(_)),
        IpVersion::All => true,
    }
}

fn pick<R: Rng>(nets: &[IpNetwork], rng: &mut R) -> Option<IpNetwork> {
    if nets.is_empty() {
        None
    } else {
        Some(nets[rng.gen_range(0..nets.len())])
    }
}

/// Uniformly random address inside a network
fn random_addr_in<R: Rng>(net: &IpNetwork, rng: &mut R) -> IpAddr {
    match net {
        IpNetwork::V4(v4) => {
            let host_bits = 32 - v4.prefix();
            let base = u32::from(v4.network());
            let offset = if host_bits == 0 {
                0
            } else {
                rng.gen_range(0..(1u64 << host_bits)) as u32
            };
            IpAddr::V4(Ipv4Addr::from(base.wrapping_add(offset)))
        }
        IpNetwork::V6(v6) => {
            let host_bits = 128 - v6.prefix();
            let base = u128::from(v6.network());
            let offset = if host_bits == 0 {
                0
            } else if host_bits >= 128 {
                rng.gen::<u128>()
            } else {
                rng.gen_range(0..(1u128 << host_bits))
            };
            IpAddr::V6(Ipv6Addr::from(base.wrapping_add(offset)))
        }
    }
}

/// The /24 (v4) or /120 (v6) containing `ip`, normalized to its network base
fn enclosing_subnet(ip: IpAddr) -> Option<IpNetwork> {
    match ip {
        IpAddr::V4(v4) => {
            let raw = Ipv4Network::new(v4, 24).ok()?;
            Ipv4Network::new(raw.network(), 24).ok().map(IpNetwork::V4)
        }
        IpAddr::V6(v6) => {
            let raw = Ipv6Network::new(v6, 120).ok()?;
            Ipv6Network::new(raw.network(), 120).ok().map(IpNetwork::V6)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gen_with(ranges: &[&str]) -> SmartIpGenerator {
        SmartIpGenerator::new(ranges.iter().map(|r| r.parse().unwrap()).collect())
    }

    #[test]
    fn test_draw_stays_in_ranges() {
        let generator = gen_with(&["104.16.0.0/13", "172.64.0.0/13"]);
        let nets: Vec<IpNetwork> = ["104.16.0.0/13", "172.64.0.0/13"]
            .iter()
            .map(|r| r.parse().unwrap())
            .collect();

        for _ in 0..500 {
            let ip = generator.draw(IpVersion::Ipv4);
            assert!(nets.iter().any(|n| n.contains(ip)), "{} out of range", ip);
        }
        assert_eq!(generator.tried_count(), 500);
    }

    #[test]
    fn test_empty_priority_never_exploited() {
        // With no reported successes every draw must come from the range set
        let generator = gen_with(&["198.51.100.0/24"]);
        let net: IpNetwork = "198.51.100.0/24".parse().unwrap();
        for _ in 0..1000 {
            assert!(net.contains(generator.draw(IpVersion::Ipv4)));
        }
        assert_eq!(generator.priority_len(), 0);
    }

    #[test]
    fn test_family_filter() {
        let generator = gen_with(&["104.16.0.0/13", "2606:4700::/32"]);
        for _ in 0..100 {
            assert!(generator.draw(IpVersion::Ipv4).is_ipv4());
            assert!(generator.draw(IpVersion::Ipv6).is_ipv6());
        }
    }

    #[test]
    fn test_empty_filtered_set_falls_back() {
        let generator = gen_with(&["104.16.0.0/13"]);
        let ip = generator.draw(IpVersion::Ipv6);
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)));
    }

    #[test]
    fn test_report_success_widens_to_slash24() {
        let generator = gen_with(&["104.16.0.0/13"]);
        generator.report_success("104.17.5.77".parse().unwrap());
        assert_eq!(generator.priority_len(), 1);

        // Same /24 twice stays one entry
        generator.report_success("104.17.5.200".parse().unwrap());
        assert_eq!(generator.priority_len(), 1);

        generator.report_success("104.18.0.1".parse().unwrap());
        assert_eq!(generator.priority_len(), 2);
    }

    #[test]
    fn test_priority_monotonic_bound() {
        let generator = gen_with(&["104.16.0.0/13"]);
        for i in 0..50u8 {
            generator.report_success(IpAddr::V4(Ipv4Addr::new(104, 16, i, 1)));
        }
        assert!(generator.priority_len() <= 50);
    }

    #[test]
    fn test_ipv6_priority_width() {
        let generator = gen_with(&["2606:4700::/32"]);
        generator.report_success("2606:4700::1234".parse().unwrap());
        generator.report_success("2606:4700::12ff".parse().unwrap());
        // ::1234 and ::12ff share a /120
        assert_eq!(generator.priority_len(), 1);
    }

    #[test]
    fn test_exploit_fraction_close_to_configured() {
        // All priority draws land in 104.17.5.0/24, exploration elsewhere,
        // so the fraction of draws inside the priority /24 estimates the
        // exploit probability.
        let generator = gen_with(&["104.16.0.0/13"]);
        generator.report_success("104.17.5.1".parse().unwrap());
        let priority: IpNetwork = "104.17.5.0/24".parse().unwrap();

        const N: usize = 10_000;
        let mut hits = 0usize;
        for _ in 0..N {
            if priority.contains(generator.draw(IpVersion::Ipv4)) {
                hits += 1;
            }
        }
        let fraction = hits as f64 / N as f64;
        // Explore draws land in the /24 with probability 2^-11, negligible
        assert!(
            (fraction - EXPLOIT_PROBABILITY).abs() < 0.02,
            "exploit fraction {} outside tolerance",
            fraction
        );
    }

    #[test]
    fn test_exploit_skips_wrong_family_priority() {
        // A v6 request must not burn its exploit draw on v4 priority entries
        let generator = gen_with(&["2606:4700::/32"]);
        generator.report_success("104.17.5.1".parse().unwrap());
        for _ in 0..200 {
            assert!(generator.draw(IpVersion::Ipv6).is_ipv6());
        }
    }
}
