//! Global configuration
use crate::orchestrator::StageId;
use crate::random::RandomVariable;
use crate::simulator::Time;

use failure::{bail, format_err, Error};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Number of bytes in every request payload
    pub pkt_size: u64,
    /// Largest segment a payload is split into on the wire
    #[serde(default = "default_mss")]
    pub mss: u64,
    /// How long should we simulate (if not given, simulate till no more events occur)
    pub sim_dur: Option<Time>,
    /// Random seed for reproducibility.
    pub random_seed: u64,
    /// Port on which every leaf's receiver listens for responses
    pub sink_port: u16,
    pub topo: ConfigTopo,
    pub chain: ConfigChain,
    pub client: ConfigClient,
    pub log: ConfigLog,
}

fn default_mss() -> u64 {
    1440
}

/// Shape of the tree and its links
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigTopo {
    /// Nodes per group in each tier, root first. Must start with 1
    pub fanouts: Vec<usize>,
    /// Link rate between tier `i` and `i + 1`, e.g. "10Gbps"
    pub bandwidths: Vec<String>,
    /// Propagation delay between tier `i` and `i + 1`, e.g. "5ms"
    pub delays: Vec<String>,
}

/// Parsed parameters of the links between two adjacent tiers
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LinkParams {
    /// Bits per second
    pub rate: f64,
    pub delay: Time,
}

impl ConfigTopo {
    /// One entry per link tier, indexed by the upper tier
    pub fn links(&self) -> Result<Vec<LinkParams>, Error> {
        let n_links = self.fanouts.len().saturating_sub(1);
        if self.bandwidths.len() != n_links || self.delays.len() != n_links {
            bail!(
                "Expected {} bandwidths and delays for {} tiers, got {} and {}",
                n_links,
                self.fanouts.len(),
                self.bandwidths.len(),
                self.delays.len()
            );
        }
        self.bandwidths
            .iter()
            .zip(self.delays.iter())
            .map(|(rate, delay)| {
                Ok(LinkParams {
                    rate: parse_rate(rate)?,
                    delay: parse_delay(delay)?,
                })
            })
            .collect()
    }
}

/// Mean service time of a stage, either the same on every tier or one value per tier
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceMeans {
    Uniform(f64),
    PerTier(Vec<f64>),
}

impl ServiceMeans {
    pub fn for_tier(&self, tier: usize) -> Option<f64> {
        match self {
            Self::Uniform(mean) => Some(*mean),
            Self::PerTier(means) => means.get(tier).copied(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageConfig {
    /// Base mean service time in microseconds, before contention scaling
    pub service_means: ServiceMeans,
    /// Port the stage's instances listen on
    pub port: u16,
}

/// The service chain and where it runs
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigChain {
    pub stages: Vec<StageConfig>,
    /// Directed edges (from, to) between stage indices
    pub links: Vec<(StageId, StageId)>,
    /// Tier of every stage, indexed by stage
    pub placement: Vec<usize>,
    /// When the servers start accepting work
    pub start: Time,
    /// When the servers are torn down
    pub stop: Time,
}

/// The request generators on the leaves
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigClient {
    /// Think time between two requests, in microseconds
    pub off_time: RandomVariable,
    pub start: Time,
    pub stop: Time,
    /// Stop sending after this many bytes. No limit if not given
    #[serde(default)]
    pub max_bytes: Option<u64>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub enum LogType {
    /// Ignore these values whenever they are seen
    Ignore,
    /// Aggregate the values into the end-of-run summary
    Summary,
    /// Emit every value as a trace record, don't aggregate it
    Trace,
    /// Aggregate and emit trace records
    SummaryTrace,
}

impl LogType {
    /// Whether we should aggregate the value
    pub fn summarize(self) -> bool {
        self == LogType::Summary || self == LogType::SummaryTrace
    }

    /// Whether we should emit a trace record for the value
    pub fn trace(self) -> bool {
        self == LogType::Trace || self == LogType::SummaryTrace
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigLog {
    /// End-to-end latency seen by the receivers
    pub latency: LogType,
    /// Service times sampled by the servers
    pub service_time: LogType,
    /// Backlog length changes at the servers
    pub queue_depth: LogType,
    /// Per-hop send and receive records
    pub hops: LogType,
}

impl Config {
    /// Checks everything that can be checked without building the tree
    pub fn validate(&self) -> Result<(), Error> {
        if self.pkt_size == 0 {
            bail!("pkt_size must be positive");
        }
        if self.mss == 0 {
            bail!("mss must be positive");
        }
        self.client.off_time.validate()?;
        if self.chain.start > self.chain.stop {
            bail!(
                "Servers stop ({:?}) before they start ({:?})",
                self.chain.stop,
                self.chain.start
            );
        }
        if self.client.start > self.client.stop {
            bail!(
                "Clients stop ({:?}) before they start ({:?})",
                self.client.stop,
                self.client.start
            );
        }
        self.topo.links()?;
        Ok(())
    }
}

/// Splits "10ms" into (10.0, "ms")
fn split_unit(s: &str) -> Result<(f64, &str), Error> {
    let s = s.trim();
    let idx = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == 'e' || c == '-' || c == '+'))
        .unwrap_or_else(|| s.len());
    let (num, unit) = s.split_at(idx);
    let value = num
        .parse::<f64>()
        .map_err(|_| format_err!("'{}' does not start with a number", s))?;
    if !(value >= 0.) {
        bail!("'{}' must not be negative", s);
    }
    Ok((value, unit.trim()))
}

/// Parses delays such as "10ms", "250us", "2s" or "500ns"
pub fn parse_delay(s: &str) -> Result<Time, Error> {
    let (value, unit) = split_unit(s)?;
    let micros = match unit {
        "s" => value * 1e6,
        "ms" => value * 1e3,
        "us" => value,
        "ns" => value / 1e3,
        _ => bail!("Unknown delay unit in '{}'", s),
    };
    Ok(Time::from_micros_f64(micros))
}

/// Parses data rates such as "40Gbps", "1Mb/s" or "9600bps" into bits per second
pub fn parse_rate(s: &str) -> Result<f64, Error> {
    let (value, unit) = split_unit(s)?;
    let unit = unit.replace("b/s", "bps");
    let rate = match unit.as_str() {
        "bps" => value,
        "kbps" | "Kbps" => value * 1e3,
        "Mbps" => value * 1e6,
        "Gbps" => value * 1e9,
        "Bps" => value * 8.,
        "KBps" | "kBps" => value * 8e3,
        "MBps" => value * 8e6,
        "GBps" => value * 8e9,
        _ => bail!("Unknown rate unit in '{}'", s),
    };
    if rate <= 0. {
        bail!("Rate '{}' must be positive", s);
    }
    Ok(rate)
}

#[cfg(test)]
pub(crate) fn example() -> Config {
    Config {
        pkt_size: 2000,
        mss: 1440,
        sim_dur: Some(Time::from_secs(2)),
        random_seed: 1,
        sink_port: 8080,
        topo: ConfigTopo {
            fanouts: vec![1, 2, 2],
            bandwidths: vec!["1Gbps".into(), "100Mbps".into()],
            delays: vec!["5ms".into(), "1ms".into()],
        },
        chain: ConfigChain {
            stages: vec![
                StageConfig {
                    service_means: ServiceMeans::Uniform(50.),
                    port: 9000,
                },
                StageConfig {
                    service_means: ServiceMeans::PerTier(vec![20., 30., 40.]),
                    port: 9001,
                },
            ],
            links: vec![(1, 0)],
            placement: vec![0, 1],
            start: Time::ZERO,
            stop: Time::from_secs(2),
        },
        client: ConfigClient {
            off_time: RandomVariable::Const(1_000.),
            start: Time::from_millis(1),
            stop: Time::from_millis(20),
            max_bytes: None,
        },
        log: ConfigLog {
            latency: LogType::Summary,
            service_time: LogType::Summary,
            queue_depth: LogType::Summary,
            hops: LogType::Ignore,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays() {
        assert_eq!(parse_delay("10ms").unwrap(), Time::from_millis(10));
        assert_eq!(parse_delay("2s").unwrap(), Time::from_secs(2));
        assert_eq!(parse_delay("250us").unwrap(), Time::from_micros(250));
        assert_eq!(parse_delay("1500ns").unwrap(), Time::from_micros(2));
        assert_eq!(parse_delay(" 0.5ms ").unwrap(), Time::from_micros(500));
        assert!(parse_delay("10").is_err());
        assert!(parse_delay("ms").is_err());
        assert!(parse_delay("3 fortnights").is_err());
    }

    #[test]
    fn rates() {
        assert_eq!(parse_rate("40Gbps").unwrap(), 40e9);
        assert_eq!(parse_rate("1Mb/s").unwrap(), 1e6);
        assert_eq!(parse_rate("9600bps").unwrap(), 9600.);
        assert_eq!(parse_rate("2MBps").unwrap(), 16e6);
        assert!(parse_rate("0Gbps").is_err());
        assert!(parse_rate("10furlongs").is_err());
    }

    #[test]
    fn link_vectors_must_match_tiers() {
        let mut config = example();
        assert_eq!(config.topo.links().unwrap().len(), 2);
        config.topo.delays.pop();
        assert!(config.topo.links().is_err());
        assert!(config.validate().is_err());
    }

    #[test]
    fn service_means() {
        assert_eq!(ServiceMeans::Uniform(3.).for_tier(7), Some(3.));
        let per_tier = ServiceMeans::PerTier(vec![1., 2.]);
        assert_eq!(per_tier.for_tier(1), Some(2.));
        assert_eq!(per_tier.for_tier(2), None);
    }

    #[test]
    fn yaml_round_trip_of_the_example() {
        let yaml = r#"
pkt_size: 5096
sim_dur: 190000000
random_seed: 3
sink_port: 8080
topo:
  fanouts: [1, 1, 5, 20]
  bandwidths: ["40Gbps", "10Gbps", "1Gbps"]
  delays: ["10ms", "5ms", "2ms"]
chain:
  stages:
    - service_means: 100.0
      port: 9000
    - service_means: [100.0, 100.0, 100.0, 100.0]
      port: 9001
  links: [[1, 0]]
  placement: [0, 1]
  start: 100000
  stop: 185000000
client:
  off_time:
    Exponential: 1000000.0
  start: 1000000
  stop: 180000000
log:
  latency: Summary
  service_time: SummaryTrace
  queue_depth: Trace
  hops: Ignore
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.mss, 1440);
        assert_eq!(config.client.max_bytes, None);
        assert_eq!(config.chain.stages[0].service_means, ServiceMeans::Uniform(100.));
        assert_eq!(config.chain.stages[1].service_means.for_tier(3), Some(100.));
        assert_eq!(config.chain.links, vec![(1, 0)]);
        assert_eq!(config.client.off_time, RandomVariable::Exponential(1e6));
        assert!(config.log.service_time.trace() && config.log.service_time.summarize());
        assert!(!config.log.queue_depth.summarize());
        config.validate().unwrap();
    }
}
