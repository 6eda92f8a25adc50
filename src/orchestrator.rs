//! Places a chain of service stages onto tiers of the tree and computes, for every instance of a
//! stage, where it forwards the traffic of each leaf it serves.

use crate::config::{ConfigChain, ServiceMeans};
use crate::simulator::{Addr, Endpoint};
use crate::tree::{NodeId, TreeIndex};

use failure::Fail;
use fnv::FnvHashMap;
use log::{debug, info, warn};

/// Index of a stage in the order stages were added, starting at 0
pub type StageId = usize;

#[derive(Debug, Fail, PartialEq)]
pub enum PlacementError {
    #[fail(display = "No stages were added to the chain")]
    NoStages,
    #[fail(display = "Stage {} does not exist, there are {} stages", _0, _1)]
    UnknownStage(StageId, usize),
    #[fail(display = "Stage {} cannot be chained to itself", _0)]
    SelfChain(StageId),
    #[fail(display = "Placement gives {} tiers for {} stages", _0, _1)]
    PlacementLength(usize, usize),
    #[fail(
        display = "Stage {} is placed at tier {}, but the tree has only {} tiers",
        stage, tier, n_tiers
    )]
    TierOutOfRange {
        stage: StageId,
        tier: usize,
        n_tiers: usize,
    },
    #[fail(display = "Stage {} was never placed", _0)]
    NotPlaced(StageId),
    #[fail(display = "Stage {} has no mean service time for tier {}", stage, tier)]
    MissingMean { stage: StageId, tier: usize },
    #[fail(
        display = "Stage {} has mean service time {} at tier {}, it must be positive",
        stage, mean, tier
    )]
    BadMean {
        stage: StageId,
        tier: usize,
        mean: f64,
    },
    #[fail(
        display = "Stages {} and {} both bind port {} at tier {}",
        first, second, port, tier
    )]
    PortConflict {
        first: StageId,
        second: StageId,
        tier: usize,
        port: u16,
    },
    #[fail(display = "Every stage is chained into by another one, so the chain has no head")]
    NoEntry,
}

/// One stage of the chain, as configured
#[derive(Clone, Debug)]
pub struct ServiceStage {
    pub index: StageId,
    /// Base mean service time in microseconds, before contention scaling
    pub service_means: ServiceMeans,
    /// Port every instance of this stage listens on
    pub port: u16,
    pub tier: Option<usize>,
    /// Stage this one forwards to. `None` for the terminal stage
    pub next: Option<StageId>,
}

/// Maps the primary address of a leaf to the endpoint its traffic goes to next
#[derive(Clone, Debug, Default)]
pub struct ForwardingTable {
    entries: FnvHashMap<Addr, Endpoint>,
}

impl ForwardingTable {
    pub fn insert(&mut self, leaf: Addr, next_hop: Endpoint) {
        let prev = self.entries.insert(leaf, next_hop);
        assert!(prev.is_none(), "leaf {} has two forwarding entries", leaf);
    }

    pub fn lookup(&self, leaf: &Addr) -> Option<Endpoint> {
        self.entries.get(leaf).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[allow(dead_code)]
    pub fn iter(&self) -> impl Iterator<Item = (&Addr, &Endpoint)> {
        self.entries.iter()
    }
}

/// A stage running on one node. Read only once built
#[derive(Clone, Debug)]
pub struct StageInstance {
    pub stage: StageId,
    pub node: NodeId,
    pub tier: usize,
    pub port: u16,
    /// Mean service time in microseconds after scaling by the number of stages sharing the tier
    pub mean_service_time: f64,
    pub next: Option<StageId>,
    pub forwarding: ForwardingTable,
}

impl StageInstance {
    pub fn is_terminal(&self) -> bool {
        self.next.is_none()
    }
}

/// Every stage instance of a finalized chain
#[derive(Debug)]
pub struct Deployment {
    pub instances: Vec<StageInstance>,
    index: FnvHashMap<(StageId, NodeId), usize>,
    pub entry_stage: StageId,
    pub entry_tier: usize,
    pub entry_port: u16,
}

impl Deployment {
    #[allow(dead_code)]
    pub fn instance(&self, stage: StageId, node: NodeId) -> Option<&StageInstance> {
        self.index
            .get(&(stage, node))
            .map(|&i| &self.instances[i])
    }

    /// Where the client on `leaf` sends its requests: the entry stage's instance above it, on
    /// the interface facing the leaf, or the leaf itself if the entry stage runs on the leaves
    pub fn entry_endpoint(&self, tree: &TreeIndex, leaf: NodeId) -> Endpoint {
        let leaf_tier = tree.tier(leaf);
        assert!(self.entry_tier <= leaf_tier);
        let addr = if self.entry_tier == leaf_tier {
            tree.primary_address(leaf)
        } else {
            tree.parent_address(leaf, leaf_tier - self.entry_tier)
        };
        Endpoint::new(addr, self.entry_port)
    }
}

/// Collects stages, their chaining and their placement, then computes the deployment
pub struct Orchestrator<'t> {
    tree: &'t TreeIndex,
    stages: Vec<ServiceStage>,
}

impl<'t> Orchestrator<'t> {
    pub fn new(tree: &'t TreeIndex) -> Self {
        Self {
            tree,
            stages: Vec::new(),
        }
    }

    /// Build from the chain section of the config: add every stage, chain them and place them
    pub fn from_config(tree: &'t TreeIndex, config: &ConfigChain) -> Result<Self, PlacementError> {
        let mut orch = Self::new(tree);
        for stage in &config.stages {
            orch.add_stage(stage.service_means.clone(), stage.port);
        }
        for &(from, to) in &config.links {
            orch.chain(from, to)?;
        }
        orch.set_placement(&config.placement)?;
        Ok(orch)
    }

    pub fn add_stage(&mut self, service_means: ServiceMeans, port: u16) -> StageId {
        let index = self.stages.len();
        self.stages.push(ServiceStage {
            index,
            service_means,
            port,
            tier: None,
            next: None,
        });
        index
    }

    #[allow(dead_code)]
    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    #[allow(dead_code)]
    pub fn stage(&self, index: StageId) -> Option<&ServiceStage> {
        self.stages.get(index)
    }

    fn check_stage(&self, index: StageId) -> Result<(), PlacementError> {
        if index < self.stages.len() {
            Ok(())
        } else {
            Err(PlacementError::UnknownStage(index, self.stages.len()))
        }
    }

    /// Make `from` forward to `to`. A stage has at most one next stage; chaining it again
    /// replaces the earlier edge
    pub fn chain(&mut self, from: StageId, to: StageId) -> Result<(), PlacementError> {
        self.check_stage(from)?;
        self.check_stage(to)?;
        if from == to {
            return Err(PlacementError::SelfChain(from));
        }
        if let Some(prev) = self.stages[from].next.replace(to) {
            debug!(
                "Stage {} chained to {}, replacing its edge to {}",
                from, to, prev
            );
        }
        Ok(())
    }

    /// Tier of every stage, indexed by stage
    pub fn set_placement(&mut self, tiers: &[usize]) -> Result<(), PlacementError> {
        if tiers.len() != self.stages.len() {
            return Err(PlacementError::PlacementLength(
                tiers.len(),
                self.stages.len(),
            ));
        }
        let n_tiers = self.tree.n_tiers();
        if let Some((stage, &tier)) = tiers.iter().enumerate().find(|&(_, &t)| t >= n_tiers) {
            return Err(PlacementError::TierOutOfRange {
                stage,
                tier,
                n_tiers,
            });
        }
        for (stage, &tier) in self.stages.iter_mut().zip(tiers) {
            stage.tier = Some(tier);
        }
        Ok(())
    }

    /// Stages in chain order: the head first, then following the `next` edges. Stages the walk
    /// does not reach follow in index order
    fn chain_order(&self) -> Result<Vec<StageId>, PlacementError> {
        let mut chained_into = vec![false; self.stages.len()];
        for stage in &self.stages {
            if let Some(next) = stage.next {
                chained_into[next] = true;
            }
        }
        let head = chained_into
            .iter()
            .position(|&c| !c)
            .ok_or(PlacementError::NoEntry)?;

        let mut visited = vec![false; self.stages.len()];
        let mut order = Vec::with_capacity(self.stages.len());
        let mut cur = Some(head);
        while let Some(s) = cur {
            if visited[s] {
                break;
            }
            visited[s] = true;
            order.push(s);
            cur = self.stages[s].next;
        }
        order.extend((0..self.stages.len()).filter(|&s| !visited[s]));
        Ok(order)
    }

    /// Freeze the configuration and compute every stage instance
    pub fn finalize(self) -> Result<Deployment, PlacementError> {
        if self.stages.is_empty() {
            return Err(PlacementError::NoStages);
        }
        let tiers = self
            .stages
            .iter()
            .map(|s| s.tier.ok_or(PlacementError::NotPlaced(s.index)))
            .collect::<Result<Vec<usize>, _>>()?;

        // Number of stages sharing each tier, and no two of them on the same port
        let mut process_count = vec![0usize; self.tree.n_tiers()];
        let mut ports: FnvHashMap<(usize, u16), StageId> = Default::default();
        for stage in &self.stages {
            let tier = tiers[stage.index];
            process_count[tier] += 1;
            if let Some(&first) = ports.get(&(tier, stage.port)) {
                return Err(PlacementError::PortConflict {
                    first,
                    second: stage.index,
                    tier,
                    port: stage.port,
                });
            }
            ports.insert((tier, stage.port), stage.index);
        }

        let order = self.chain_order()?;
        self.warn_non_monotonic(&order, &tiers);

        let mut instances = Vec::new();
        let mut index = FnvHashMap::default();
        for &s in order.iter().rev() {
            let stage = &self.stages[s];
            let tier = tiers[s];
            let base = stage
                .service_means
                .for_tier(tier)
                .ok_or(PlacementError::MissingMean { stage: s, tier })?;
            if !(base > 0. && base.is_finite()) {
                return Err(PlacementError::BadMean {
                    stage: s,
                    tier,
                    mean: base,
                });
            }
            let mean_service_time = base * process_count[tier] as f64;

            for node in self.tree.nodes_at(tier) {
                let forwarding = match stage.next {
                    Some(next) => {
                        self.forwarding_table(node, tiers[next], self.stages[next].port)
                    }
                    None => ForwardingTable::default(),
                };
                index.insert((s, node), instances.len());
                instances.push(StageInstance {
                    stage: s,
                    node,
                    tier,
                    port: stage.port,
                    mean_service_time,
                    next: stage.next,
                    forwarding,
                });
            }
            info!(
                "Stage {} placed on {} nodes of tier {} with mean service time {}us",
                s,
                self.tree.nodes_at(tier).len(),
                tier,
                mean_service_time
            );
        }

        let entry_stage = order[0];
        Ok(Deployment {
            instances,
            index,
            entry_stage,
            entry_tier: tiers[entry_stage],
            entry_port: self.stages[entry_stage].port,
        })
    }

    /// Where each leaf below `node` is sent to reach the next stage, placed at `next_tier`
    fn forwarding_table(&self, node: NodeId, next_tier: usize, next_port: u16) -> ForwardingTable {
        let tree = self.tree;
        let tier = tree.tier(node);
        let leaf_tier = tree.leaf_tier();
        let mut table = ForwardingTable::default();
        for leaf in tree.leaves_under(node) {
            let next_hop = if next_tier > tier {
                // Descend to the leaf's own ancestor at the next tier
                tree.primary_address(tree.parent_id(leaf, leaf_tier - next_tier))
            } else if next_tier == tier {
                tree.primary_address(node)
            } else {
                tree.parent_address(node, tier - next_tier)
            };
            table.insert(tree.primary_address(leaf), Endpoint::new(next_hop, next_port));
        }
        table
    }

    fn warn_non_monotonic(&self, order: &[StageId], tiers: &[usize]) {
        let steps: Vec<(usize, usize)> = order
            .iter()
            .filter_map(|&s| self.stages[s].next.map(|n| (tiers[s], tiers[n])))
            .collect();
        let deeper = steps.iter().any(|(a, b)| b > a);
        let shallower = steps.iter().any(|(a, b)| b < a);
        if deeper && shallower {
            warn!(
                "Chain placement {:?} moves both toward and away from the root; forwarding \
                 tables may send traffic back and forth",
                order.iter().map(|&s| tiers[s]).collect::<Vec<_>>()
            );
        }
    }
}
