use crate::base::Network;
use crate::client::{Client, Receiver};
use crate::config::Config;
use crate::orchestrator::{Orchestrator, StageInstance};
use crate::payload::Request;
use crate::random::{RandomStream, RandomVariable};
use crate::server::QueueingServer;
use crate::simulator::*;
use crate::tracer::Tracer;
use crate::tree::{NodeId, TreeIndex};

use failure::Error;
use log::info;

/// Everything that runs on a node, apart from the network itself
enum AppSpec {
    Server(StageInstance),
    Client { leaf: NodeId, remote: Endpoint },
    Receiver { leaf: NodeId },
}

/// Creates the simulation described by `config` on `tree` and returns a Scheduler with every
/// object registered. The network is object 0; it is followed by one server per stage instance,
/// then a client and a receiver per leaf
pub fn create_topology<'a>(
    config: &'a Config,
    tree: &'a TreeIndex,
    tracer: &'a Tracer<'a>,
) -> Result<Scheduler<'a>, Error> {
    let mut sched = Scheduler::default();
    let mut network = Network::new(tree, config.topo.links()?)?;

    let deployment = Orchestrator::from_config(tree, &config.chain)?.finalize()?;
    info!(
        "Clients enter the chain at stage {} on tier {}",
        deployment.entry_stage, deployment.entry_tier
    );

    // Fail now rather than at the first send if the largest request does not fit
    let last_leaf = tree.nodes_at(tree.leaf_tier()).end - 1;
    let addr = tree.primary_address(last_leaf);
    Request {
        node_id: addr,
        actuator_id: Endpoint::new(addr, config.sink_port),
        sent_at: config.client.stop,
        seq: std::u32::MAX as u64,
    }
    .encode(config.pkt_size)?;

    let mut leaf_apps = Vec::new();
    for leaf in tree.nodes_at(tree.leaf_tier()) {
        leaf_apps.push(AppSpec::Client {
            leaf,
            remote: deployment.entry_endpoint(tree, leaf),
        });
        leaf_apps.push(AppSpec::Receiver { leaf });
    }
    let apps = deployment
        .instances
        .into_iter()
        .map(AppSpec::Server)
        .chain(leaf_apps);

    // Decide everybody's ids and bind their ports, which we must do before registering the
    // network
    let network_id = sched.next_obj_id();
    let mut objs_to_reg = Vec::<Box<dyn NetObj + 'a>>::new();
    for (i, app) in apps.enumerate() {
        let id = network_id + 1 + i;
        let stream = id as u64;
        let obj: Box<dyn NetObj + 'a> = match app {
            AppSpec::Server(instance) => {
                network.listen(instance.node, instance.port, id)?;
                tracer.set_label(id, format!("stage{}@n{}", instance.stage, instance.node));
                let service = RandomStream::from_config(
                    &RandomVariable::Exponential(instance.mean_service_time),
                    config.random_seed,
                    stream,
                )?;
                let local = tree.primary_address(instance.node);
                Box::new(QueueingServer::new(
                    instance, local, network_id, service, tracer, config,
                ))
            }
            AppSpec::Client { leaf, remote } => {
                tracer.set_label(id, format!("client@n{}", leaf));
                let off_time = RandomStream::from_config(
                    &config.client.off_time,
                    config.random_seed,
                    stream,
                )?;
                Box::new(Client::new(
                    tree.primary_address(leaf),
                    remote,
                    network_id,
                    off_time,
                    tracer,
                    config,
                ))
            }
            AppSpec::Receiver { leaf } => {
                network.listen(leaf, config.sink_port, id)?;
                tracer.set_label(id, format!("receiver@n{}", leaf));
                Box::new(Receiver::new(leaf, tracer, config))
            }
        };
        objs_to_reg.push(obj);
    }

    // Register the network, then everything else in id order
    tracer.set_label(network_id, "network".to_string());
    assert_eq!(sched.register_obj(Box::new(network)), network_id);
    for obj in objs_to_reg {
        sched.register_obj(obj);
    }
    info!(
        "Created {} objects on a tree of {} nodes",
        sched.next_obj_id(),
        tree.n_nodes()
    );

    Ok(sched)
}
