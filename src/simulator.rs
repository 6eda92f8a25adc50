//! Common, basic functionality for the simulator.

use crate::tree::NodeId;

use failure::{format_err, Error};
use fnv::FnvHashMap;
use priority_queue::PriorityQueue;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::fmt;
use std::rc::Rc;

/// Time in microseconds
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
pub struct Time(u64);

/// ID for a NetObj, assigned by the scheduler.
pub type NetObjId = usize;

impl std::ops::Add for Time {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Time(self.0 + other.0)
    }
}

impl std::ops::Sub for Time {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        if self < other {
            panic!(
                "Tried to subtract a smaller time ({:?}) from a larger one ({:?})",
                self, other
            );
        }
        Time(self.0 - other.0)
    }
}

impl Time {
    #[allow(dead_code)]
    pub const ZERO: Time = Time(0);

    pub fn from_micros(micros: u64) -> Self {
        Time(micros)
    }

    #[allow(dead_code)]
    pub fn from_millis(millis: u64) -> Self {
        Time(millis * 1_000)
    }

    #[allow(dead_code)]
    pub fn from_secs(secs: u64) -> Self {
        Time(secs * 1_000_000)
    }

    /// Rounds to the nearest microsecond. Negative values clamp to zero
    pub fn from_micros_f64(micros: f64) -> Self {
        if micros <= 0. {
            Time(0)
        } else {
            Time(micros.round() as u64)
        }
    }

    pub fn micros(self) -> u64 {
        self.0
    }

    pub fn secs(self) -> f64 {
        self.0 as f64 / 1e6
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:.6}s", self.secs())
    }
}

/// Address of one interface of a tree node. Interface 1 is the node's primary address
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Addr {
    pub node: NodeId,
    pub iface: u32,
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "n{}.{}", self.node, self.iface)
    }
}

/// An address plus a port; what listeners bind and connections target
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Endpoint {
    pub addr: Addr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: Addr, port: u16) -> Self {
        Self { addr, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// Identifies a directed stream connection
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ConnId {
    pub src: Endpoint,
    pub dest: Endpoint,
}

#[derive(Debug)]
pub enum PacketType {
    /// A piece of a connection's byte stream
    Data(Vec<u8>),
    /// Sent back by the network when nobody listens at `dest`
    Refused,
}

#[derive(Debug)]
pub struct Packet {
    /// Time when the packet was sent
    #[allow(dead_code)]
    pub sent_time: Time,
    pub src: Endpoint,
    pub dest: Endpoint,
    pub ptype: PacketType,
}

impl Packet {
    /// Size of the packet (in bytes)
    pub fn size(&self) -> u64 {
        match &self.ptype {
            PacketType::Data(bytes) => bytes.len() as u64,
            PacketType::Refused => 0,
        }
    }

    pub fn conn(&self) -> ConnId {
        ConnId {
            src: self.src,
            dest: self.dest,
        }
    }
}

/// An object in the network that can receive packets and events. They take object ids of
/// themselves, so it is easy to schedule events on themselves.
pub trait NetObj {
    /// Called when simulation starts. This is an opportunity to schedule any actions
    fn init(&mut self, obj_id: NetObjId, now: Time)
        -> Result<Vec<(Time, NetObjId, Action)>, Error>;
    /// Push a new packet into this object.
    fn push(
        &mut self,
        obj_id: NetObjId,
        from: NetObjId,
        now: Time,
        pkt: Rc<Packet>,
    ) -> Result<Vec<(Time, NetObjId, Action)>, Error>;
    /// Callback for when a scheduled event occurs. 'uid' is the one specified when scheduling the
    /// event. It may be used to identify and keep track of events.
    fn event(
        &mut self,
        obj_id: NetObjId,
        from: NetObjId,
        now: Time,
        uid: u64,
    ) -> Result<Vec<(Time, NetObjId, Action)>, Error>;
}

/// A single action to be taken
#[derive(Debug)]
pub enum Action {
    /// Call `event` on the given object with the given uid
    Event(u64),
    /// Push the given packet onto the given object
    Push(Rc<Packet>),
}

/// A calendar scheduler for a discrete event simulator. NetObjs may provide an event id that
/// they internally keep track of to identify events. This is the central object for the simulator
pub struct Scheduler<'a> {
    /// Current time in simulation
    now: Time,
    /// Every time at which some action is pending, earliest first
    times: PriorityQueue<Time, Reverse<Time>>,
    /// The actions pending at each time, in the order they were scheduled. Format: (from, to,
    /// action), where 'from' is the object that scheduled the action
    action_times: FnvHashMap<Time, Vec<(NetObjId, NetObjId, Action)>>,
    /// The set of all objects that can schedule events on this scheduler
    objs: Vec<Box<dyn NetObj + 'a>>,
}

impl<'a> Default for Scheduler<'a> {
    fn default() -> Self {
        Self {
            now: Time(0),
            times: PriorityQueue::new(),
            action_times: Default::default(),
            objs: Default::default(),
        }
    }
}

impl<'a> Scheduler<'a> {
    /// Schedule the given action now or in the future from `from` to object `obj_id`.
    fn schedule(
        &mut self,
        when: Time,
        from: NetObjId,
        to: NetObjId,
        action: Action,
    ) -> Result<(), Error> {
        if when < self.now {
            return Err(format_err!(
                "Event to be scheduled at time {:?}, which is in the past. Current time is {:?}.",
                when,
                self.now
            ));
        }
        if to >= self.objs.len() {
            return Err(format_err!(
                "Object {} scheduled an action on unregistered object {}",
                from,
                to
            ));
        }

        // If an action has already been scheduled for this time, queue behind it
        if let Some(actions) = self.action_times.get_mut(&when) {
            actions.push((from, to, action));
        } else {
            self.action_times.insert(when, vec![(from, to, action)]);
            self.times.push(when, Reverse(when));
        }

        Ok(())
    }

    /// Get the object ID that will be allocated to the next object that will be registered. We
    /// promise to start from zero and allocate in increments of 1.
    pub fn next_obj_id(&self) -> NetObjId {
        self.objs.len()
    }

    /// Register an object for this scheduler. Only registered objects can register events. Returns
    /// a unique identifier that can be used to refer to this object later. We promise to allocate
    /// in increments of 1.
    pub fn register_obj(&mut self, obj: Box<dyn NetObj + 'a>) -> NetObjId {
        self.objs.push(obj);
        self.objs.len() - 1
    }

    /// Current simulated time
    pub fn now(&self) -> Time {
        self.now
    }

    /// Start simulation. Loop till no more events are scheduled, or till time `till` if given
    pub fn simulate(&mut self, till: Option<Time>) -> Result<(), Error> {
        // We start from time 0
        self.now = Time::from_micros(0);

        // Get all the initial events that have been scheduled
        let mut actions_to_sched = Vec::new();
        for (obj_id, obj) in self.objs.iter_mut().enumerate() {
            for (when, to, action) in obj.init(obj_id, self.now)? {
                actions_to_sched.push((when, obj_id, to, action));
            }
        }
        for (when, from, to, action) in actions_to_sched {
            self.schedule(when, from, to, action)?;
        }

        while let Some((when, _)) = self.times.pop() {
            assert!(self.now <= when);
            if let Some(till) = till {
                if when > till {
                    break;
                }
            }
            self.now = when;
            let actions = self.action_times.remove(&when).unwrap_or_default();

            // Gather all things to be scheduled next in a vec and schedule all of them together.
            // Anything scheduled for `now` lands behind the actions we are running
            let mut actions_to_sched = Vec::new();
            for (from, to, action) in actions {
                // Take the given action
                let new_actions = match action {
                    Action::Event(uid) => self.objs[to].event(to, from, self.now, uid)?,
                    Action::Push(pkt) => self.objs[to].push(to, from, self.now, pkt)?,
                };

                for (when, to1, action) in new_actions {
                    actions_to_sched.push((when, to, to1, action));
                }
            }

            // Schedule any new actions returned in this time-step
            for (when, from, to, action) in actions_to_sched {
                self.schedule(when, from, to, action)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Records every event it sees and optionally reschedules itself
    struct Recorder<'r> {
        seen: &'r RefCell<Vec<(Time, NetObjId, u64)>>,
        initial: Vec<(Time, u64)>,
        /// On this uid, schedule `uid + 100` at the same instant
        chain_on: Option<u64>,
    }

    impl<'r> NetObj for Recorder<'r> {
        fn init(
            &mut self,
            obj_id: NetObjId,
            _now: Time,
        ) -> Result<Vec<(Time, NetObjId, Action)>, Error> {
            Ok(self
                .initial
                .iter()
                .map(|&(when, uid)| (when, obj_id, Action::Event(uid)))
                .collect())
        }

        fn push(
            &mut self,
            _obj_id: NetObjId,
            _from: NetObjId,
            _now: Time,
            _pkt: Rc<Packet>,
        ) -> Result<Vec<(Time, NetObjId, Action)>, Error> {
            Ok(Vec::new())
        }

        fn event(
            &mut self,
            obj_id: NetObjId,
            _from: NetObjId,
            now: Time,
            uid: u64,
        ) -> Result<Vec<(Time, NetObjId, Action)>, Error> {
            self.seen.borrow_mut().push((now, obj_id, uid));
            if self.chain_on == Some(uid) {
                Ok(vec![(now, obj_id, Action::Event(uid + 100))])
            } else {
                Ok(Vec::new())
            }
        }
    }

    #[test]
    fn events_run_in_time_order_and_fifo_within_an_instant() {
        let seen = RefCell::new(Vec::new());
        {
            let mut sched = Scheduler::default();
            sched.register_obj(Box::new(Recorder {
                seen: &seen,
                initial: vec![(Time::from_micros(20), 1), (Time::from_micros(10), 2)],
                chain_on: Some(2),
            }));
            sched.register_obj(Box::new(Recorder {
                seen: &seen,
                initial: vec![(Time::from_micros(10), 3), (Time::from_micros(20), 4)],
                chain_on: None,
            }));
            sched.simulate(None).unwrap();
            assert_eq!(sched.now(), Time::from_micros(20));
        }
        let seen = seen.into_inner();
        let uids: Vec<u64> = seen.iter().map(|&(_, _, uid)| uid).collect();
        // 102 is scheduled for t=10 while t=10 runs, so it goes after 3
        assert_eq!(uids, vec![2, 3, 102, 1, 4]);
        assert_eq!(seen[2].0, Time::from_micros(10));
    }

    #[test]
    fn simulation_stops_after_till() {
        let seen = RefCell::new(Vec::new());
        {
            let mut sched = Scheduler::default();
            sched.register_obj(Box::new(Recorder {
                seen: &seen,
                initial: vec![(Time::from_micros(5), 1), (Time::from_micros(50), 2)],
                chain_on: None,
            }));
            sched.simulate(Some(Time::from_micros(10))).unwrap();
        }
        assert_eq!(seen.into_inner(), vec![(Time::from_micros(5), 0, 1)]);
    }

    struct PastScheduler;

    impl NetObj for PastScheduler {
        fn init(
            &mut self,
            obj_id: NetObjId,
            _now: Time,
        ) -> Result<Vec<(Time, NetObjId, Action)>, Error> {
            Ok(vec![(Time::from_micros(10), obj_id, Action::Event(0))])
        }

        fn push(
            &mut self,
            _: NetObjId,
            _: NetObjId,
            _: Time,
            _: Rc<Packet>,
        ) -> Result<Vec<(Time, NetObjId, Action)>, Error> {
            Ok(Vec::new())
        }

        fn event(
            &mut self,
            obj_id: NetObjId,
            _: NetObjId,
            _: Time,
            _: u64,
        ) -> Result<Vec<(Time, NetObjId, Action)>, Error> {
            Ok(vec![(Time::from_micros(1), obj_id, Action::Event(1))])
        }
    }

    #[test]
    fn scheduling_in_the_past_is_an_error() {
        let mut sched = Scheduler::default();
        sched.register_obj(Box::new(PastScheduler));
        assert!(sched.simulate(None).is_err());
    }

    #[test]
    fn time_conversions() {
        assert_eq!(Time::from_millis(3), Time::from_micros(3_000));
        assert_eq!(Time::from_secs(2).micros(), 2_000_000);
        assert_eq!(Time::from_micros_f64(2.6), Time::from_micros(3));
        assert_eq!(Time::from_micros_f64(-1.), Time::ZERO);
        assert!((Time::from_millis(1500).secs() - 1.5).abs() < 1e-12);
    }
}
