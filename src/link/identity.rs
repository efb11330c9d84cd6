use std::fmt::{Debug, Formatter};

/// The (system, component) pair identifying one participant on the bus. System ids group
///  components that belong to one physical device; component ids distinguish the services
///  running on it. Neither is unique in any global sense - the bus is many-to-many, and
///  uniqueness is a deployment concern.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Endpoint {
    pub system: u8,
    pub component: u8,
}
impl Endpoint {
    pub const fn new(system: u8, component: u8) -> Endpoint {
        Endpoint { system, component }
    }
}
impl Debug for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}]", self.system, self.component)
    }
}

/// The addressee of a frame. A value of 0 in either field is a wildcard meaning "any", so
///  `Target::BROADCAST` is accepted by every endpoint.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct Target {
    pub system: u8,
    pub component: u8,
}
impl Target {
    pub const BROADCAST: Target = Target { system: 0, component: 0 };

    pub const fn to(endpoint: Endpoint) -> Target {
        Target {
            system: endpoint.system,
            component: endpoint.component,
        }
    }

    /// The wildcard address match rule: every frame accepted by a receiver must be addressed
    ///  either to that receiver or to the broadcast wildcard, per field.
    pub fn accepts(&self, local: Endpoint) -> bool {
        (self.system == 0 || self.system == local.system)
            && (self.component == 0 || self.component == local.component)
    }
}
impl Debug for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}]", self.system, self.component)
    }
}

/// Addressing for the client role: the local endpoint stamped on outgoing frames, and the
///  peer endpoint requests are directed at.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct ClientIdentity {
    pub local: Endpoint,
    pub target: Endpoint,
}
impl ClientIdentity {
    pub const fn new(local: Endpoint, target: Endpoint) -> ClientIdentity {
        ClientIdentity { local, target }
    }
}

/// Addressing for the server role: servers answer whoever asked, so there is no fixed target.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct ServerIdentity {
    pub local: Endpoint,
}
impl ServerIdentity {
    pub const fn new(local: Endpoint) -> ServerIdentity {
        ServerIdentity { local }
    }
}
