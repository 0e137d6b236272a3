/// Domain-level abstractions shared by the client and server layers.
mod transport;

pub use transport::{
    //
    Connector,
    Transport,
    TransportEvent,
    TransportInbox,
    TransportMeta,
    TransportPtr,
};
