pub mod checksum;
pub mod device;
pub mod icmp;
pub mod ipv4_header;
pub mod pnet_device;
pub mod route;

pub use device::{HeaderBuildResult, NetDevice, OutFrame, TxPriority};
pub use ipv4_header::{Ipv4Header, SourceRoute};
pub use route::{Route, RouteLookup, StaticRouteTable};
