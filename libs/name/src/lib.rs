//! # dbproxy-name
//!
//! Parsing and naming for managed database instances.
//!
//! ## Instance Name Format
//!
//! Instances are addressed by a fully-qualified resource path:
//!
//! ```text
//! projects/<PROJECT>/locations/<REGION>/clusters/<CLUSTER>/instances/<INSTANCE>
//! ```
//!
//! A leading `/` is accepted. Legacy domain-scoped projects
//! (`example.com:my-project`) are supported.
//!
//! Every parsed name has two derived forms:
//! - the canonical key (the normalized resource path), used to detect
//!   duplicate instances
//! - the short name (`project.region.cluster.instance`), safe to use as a
//!   directory or host name
//!
//! ```
//! use dbproxy_name::InstanceName;
//!
//! let name: InstanceName = "/projects/proj/locations/region/clusters/clust/instances/inst1"
//!     .parse()
//!     .unwrap();
//! assert_eq!(name.short_name(), "proj.region.clust.inst1");
//! ```

mod error;
mod instance;

pub use error::NameError;
pub use instance::InstanceName;
