//! Node identity primitives: aliases, key roles, key pairs, X.509 certificates.
//!
//! Every node owns one [`NodeKey`] per [`KeyRole`]. The signing certificate
//! is self-signed; the agreement certificate is issued by the signing key;
//! the TLS certificate is self-signed with server and client usage.

pub mod alias;
pub mod certificate;
pub mod keypair;
pub mod role;

pub use alias::NodeAlias;
pub use certificate::Certificate;
pub use keypair::NodeKey;
pub use role::{KeyAlgorithm, KeyFileNames, KeyRole};
