//! AFF4 evidence volumes: a resolver of RDF style triples over zip
//! containers holding segments, chunked images, maps, links and encrypted
//! streams.

pub mod acquire;
pub mod backing;
pub mod buf;
pub mod cli;
pub mod crypto;
pub mod error;
pub mod hash;
pub mod identity;
pub mod object;
pub mod resolver;
pub mod spill;
pub mod stream;
pub mod urn;
pub mod volume;
pub mod zip;

pub use error::{Aff4Error, Result};
pub use resolver::{Handle, Mode, Resolver};
pub use stream::Stream;
