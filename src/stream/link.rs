use std::io::SeekFrom;

use crate::error::{Aff4Error, Result};
use crate::resolver::{Mode, Resolver, WeakResolver};
use crate::stream::{seek_position, Stream};
use crate::urn::{attr, types};

// Links pointing at links, bounded so a loop fails instead of hanging
const MAX_HOPS: usize = 16;

/// An alias, reads are served by `aff4:target`.
pub struct Link {
    urn: String,
    resolver: WeakResolver,
    target: String,
    size: u64,
    readptr: u64,
}

impl Link {
    pub fn open(resolver: &Resolver, urn: &str, _mode: Mode) -> Result<Self> {
        let target = resolve_target(resolver, urn)?;
        let size = resolver.resolve_u64(&target, attr::SIZE).unwrap_or(0);

        Ok(Link {
            urn: urn.to_string(),
            resolver: resolver.downgrade(),
            target,
            size,
            readptr: 0,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

/// Follow links starting at `urn` to the first non link.
pub fn resolve_target(resolver: &Resolver, urn: &str) -> Result<String> {
    let mut current = resolver.require(urn, attr::TARGET)?;
    for _ in 0..MAX_HOPS {
        if resolver.resolve(&current, attr::TYPE).as_deref() != Some(types::LINK) {
            return Ok(current);
        }
        current = resolver.require(&current, attr::TARGET)?;
    }
    Err(Aff4Error::format(format!("{} is part of a link loop", urn)))
}

/// Create `link` pointing at `target`, stored in `volume`.
pub fn create(resolver: &Resolver, volume: &str, link: &str, target: &str) {
    resolver.set(link, attr::TYPE, types::LINK);
    resolver.set(link, attr::STORED, volume);
    resolver.set(link, attr::TARGET, target);
    resolver.add(volume, attr::CONTAINS, link);
}

impl Stream for Link {
    fn urn(&self) -> &str {
        &self.urn
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let resolver = self.resolver.upgrade()?;
        let mut handle = resolver.open(&self.target, Mode::Read)?;
        let target = handle.stream()?;

        target.seek(SeekFrom::Start(self.readptr))?;
        let n = target.read(buf)?;
        self.readptr += n as u64;
        Ok(n)
    }

    fn tell(&self) -> u64 {
        self.readptr
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.readptr = seek_position(self.readptr, self.size, pos)?;
        Ok(self.readptr)
    }
}

#[cfg(test)]
mod test_link {
    use super::*;
    use crate::urn;

    #[test]
    fn reads_through_to_target() {
        let r = Resolver::new();
        create(&r, "urn:aff4:v", "urn:aff4:link", urn::ZERO);
        create(&r, "urn:aff4:v", "urn:aff4:link2", "urn:aff4:link");

        assert_eq!(resolve_target(&r, "urn:aff4:link2").unwrap(), urn::ZERO);

        let mut h = r.open("urn:aff4:link2", Mode::Read).unwrap();
        assert_eq!(h.stream().unwrap().read_to_vec(4).unwrap(), vec![0; 4]);
        assert_eq!(r.resolve_list("urn:aff4:v", attr::CONTAINS).len(), 2);
    }

    #[test]
    fn loops_are_detected() {
        let r = Resolver::new();
        create(&r, "urn:aff4:v", "urn:aff4:a", "urn:aff4:b");
        create(&r, "urn:aff4:v", "urn:aff4:b", "urn:aff4:a");
        assert!(resolve_target(&r, "urn:aff4:a").is_err());
        assert!(r.open("urn:aff4:a", Mode::Read).is_err());
    }
}
