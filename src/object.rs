//! Everything the resolver can open, and how it decides what to build.

use crate::backing::{Backing, FileBacking, HttpBacking};
use crate::error::{Aff4Error, Result};
use crate::identity::Identity;
use crate::resolver::{Mode, Resolver};
use crate::stream::{Encrypted, ErrorStream, Image, Link, Map, Segment, Stream};
use crate::urn::{attr, types};
use crate::volume::ZipVolume;

pub enum Object {
    File(FileBacking),
    Http(HttpBacking),
    Volume(ZipVolume),
    Segment(Segment),
    Image(Image),
    Map(Map),
    Link(Link),
    Encrypted(Encrypted),
    Error(ErrorStream),
    Identity(Identity),
}

type Constructor = fn(&Resolver, &str, Mode) -> Result<Object>;

enum Matcher {
    Type(&'static str),
    Scheme(&'static str),
}

// Types are tried before schemes
static DISPATCH: &[(Matcher, Constructor)] = &[
    (Matcher::Type(types::SEGMENT), open_segment),
    (Matcher::Type(types::IMAGE), open_image),
    (Matcher::Type(types::MAP), open_map),
    (Matcher::Type(types::LINK), open_link),
    (Matcher::Type(types::ENCRYPTED), open_encrypted),
    (Matcher::Type(types::IDENTITY), open_identity),
    (Matcher::Type(types::ZIP_VOLUME), open_volume),
    (Matcher::Type(types::ERROR), open_error),
    (Matcher::Scheme("file://"), open_file),
    (Matcher::Scheme("http://"), open_http),
    (Matcher::Scheme("https://"), open_http),
];

fn open_segment(r: &Resolver, urn: &str, mode: Mode) -> Result<Object> {
    Segment::open(r, urn, mode).map(Object::Segment)
}

fn open_image(r: &Resolver, urn: &str, mode: Mode) -> Result<Object> {
    Image::open(r, urn, mode).map(Object::Image)
}

fn open_map(r: &Resolver, urn: &str, mode: Mode) -> Result<Object> {
    Map::open(r, urn, mode).map(Object::Map)
}

fn open_link(r: &Resolver, urn: &str, mode: Mode) -> Result<Object> {
    Link::open(r, urn, mode).map(Object::Link)
}

fn open_encrypted(r: &Resolver, urn: &str, mode: Mode) -> Result<Object> {
    Encrypted::open(r, urn, mode).map(Object::Encrypted)
}

fn open_identity(r: &Resolver, urn: &str, mode: Mode) -> Result<Object> {
    Identity::open(r, urn, mode).map(Object::Identity)
}

fn open_volume(r: &Resolver, urn: &str, mode: Mode) -> Result<Object> {
    ZipVolume::open(r, urn, mode).map(Object::Volume)
}

fn open_error(r: &Resolver, urn: &str, mode: Mode) -> Result<Object> {
    ErrorStream::open(r, urn, mode).map(Object::Error)
}

fn open_file(r: &Resolver, urn: &str, mode: Mode) -> Result<Object> {
    FileBacking::open(r, urn, mode).map(Object::File)
}

fn open_http(r: &Resolver, urn: &str, mode: Mode) -> Result<Object> {
    HttpBacking::open(r, urn, mode).map(Object::Http)
}

/// Build a fresh object for `urn` from what the resolver knows about it.
pub fn construct(resolver: &Resolver, urn: &str, mode: Mode) -> Result<Object> {
    let typ = resolver.resolve(urn, attr::TYPE);

    let by_type = DISPATCH.iter().find(|(m, _)| match m {
        Matcher::Type(t) => typ.as_deref() == Some(*t),
        Matcher::Scheme(_) => false,
    });
    let by_scheme = || {
        DISPATCH.iter().find(|(m, _)| match m {
            Matcher::Scheme(s) => urn.starts_with(s),
            Matcher::Type(_) => false,
        })
    };

    match by_type.or_else(by_scheme) {
        Some((_, ctor)) => ctor(resolver, urn, mode),
        None => Err(Aff4Error::NotFound(urn.to_string())),
    }
}

impl Object {
    pub fn urn(&self) -> &str {
        match self {
            Object::File(o) => o.urn(),
            Object::Http(o) => o.urn(),
            Object::Volume(o) => o.urn(),
            Object::Segment(o) => o.urn(),
            Object::Image(o) => o.urn(),
            Object::Map(o) => o.urn(),
            Object::Link(o) => o.urn(),
            Object::Encrypted(o) => o.urn(),
            Object::Error(o) => o.urn(),
            Object::Identity(o) => o.urn(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Object::File(_) => "file",
            Object::Http(_) => "http",
            Object::Volume(_) => types::ZIP_VOLUME,
            Object::Segment(_) => types::SEGMENT,
            Object::Image(_) => types::IMAGE,
            Object::Map(_) => types::MAP,
            Object::Link(_) => types::LINK,
            Object::Encrypted(_) => types::ENCRYPTED,
            Object::Error(_) => types::ERROR,
            Object::Identity(_) => types::IDENTITY,
        }
    }

    /// The byte stream view, volumes and identities have none.
    pub fn stream(&mut self) -> Result<&mut dyn Stream> {
        match self {
            Object::File(o) => Ok(o),
            Object::Http(o) => Ok(o),
            Object::Segment(o) => Ok(o),
            Object::Image(o) => Ok(o),
            Object::Map(o) => Ok(o),
            Object::Link(o) => Ok(o),
            Object::Encrypted(o) => Ok(o),
            Object::Error(o) => Ok(o),
            other => Err(wrong_type(other.urn(), "stream")),
        }
    }

    pub fn backing(&mut self) -> Result<&mut dyn Backing> {
        match self {
            Object::File(o) => Ok(o),
            Object::Http(o) => Ok(o),
            other => Err(wrong_type(other.urn(), "backing store")),
        }
    }

    pub fn volume(&mut self) -> Result<&mut ZipVolume> {
        match self {
            Object::Volume(o) => Ok(o),
            other => Err(wrong_type(other.urn(), types::ZIP_VOLUME)),
        }
    }

    pub fn image(&mut self) -> Result<&mut Image> {
        match self {
            Object::Image(o) => Ok(o),
            other => Err(wrong_type(other.urn(), types::IMAGE)),
        }
    }

    pub fn map(&mut self) -> Result<&mut Map> {
        match self {
            Object::Map(o) => Ok(o),
            other => Err(wrong_type(other.urn(), types::MAP)),
        }
    }

    pub fn encrypted(&mut self) -> Result<&mut Encrypted> {
        match self {
            Object::Encrypted(o) => Ok(o),
            other => Err(wrong_type(other.urn(), types::ENCRYPTED)),
        }
    }

    pub fn identity(&mut self) -> Result<&mut Identity> {
        match self {
            Object::Identity(o) => Ok(o),
            other => Err(wrong_type(other.urn(), types::IDENTITY)),
        }
    }

    pub fn close(&mut self) -> Result<()> {
        match self {
            Object::Volume(o) => o.close(),
            Object::Identity(o) => o.close(),
            other => other.stream()?.close(),
        }
    }

    pub fn is_dirty(&self) -> bool {
        match self {
            Object::File(o) => o.is_dirty(),
            Object::Http(o) => o.is_dirty(),
            Object::Volume(o) => o.is_dirty(),
            Object::Segment(o) => o.is_dirty(),
            Object::Image(o) => o.is_dirty(),
            Object::Map(o) => o.is_dirty(),
            Object::Link(o) => o.is_dirty(),
            Object::Encrypted(o) => o.is_dirty(),
            Object::Error(o) => o.is_dirty(),
            Object::Identity(o) => o.is_dirty(),
        }
    }
}

fn wrong_type(urn: &str, expected: &'static str) -> Aff4Error {
    Aff4Error::WrongType {
        urn: urn.to_string(),
        expected,
    }
}
