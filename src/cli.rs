use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::Deserialize;

use crate::error::{Aff4Error, Result};
use crate::resolver::{Resolver, DEFAULT_CACHE_SIZE};
use crate::stream::image::{ImageOptions, DEFAULT_CHUNKS_IN_SEGMENT, DEFAULT_CHUNK_SIZE};
use crate::urn::{self, config};

#[derive(Parser)]
#[command(name = "aff4")]
#[command(about = "Forensic image volumes (AFF4 on zip)")]
#[command(author, version, long_about = None)]
pub struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// More logging, repeat for more
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Image files and directories into a volume
    Acquire {
        /// Volume path or URL
        volume: String,

        /// Files or directories to image
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Sign the acquisition with this private key (PEM)
        #[arg(short, long, value_name = "PEM")]
        key: Option<PathBuf>,
    },

    /// Dump everything known about a volume
    Info { volume: String },

    /// List the objects in a volume
    Ls { volume: String },

    /// Write an object's content to stdout
    Cat { volume: String, urn: String },

    /// Check every signed statement in a volume
    Verify { volume: String },

    /// Write a new private key for signing
    Keygen {
        /// Where to write the PEM
        out: PathBuf,

        #[arg(short, long, default_value_t = crate::crypto::DEFAULT_KEY_BITS)]
        bits: usize,
    },
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub threads: u64,
    pub verbosity: u8,
    pub autoload: bool,
    pub pad: bool,
    pub property_style: Option<String>,
    pub max_volume_size: u64,
    pub cache_size: usize,

    pub follow_links: bool,
    pub same_fs: bool,

    pub image: ImageConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ImageConfig {
    pub chunk_size: u64,
    pub chunks_in_segment: u64,
    pub compression: u32,
    pub sha256: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            threads: 1,
            verbosity: 0,
            autoload: true,
            pad: false,
            property_style: None,
            max_volume_size: 0,
            cache_size: DEFAULT_CACHE_SIZE,
            follow_links: false,
            same_fs: true,
            image: ImageConfig::default(),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        ImageConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunks_in_segment: DEFAULT_CHUNKS_IN_SEGMENT,
            compression: 1,
            sha256: false,
        }
    }
}

impl Config {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Aff4Error::format(format!("bad config: {}", e)))
    }

    /// The file at `path`, or the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Config::parse(&std::fs::read_to_string(path)?),
            None => Ok(Config::default()),
        }
    }

    /// Install the knobs on `aff4volatile:global`.
    pub fn apply(&self, resolver: &Resolver) {
        resolver.set(urn::GLOBAL, config::THREADS, self.threads.max(1));
        resolver.set(urn::GLOBAL, config::VERBOSITY, self.verbosity);
        resolver.set(urn::GLOBAL, config::AUTOLOAD, self.autoload as u8);
        resolver.set(urn::GLOBAL, config::PAD, self.pad as u8);
        resolver.set(urn::GLOBAL, config::MAX_VOLUME_SIZE, self.max_volume_size);
        if let Some(style) = &self.property_style {
            resolver.set(urn::GLOBAL, config::PROPERTY_STYLE, style);
        }
    }

    pub fn resolver(&self) -> Resolver {
        let resolver = Resolver::with_cache_size(self.cache_size);
        self.apply(&resolver);
        resolver
    }

    pub fn image_options(&self) -> ImageOptions {
        ImageOptions {
            chunk_size: self.image.chunk_size,
            chunks_in_segment: self.image.chunks_in_segment,
            compression: self.image.compression,
            sha256: self.image.sha256,
        }
    }
}

/// env_logger filter for a verbosity level.
pub fn log_level(verbosity: u8) -> log::LevelFilter {
    match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

#[cfg(test)]
mod test_config {
    use super::*;

    #[test]
    fn defaults_fill_gaps() {
        let config = Config::parse(
            r#"
            threads = 4
            max_volume_size = 1048576

            [image]
                chunk_size = 16
                sha256 = true
        "#,
        )
        .unwrap();

        assert_eq!(config.threads, 4);
        assert!(config.autoload);
        assert_eq!(config.image.chunk_size, 16);
        assert_eq!(config.image.chunks_in_segment, DEFAULT_CHUNKS_IN_SEGMENT);
        assert!(config.image_options().sha256);
    }

    #[test]
    fn apply_sets_globals() {
        let config = Config {
            pad: true,
            property_style: Some("relative".into()),
            ..Config::default()
        };
        let r = config.resolver();

        assert!(r.config_bool(config::PAD));
        assert!(r.config_bool(config::AUTOLOAD));
        assert_eq!(r.config_u64(config::THREADS, 0), 1);
        assert_eq!(r.resolve(urn::GLOBAL, config::PROPERTY_STYLE).as_deref(), Some("relative"));
    }

    #[test]
    fn bad_toml() {
        assert!(Config::parse("threads = \"many\"").is_err());
    }

    #[test]
    fn levels() {
        assert_eq!(log_level(0), log::LevelFilter::Warn);
        assert_eq!(log_level(2), log::LevelFilter::Debug);
        assert_eq!(log_level(9), log::LevelFilter::Trace);
    }
}
